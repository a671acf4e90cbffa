use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    gateway::CheckoutGateway,
    services::{
        catalog::CatalogService, checkout::CheckoutService, finalization::FinalizationService,
        inventory::InventoryService, orders::OrderService,
        reconciliation::ReconciliationService, refunds::RefundService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    gateway: Arc<dyn CheckoutGateway>,
    config: AppConfig,
}

impl ServiceFactory {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<EventSender>,
        gateway: Arc<dyn CheckoutGateway>,
        config: AppConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender: event_sender.map(Arc::new),
            gateway,
            config,
        }
    }

    pub fn catalog_service(&self) -> CatalogService {
        CatalogService::new(self.db_pool.clone())
    }

    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(self.db_pool.clone())
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(self.db_pool.clone(), self.event_sender.clone())
            .with_currency(self.config.gateway.currency.clone())
    }

    pub fn checkout_service(&self) -> CheckoutService {
        CheckoutService::new(
            self.db_pool.clone(),
            self.gateway.clone(),
            self.config.gateway.clone(),
        )
    }

    pub fn finalization_service(&self) -> FinalizationService {
        FinalizationService::new(
            self.db_pool.clone(),
            self.gateway.clone(),
            self.event_sender.clone(),
        )
        .with_low_stock_threshold(self.config.inventory.default_low_stock_threshold)
    }

    pub fn refund_service(&self) -> RefundService {
        RefundService::new(
            self.db_pool.clone(),
            self.gateway.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn reconciliation_service(&self) -> ReconciliationService {
        ReconciliationService::new(
            self.db_pool.clone(),
            self.finalization_service(),
            self.gateway.clone(),
            self.config.reconciliation.clone(),
        )
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub catalog: Arc<CatalogService>,
    pub inventory: Arc<InventoryService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub finalization: Arc<FinalizationService>,
    pub refunds: Arc<RefundService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl ServiceContainer {
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            catalog: Arc::new(factory.catalog_service()),
            inventory: Arc::new(factory.inventory_service()),
            orders: Arc::new(factory.order_service()),
            checkout: Arc::new(factory.checkout_service()),
            finalization: Arc::new(factory.finalization_service()),
            refunds: Arc::new(factory.refund_service()),
            reconciliation: Arc::new(factory.reconciliation_service()),
        }
    }
}
