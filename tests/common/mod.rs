#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_orders::{
    common::Address,
    config::{AppConfig, GatewayConfig},
    db::{self, DbConfig, DbPool},
    entities::{
        order::Model as OrderModel,
        order_payment_event::{self, Model as PaymentEventModel},
        product::{self, Model as ProductModel},
        product_stock_event::{self, Model as StockEventModel},
        product_variant::{self, Model as VariantModel},
    },
    events::{Event, EventSender},
    gateway::{
        CancelRequest, CheckoutGateway, CheckoutSession, GatewayError, GatewayRefund,
        InitiateRequest, PaymentRetrieval, RefundByPaymentIdRequest, RefundRequest,
    },
    services::{
        catalog::CatalogService,
        checkout::CheckoutService,
        finalization::FinalizationService,
        inventory::InventoryService,
        orders::{BuyerIdentity, CartLine, CreatedOrder, OrderService},
        reconciliation::ReconciliationService,
        refunds::RefundService,
    },
    ServiceFactory,
};

/// Gateway double with scripted responses and call logging.
///
/// Retrievals are sticky per token or payment id so concurrent finalize calls
/// all see the same answer. Refund and cancel responses are consumed in order;
/// an empty queue answers with a decline.
#[derive(Default)]
pub struct ScriptedGateway {
    sessions: Mutex<VecDeque<Result<CheckoutSession, GatewayError>>>,
    retrievals: Mutex<HashMap<String, Result<PaymentRetrieval, GatewayError>>>,
    refunds: Mutex<VecDeque<Result<GatewayRefund, GatewayError>>>,
    cancels: Mutex<VecDeque<Result<GatewayRefund, GatewayError>>>,
    v2_refunds: Mutex<VecDeque<Result<GatewayRefund, GatewayError>>>,
    calls: Mutex<Vec<String>>,
    retrieve_count: AtomicUsize,
}

impl ScriptedGateway {
    pub fn push_session(&self, token: &str) {
        self.sessions.lock().unwrap().push_back(Ok(CheckoutSession {
            token: token.to_string(),
            checkout_form_content: Some("<script></script>".to_string()),
            payment_page_url: Some(format!("https://pay.example.com/{}", token)),
        }));
    }

    pub fn push_session_error(&self, err: GatewayError) {
        self.sessions.lock().unwrap().push_back(Err(err));
    }

    pub fn set_retrieval(&self, key: &str, response: Result<PaymentRetrieval, GatewayError>) {
        self.retrievals
            .lock()
            .unwrap()
            .insert(key.to_string(), response);
    }

    pub fn push_refund(&self, response: Result<GatewayRefund, GatewayError>) {
        self.refunds.lock().unwrap().push_back(response);
    }

    pub fn push_cancel(&self, response: Result<GatewayRefund, GatewayError>) {
        self.cancels.lock().unwrap().push_back(response);
    }

    pub fn push_v2_refund(&self, response: Result<GatewayRefund, GatewayError>) {
        self.v2_refunds.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn retrieve_count(&self) -> usize {
        self.retrieve_count.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn retrieval(&self, key: &str) -> Result<PaymentRetrieval, GatewayError> {
        self.retrieve_count.fetch_add(1, Ordering::SeqCst);
        self.retrievals
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or(Err(GatewayError::Http {
                status: 404,
                body: "unknown".to_string(),
            }))
    }

    fn next(queue: &Mutex<VecDeque<Result<GatewayRefund, GatewayError>>>) -> Result<GatewayRefund, GatewayError> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(refund_declined("not scripted")))
    }
}

#[async_trait]
impl CheckoutGateway for ScriptedGateway {
    async fn initiate(&self, request: &InitiateRequest) -> Result<CheckoutSession, GatewayError> {
        request.validate()?;
        self.log(format!("initiate:{}", request.basket_id));
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(GatewayError::Rejected {
                code: Some("NOT_SCRIPTED".to_string()),
                message: "no session scripted".to_string(),
                group: None,
            }))
    }

    async fn retrieve_by_token(&self, token: &str) -> Result<PaymentRetrieval, GatewayError> {
        self.log(format!("retrieve_token:{}", token));
        self.retrieval(token)
    }

    async fn retrieve_by_payment_id(&self, payment_id: &str) -> Result<PaymentRetrieval, GatewayError> {
        self.log(format!("retrieve_payment:{}", payment_id));
        self.retrieval(payment_id)
    }

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayError> {
        self.log(format!("refund:{}:{}", request.payment_transaction_id, request.amount));
        Self::next(&self.refunds)
    }

    async fn cancel(&self, request: &CancelRequest) -> Result<GatewayRefund, GatewayError> {
        self.log(format!("cancel:{}", request.payment_id));
        Self::next(&self.cancels)
    }

    async fn refund_by_payment_id(
        &self,
        request: &RefundByPaymentIdRequest,
    ) -> Result<GatewayRefund, GatewayError> {
        self.log(format!("refund_v2:{}:{}", request.payment_id, request.amount));
        Self::next(&self.v2_refunds)
    }
}

/// Gateway success payload for a checkout-form retrieval.
pub fn paid_retrieval(
    order_id: Uuid,
    token: &str,
    paid_price: &str,
    payment_id: &str,
    items: &[(&str, &str)],
) -> PaymentRetrieval {
    let transactions: Vec<Value> = items
        .iter()
        .map(|(id, price)| json!({ "paymentTransactionId": id, "paidPrice": price, "price": price }))
        .collect();
    PaymentRetrieval::from_wire(json!({
        "status": "success",
        "paymentStatus": "SUCCESS",
        "paymentId": payment_id,
        "conversationId": order_id.to_string(),
        "basketId": order_id.to_string(),
        "token": token,
        "paidPrice": paid_price,
        "currency": "TRY",
        "itemTransactions": transactions,
    }))
    .unwrap()
}

pub fn declined_retrieval(order_id: Uuid, token: &str, code: &str) -> PaymentRetrieval {
    PaymentRetrieval::from_wire(json!({
        "status": "success",
        "paymentStatus": "FAILURE",
        "conversationId": order_id.to_string(),
        "basketId": order_id.to_string(),
        "token": token,
        "errorCode": code,
        "errorMessage": "Card declined",
        "errorGroup": "NOT_SUFFICIENT_FUNDS",
    }))
    .unwrap()
}

pub fn refund_ok(reference: &str) -> GatewayRefund {
    GatewayRefund::from_wire(json!({ "status": "success", "paymentTransactionId": reference }))
}

pub fn refund_declined(message: &str) -> GatewayRefund {
    GatewayRefund::from_wire(json!({ "status": "failure", "errorCode": "5092", "errorMessage": message }))
}

pub fn address() -> Address {
    Address {
        contact_name: "Ayse Yilmaz".to_string(),
        city: "Istanbul".to_string(),
        country: "Turkey".to_string(),
        address: "Nidakule Goztepe, Merdivenkoy Mah.".to_string(),
        zip_code: Some("34732".to_string()),
    }
}

pub fn buyer() -> BuyerIdentity {
    BuyerIdentity {
        customer_id: Some(Uuid::new_v4()),
        name: "Ayse".to_string(),
        surname: "Yilmaz".to_string(),
        email: "ayse@example.com".to_string(),
        phone: "+905350000000".to_string(),
        identity_number: "74300864791".to_string(),
        ip: "85.34.78.112".to_string(),
        billing_address: None,
    }
}

/// Services over a fresh migrated in-memory database.
pub struct TestEngine {
    pub db: Arc<DbPool>,
    pub gateway: Arc<ScriptedGateway>,
    pub catalog: CatalogService,
    pub orders: OrderService,
    pub checkout: CheckoutService,
    pub finalization: FinalizationService,
    pub refunds: RefundService,
    pub inventory: InventoryService,
    pub reconciliation: ReconciliationService,
    pub events: mpsc::Receiver<Event>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("sqlite connection");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let mut config = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        config.gateway = GatewayConfig {
            callback_url: "https://shop.example.com/payment/callback".to_string(),
            ..GatewayConfig::default()
        };
        config.reconciliation.backoff_base_secs = 1;
        config.reconciliation.backoff_max_secs = 2;
        tweak(&mut config);

        let gateway = Arc::new(ScriptedGateway::default());
        let (event_sender, events) = EventSender::channel(256);
        let factory = ServiceFactory::new(
            db.clone(),
            Some(event_sender),
            gateway.clone() as Arc<dyn CheckoutGateway>,
            config,
        );

        Self {
            db,
            gateway,
            catalog: factory.catalog_service(),
            orders: factory.order_service(),
            checkout: factory.checkout_service(),
            finalization: factory.finalization_service(),
            refunds: factory.refund_service(),
            inventory: factory.inventory_service(),
            reconciliation: factory.reconciliation_service(),
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn seed_product(
        &self,
        price: Decimal,
        stock: i32,
        sizes: Value,
        colors: Value,
        shared: bool,
    ) -> ProductModel {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Basic Tee".to_string()),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            sizes: Set(sizes),
            colors: Set(colors),
            share_stock_across_colors: Set(shared),
            low_stock_threshold: Set(Some(2)),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("insert product")
    }

    pub async fn seed_plain_product(&self, price: Decimal, stock: i32) -> ProductModel {
        self.seed_product(price, stock, json!([]), json!([]), false)
            .await
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        size: &str,
        color: &str,
        stock: i32,
        price: Option<Decimal>,
    ) -> VariantModel {
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            variant_key: Set(format!("{}|{}", size, color)),
            size: Set(size.to_string()),
            color: Set(color.to_string()),
            stock: Set(stock),
            price: Set(price),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("insert variant")
    }

    pub async fn product(&self, id: Uuid) -> ProductModel {
        product::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .unwrap()
            .expect("product exists")
    }

    pub async fn variant_stock(&self, product_id: Uuid, key: &str) -> i32 {
        product_variant::Entity::find()
            .filter(product_variant::Column::ProductId.eq(product_id))
            .filter(product_variant::Column::VariantKey.eq(key))
            .one(&*self.db)
            .await
            .unwrap()
            .expect("variant exists")
            .stock
    }

    pub async fn stock_events(&self, order_id: Uuid) -> Vec<StockEventModel> {
        product_stock_event::Entity::find()
            .filter(product_stock_event::Column::OrderId.eq(order_id))
            .order_by_asc(product_stock_event::Column::CreatedAt)
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn payment_events(&self, order_id: Uuid) -> Vec<PaymentEventModel> {
        order_payment_event::Entity::find()
            .filter(order_payment_event::Column::OrderId.eq(order_id))
            .order_by_asc(order_payment_event::Column::CreatedAt)
            .all(&*self.db)
            .await
            .unwrap()
    }

    pub async fn order(&self, order_id: Uuid) -> OrderModel {
        self.orders.get_order(order_id).await.expect("order exists")
    }

    pub async fn place_order(&self, lines: Vec<CartLine>) -> CreatedOrder {
        self.orders
            .create_order_from_cart(lines, Some(address()), buyer())
            .await
            .expect("order created")
    }

    /// Creates an order and starts checkout, storing `token` on it.
    pub async fn place_order_with_token(&self, lines: Vec<CartLine>, token: &str) -> CreatedOrder {
        let created = self.place_order(lines).await;
        self.gateway.push_session(token);
        self.checkout
            .initiate_checkout(created.order_id)
            .await
            .expect("checkout initiated");
        created
    }

    /// Full happy path to a paid order.
    pub async fn paid_order(
        &self,
        lines: Vec<CartLine>,
        token: &str,
        payment_id: &str,
        items: &[(&str, &str)],
    ) -> OrderModel {
        let created = self.place_order_with_token(lines, token).await;
        let total = created.total_amount.to_string();
        self.gateway.set_retrieval(
            token,
            Ok(paid_retrieval(created.order_id, token, &total, payment_id, items)),
        );
        let outcome = self.finalization.finalize(token).await.expect("finalized");
        assert!(outcome.ok);
        self.order(created.order_id).await
    }
}
