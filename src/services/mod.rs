// Pricing and stock resolution
pub mod catalog;
pub mod inventory;

// Order ledger
pub mod order_status;
pub mod orders;

// Payment lifecycle
pub mod checkout;
pub mod finalization;
pub mod reconciliation;
pub mod refunds;

// Service factory for dependency injection
pub mod factory;
