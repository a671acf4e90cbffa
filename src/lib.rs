//! Storefront order engine
//!
//! Cart-to-order creation with server-side pricing, hosted-checkout
//! finalization, variant-aware stock bookkeeping and a refund ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod common;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod migrator;
pub mod notifications;
pub mod services;

pub use errors::ServiceError;
pub use services::factory::{ServiceContainer, ServiceFactory};
