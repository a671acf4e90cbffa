//! Small shared pieces: money arithmetic, actor identity, addresses, tracking codes.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;

/// Amounts closer than this are treated as equal.
pub const MONEY_EPSILON: Decimal = dec!(0.01);

const TRACKING_PREFIX: &str = "TRK";
const TRACKING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TRACKING_GROUPS: usize = 3;
const TRACKING_GROUP_LEN: usize = 4;

static TRACKING_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^TRK-[A-HJ-NP-Z2-9]{4}-[A-HJ-NP-Z2-9]{4}-[A-HJ-NP-Z2-9]{4}$")
        .expect("tracking code pattern is valid")
});

/// Rounds to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= MONEY_EPSILON
}

/// Gateway price strings: dot separator, at most two decimals, never a bare integer.
pub fn format_gateway_price(amount: Decimal) -> String {
    let mut rounded = round_money(amount).normalize();
    if rounded.scale() == 0 {
        rounded.rescale(1);
    }
    rounded.to_string()
}

/// Reads a price the gateway sent either as a JSON number or a string.
pub fn parse_gateway_price(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Decimal::from)
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        _ => None,
    }
}

pub fn validate_positive_decimal(amount: Decimal, field: &str) -> Result<(), ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

/// Who is asking for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Customer(Uuid),
    Admin(Uuid),
    System,
}

impl Actor {
    /// Id recorded in `admin_id` audit columns.
    pub fn admin_id(&self) -> Option<Uuid> {
        match self {
            Actor::Admin(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

/// Postal address as stored on the order and sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1))]
    pub contact_name: String,
    #[validate(length(min = 1))]
    pub city: String,
    #[validate(length(min = 1))]
    pub country: String,
    #[validate(length(min = 1))]
    pub address: String,
    #[serde(default)]
    pub zip_code: Option<String>,
}

impl Address {
    pub fn is_blank(&self) -> bool {
        self.contact_name.trim().is_empty()
            || self.city.trim().is_empty()
            || self.country.trim().is_empty()
            || self.address.trim().is_empty()
    }
}

/// Generates a code such as `TRK-7KQ2-M9XA-4HZT`.
pub fn generate_tracking_code() -> String {
    let mut rng = rand::thread_rng();
    let groups: Vec<String> = (0..TRACKING_GROUPS)
        .map(|_| {
            (0..TRACKING_GROUP_LEN)
                .map(|_| TRACKING_ALPHABET[rng.gen_range(0..TRACKING_ALPHABET.len())] as char)
                .collect()
        })
        .collect();
    format!("{}-{}", TRACKING_PREFIX, groups.join("-"))
}

/// Uppercases and trims user input, returning it only if it is a well-formed code.
pub fn normalize_tracking_code(input: &str) -> Option<String> {
    let candidate = input.trim().to_ascii_uppercase();
    TRACKING_CODE_RE.is_match(&candidate).then_some(candidate)
}
