use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::GatewayError;
use crate::common::{format_gateway_price, parse_gateway_price};

const PAYMENT_GROUP: &str = "PRODUCT";
const ITEM_TYPE_PHYSICAL: &str = "PHYSICAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayBuyer {
    pub id: String,
    pub name: String,
    pub surname: String,
    pub gsm_number: String,
    pub email: String,
    pub identity_number: String,
    pub registration_address: String,
    pub ip: String,
    pub city: String,
    pub country: String,
    pub zip_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayAddress {
    pub contact_name: String,
    pub city: String,
    pub country: String,
    pub address: String,
    pub zip_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketItem {
    pub id: String,
    pub name: String,
    pub category: String,
    /// Line total, not unit price
    pub price: Decimal,
}

/// Session-init payload built from a stored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub locale: String,
    pub conversation_id: String,
    pub basket_id: String,
    pub price: Decimal,
    pub paid_price: Decimal,
    pub currency: String,
    pub callback_url: String,
    pub buyer: GatewayBuyer,
    pub shipping_address: GatewayAddress,
    pub billing_address: GatewayAddress,
    pub basket_items: Vec<BasketItem>,
}

fn require(value: &str, field: &'static str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        Err(GatewayError::MissingField(field))
    } else {
        Ok(())
    }
}

impl GatewayAddress {
    /// `fields` names contactName, city, country, address in that order.
    fn check(&self, fields: [&'static str; 4]) -> Result<(), GatewayError> {
        require(&self.contact_name, fields[0])?;
        require(&self.city, fields[1])?;
        require(&self.country, fields[2])?;
        require(&self.address, fields[3])
    }

    fn to_wire(&self) -> Value {
        json!({
            "contactName": self.contact_name,
            "city": self.city,
            "country": self.country,
            "address": self.address,
            "zipCode": self.zip_code,
        })
    }
}

impl InitiateRequest {
    /// Fails fast, naming the first missing field, before any network call.
    pub fn validate(&self) -> Result<(), GatewayError> {
        require(&self.conversation_id, "conversationId")?;
        require(&self.basket_id, "basketId")?;
        require(&self.currency, "currency")?;
        require(&self.callback_url, "callbackUrl")?;

        let b = &self.buyer;
        require(&b.id, "buyer.id")?;
        require(&b.name, "buyer.name")?;
        require(&b.surname, "buyer.surname")?;
        require(&b.gsm_number, "buyer.gsmNumber")?;
        require(&b.email, "buyer.email")?;
        require(&b.identity_number, "buyer.identityNumber")?;
        require(&b.registration_address, "buyer.registrationAddress")?;
        require(&b.ip, "buyer.ip")?;
        require(&b.city, "buyer.city")?;
        require(&b.country, "buyer.country")?;

        self.shipping_address.check([
            "shippingAddress.contactName",
            "shippingAddress.city",
            "shippingAddress.country",
            "shippingAddress.address",
        ])?;
        self.billing_address.check([
            "billingAddress.contactName",
            "billingAddress.city",
            "billingAddress.country",
            "billingAddress.address",
        ])?;

        if self.basket_items.is_empty() {
            return Err(GatewayError::MissingField("basketItems"));
        }
        for item in &self.basket_items {
            require(&item.id, "basketItems.id")?;
            require(&item.name, "basketItems.name")?;
            require(&item.category, "basketItems.category1")?;
        }
        if self.price <= Decimal::ZERO {
            return Err(GatewayError::MissingField("price"));
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Value {
        let b = &self.buyer;
        json!({
            "locale": self.locale,
            "conversationId": self.conversation_id,
            "price": format_gateway_price(self.price),
            "paidPrice": format_gateway_price(self.paid_price),
            "currency": self.currency,
            "basketId": self.basket_id,
            "paymentGroup": PAYMENT_GROUP,
            "callbackUrl": self.callback_url,
            "enabledInstallments": [1],
            "buyer": {
                "id": b.id,
                "name": b.name,
                "surname": b.surname,
                "gsmNumber": b.gsm_number,
                "email": b.email,
                "identityNumber": b.identity_number,
                "registrationAddress": b.registration_address,
                "ip": b.ip,
                "city": b.city,
                "country": b.country,
                "zipCode": b.zip_code,
            },
            "shippingAddress": self.shipping_address.to_wire(),
            "billingAddress": self.billing_address.to_wire(),
            "basketItems": self.basket_items.iter().map(|item| json!({
                "id": item.id,
                "name": item.name,
                "category1": item.category,
                "itemType": ITEM_TYPE_PHYSICAL,
                "price": format_gateway_price(item.price),
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub token: String,
    pub checkout_form_content: Option<String>,
    pub payment_page_url: Option<String>,
}

/// One basket transaction of a captured payment, the unit partial refunds target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentItem {
    pub payment_transaction_id: String,
    #[serde(default)]
    pub item_id: Option<String>,
    pub paid_price: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
}

/// Normalized view of a checkout-form or payment retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRetrieval {
    pub status: String,
    pub payment_status: Option<String>,
    pub payment_id: Option<String>,
    pub conversation_id: Option<String>,
    pub basket_id: Option<String>,
    pub token: Option<String>,
    pub paid_price: Option<Decimal>,
    pub currency: Option<String>,
    pub payment_items: Vec<PaymentItem>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_group: Option<String>,
    pub raw: Value,
}

/// Strings or numbers as a string; the gateway is loose about ids.
pub(crate) fn text(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl PaymentRetrieval {
    pub fn from_wire(raw: Value) -> Result<Self, GatewayError> {
        let status = text(&raw, "status")
            .ok_or_else(|| GatewayError::Decode("response has no status".to_string()))?;

        let payment_items = raw
            .get("itemTransactions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(PaymentItem {
                            payment_transaction_id: text(item, "paymentTransactionId")?,
                            item_id: text(item, "itemId"),
                            paid_price: item.get("paidPrice").and_then(parse_gateway_price)?,
                            price: item.get("price").and_then(parse_gateway_price),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            status,
            payment_status: text(&raw, "paymentStatus"),
            payment_id: text(&raw, "paymentId"),
            conversation_id: text(&raw, "conversationId"),
            basket_id: text(&raw, "basketId"),
            token: text(&raw, "token"),
            paid_price: raw.get("paidPrice").and_then(parse_gateway_price),
            currency: text(&raw, "currency"),
            payment_items,
            error_code: text(&raw, "errorCode"),
            error_message: text(&raw, "errorMessage"),
            error_group: text(&raw, "errorGroup"),
            raw,
        })
    }

    /// Call succeeded and the payment itself was captured.
    pub fn is_success(&self) -> bool {
        if !self.status.eq_ignore_ascii_case("success") {
            return false;
        }
        match &self.payment_status {
            Some(ps) => ps.eq_ignore_ascii_case("SUCCESS"),
            None => self.payment_id.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub conversation_id: String,
    pub payment_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub conversation_id: String,
    pub payment_id: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundByPaymentIdRequest {
    pub conversation_id: String,
    pub payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub ip: String,
}

/// Outcome of a refund or cancel call that reached the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRefund {
    pub success: bool,
    pub gateway_refund_id: Option<String>,
    pub error_message: Option<String>,
    pub raw: Value,
}

impl GatewayRefund {
    pub fn from_wire(raw: Value) -> Self {
        let success = text(&raw, "status")
            .map(|s| s.eq_ignore_ascii_case("success"))
            .unwrap_or(false);
        let gateway_refund_id = ["refundHostReference", "hostReference", "paymentTransactionId", "paymentId"]
            .iter()
            .find_map(|key| text(&raw, key));
        let error_message = if success {
            None
        } else {
            Some(
                text(&raw, "errorMessage")
                    .or_else(|| text(&raw, "errorCode"))
                    .unwrap_or_else(|| "refund failed".to_string()),
            )
        };
        Self {
            success,
            gateway_refund_id,
            error_message,
            raw,
        }
    }
}
