use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::Rng;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::types::{
    text, CancelRequest, CheckoutSession, GatewayRefund, InitiateRequest, PaymentRetrieval,
    RefundByPaymentIdRequest, RefundRequest,
};
use super::{CheckoutGateway, GatewayError};
use crate::common::format_gateway_price;
use crate::config::GatewayConfig;

type HmacSha256 = Hmac<Sha256>;

const INITIALIZE_PATH: &str = "/payment/iyzipos/checkoutform/initialize/auth/ecom";
const RETRIEVE_TOKEN_PATH: &str = "/payment/iyzipos/checkoutform/auth/ecom/detail";
const RETRIEVE_PAYMENT_PATH: &str = "/payment/detail";
const REFUND_PATH: &str = "/payment/refund";
const CANCEL_PATH: &str = "/payment/cancel";
const REFUND_V2_PATH: &str = "/v2/payment/refund";

const AUTH_SCHEME: &str = "IYZWSv2";
const RANDOM_HEADER: &str = "x-iyzi-rnd";

/// Builds the `IYZWSv2` authorization header value.
///
/// signature = hex(HMAC-SHA256(secret, randomKey + uriPath + body)); the
/// header carries base64 of `apiKey:..&randomKey:..&signature:..`.
pub fn authorization_header(
    api_key: &str,
    secret_key: &str,
    random_key: &str,
    uri_path: &str,
    body: &str,
) -> Result<String, GatewayError> {
    let path = uri_path.split('?').next().unwrap_or(uri_path);
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| GatewayError::NotConfigured(e.to_string()))?;
    mac.update(random_key.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let params = format!(
        "apiKey:{}&randomKey:{}&signature:{}",
        api_key, random_key, signature
    );
    Ok(format!("{} {}", AUTH_SCHEME, BASE64.encode(params)))
}

fn random_key() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(100_000_000..1_000_000_000);
    format!("{}{}", Utc::now().timestamp_millis(), suffix)
}

fn map_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}

/// HTTP client for the hosted-checkout gateway.
#[derive(Clone)]
pub struct IyzicoGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    locale: String,
}

impl IyzicoGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        if !config.has_credentials() {
            return Err(GatewayError::NotConfigured(
                "gateway.api_key and gateway.secret_key must be set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(map_transport)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            locale: config.locale.clone(),
        })
    }

    /// POSTs a signed JSON body.
    ///
    /// Non-2xx responses that still carry a gateway `status` field are
    /// returned as-is; the gateway reports business failures that way.
    async fn post(&self, operation: &'static str, path: &str, body: Value) -> Result<Value, GatewayError> {
        let body = serde_json::to_string(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let rnd = random_key();
        let authorization = authorization_header(&self.api_key, &self.secret_key, &rnd, path, &body)?;

        counter!("storefront.gateway.request", 1, "operation" => operation);
        debug!(operation, path, "Calling payment gateway");

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Authorization", authorization)
            .header(RANDOM_HEADER, rnd)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                counter!("storefront.gateway.transport_error", 1, "operation" => operation);
                map_transport(e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport)?;

        let parsed = serde_json::from_str::<Value>(&text);
        if status.is_success() {
            return parsed.map_err(|e| GatewayError::Decode(e.to_string()));
        }

        match parsed {
            Ok(value) if value.get("status").is_some() => {
                warn!(
                    operation,
                    http_status = status.as_u16(),
                    "Gateway answered with an error status"
                );
                Ok(value)
            }
            _ => Err(GatewayError::Http {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}

#[async_trait]
impl CheckoutGateway for IyzicoGateway {
    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<CheckoutSession, GatewayError> {
        request.validate()?;
        let raw = self.post("initiate", INITIALIZE_PATH, request.to_wire()).await?;

        let ok = raw
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case("success"))
            .unwrap_or(false);
        let token = raw.get("token").and_then(Value::as_str).map(str::to_string);

        match (ok, token) {
            (true, Some(token)) if !token.is_empty() => Ok(CheckoutSession {
                token,
                checkout_form_content: raw
                    .get("checkoutFormContent")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                payment_page_url: raw
                    .get("paymentPageUrl")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => Err(GatewayError::Rejected {
                code: text(&raw, "errorCode"),
                message: text(&raw, "errorMessage")
                    .unwrap_or_else(|| "checkout initialization failed".to_string()),
                group: text(&raw, "errorGroup"),
            }),
        }
    }

    #[instrument(skip(self, token))]
    async fn retrieve_by_token(&self, token: &str) -> Result<PaymentRetrieval, GatewayError> {
        if token.trim().is_empty() {
            return Err(GatewayError::MissingField("token"));
        }
        let body = json!({
            "locale": self.locale,
            "conversationId": token,
            "token": token,
        });
        let raw = self.post("retrieve_by_token", RETRIEVE_TOKEN_PATH, body).await?;
        PaymentRetrieval::from_wire(raw)
    }

    #[instrument(skip(self))]
    async fn retrieve_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<PaymentRetrieval, GatewayError> {
        if payment_id.trim().is_empty() {
            return Err(GatewayError::MissingField("paymentId"));
        }
        let body = json!({
            "locale": self.locale,
            "conversationId": payment_id,
            "paymentId": payment_id,
        });
        let raw = self
            .post("retrieve_by_payment_id", RETRIEVE_PAYMENT_PATH, body)
            .await?;
        PaymentRetrieval::from_wire(raw)
    }

    #[instrument(skip(self, request), fields(tx = %request.payment_transaction_id, amount = %request.amount))]
    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayError> {
        let body = json!({
            "locale": self.locale,
            "conversationId": request.conversation_id,
            "paymentTransactionId": request.payment_transaction_id,
            "price": format_gateway_price(request.amount),
            "currency": request.currency,
            "ip": request.ip,
        });
        let raw = self.post("refund", REFUND_PATH, body).await?;
        Ok(GatewayRefund::from_wire(raw))
    }

    #[instrument(skip(self, request), fields(payment_id = %request.payment_id))]
    async fn cancel(&self, request: &CancelRequest) -> Result<GatewayRefund, GatewayError> {
        let body = json!({
            "locale": self.locale,
            "conversationId": request.conversation_id,
            "paymentId": request.payment_id,
            "ip": request.ip,
        });
        let raw = self.post("cancel", CANCEL_PATH, body).await?;
        Ok(GatewayRefund::from_wire(raw))
    }

    #[instrument(skip(self, request), fields(payment_id = %request.payment_id, amount = %request.amount))]
    async fn refund_by_payment_id(
        &self,
        request: &RefundByPaymentIdRequest,
    ) -> Result<GatewayRefund, GatewayError> {
        let body = json!({
            "locale": self.locale,
            "conversationId": request.conversation_id,
            "paymentId": request.payment_id,
            "price": format_gateway_price(request.amount),
            "currency": request.currency,
            "ip": request.ip,
        });
        let raw = self.post("refund_by_payment_id", REFUND_V2_PATH, body).await?;
        Ok(GatewayRefund::from_wire(raw))
    }
}
