//! Payment Gateway Client (C9): authenticated HTTP calls to the external
//! card/subscription provider. Every operation round-trips the gateway's
//! own envelope — top-level `Success`/`Message`/`Model` — rather than a
//! crate-local response shape, since the integration must reproduce the
//! provider's field names exactly (§6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::PaymentGatewayConfig;
use crate::error::Error;

/// `{Success, Message?, Model?}` — the gateway's envelope around every
/// response, preserved verbatim (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse<T> {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Message")]
    pub message: Option<String>,
    #[serde(rename = "Model")]
    pub model: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeModel {
    #[serde(rename = "TransactionId")]
    pub transaction_id: String,
    #[serde(rename = "Status")]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionModel {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "NextTransactionDate")]
    pub next_transaction_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeCryptogramRequest {
    #[serde(rename = "Amount")]
    pub amount: Decimal,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "IpAddress")]
    pub ip_address: String,
    #[serde(rename = "CardCryptogramPacket")]
    pub card_cryptogram_packet: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeTokenRequest {
    #[serde(rename = "Amount")]
    pub amount: Decimal,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Token")]
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSubscriptionRequest {
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Amount")]
    pub amount: Decimal,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "StartDate")]
    pub start_date: DateTime<Utc>,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Period")]
    pub period: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSubscriptionRequest {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Amount")]
    pub amount: Option<Decimal>,
    #[serde(rename = "StartDate")]
    pub start_date: Option<DateTime<Utc>>,
}

/// Inbound webhook body (§6), accepted from either JSON or URL-encoded
/// form submissions.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "TransactionId")]
    pub transaction_id: Option<String>,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Amount")]
    pub amount: Decimal,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Token")]
    pub token: Option<String>,
    #[serde(rename = "Data")]
    pub data: Option<serde_json::Value>,
}

impl WebhookPayload {
    /// Best-effort `Data.tariff_id` extraction; absent/malformed data is
    /// not an error here, just an unresolvable tariff for the caller.
    pub fn tariff_id(&self) -> Option<i64> {
        self.data.as_ref()?.get("tariff_id")?.as_i64()
    }
}

pub struct PaymentGatewayClient {
    http: reqwest::Client,
    pub(crate) base_url: String,
    public_id: String,
    api_secret: String,
}

impl PaymentGatewayClient {
    pub fn new(config: &PaymentGatewayConfig) -> Self {
        let base_url = if config.test_mode {
            "https://api.paygate.ru/test".to_string()
        } else {
            "https://api.paygate.ru".to_string()
        };
        Self {
            http: reqwest::Client::new(),
            base_url,
            public_id: config.public_id.clone(),
            api_secret: config.api_secret.clone(),
        }
    }

    pub async fn charge_cryptogram(&self, request: &ChargeCryptogramRequest) -> crate::Result<GatewayResponse<ChargeModel>> {
        self.post("payments/cards/charge", request).await
    }

    pub async fn charge_token(&self, request: &ChargeTokenRequest) -> crate::Result<GatewayResponse<ChargeModel>> {
        self.post("payments/tokens/charge", request).await
    }

    pub async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> crate::Result<GatewayResponse<SubscriptionModel>> {
        self.post("subscriptions/create", request).await
    }

    pub async fn get_subscription(&self, id: &str) -> crate::Result<GatewayResponse<SubscriptionModel>> {
        self.post("subscriptions/get", &serde_json::json!({ "Id": id })).await
    }

    pub async fn update_subscription(
        &self,
        request: &UpdateSubscriptionRequest,
    ) -> crate::Result<GatewayResponse<SubscriptionModel>> {
        self.post("subscriptions/update", request).await
    }

    pub async fn cancel_subscription(&self, id: &str) -> crate::Result<GatewayResponse<SubscriptionModel>> {
        self.post("subscriptions/cancel", &serde_json::json!({ "Id": id })).await
    }

    pub async fn find_subscriptions(&self, account_id: &str) -> crate::Result<GatewayResponse<Vec<SubscriptionModel>>> {
        self.post("subscriptions/find", &serde_json::json!({ "AccountId": account_id })).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> crate::Result<GatewayResponse<T>> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.public_id, Some(&self.api_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::network(format!("payment gateway call to {path} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::HttpError(status, format!("payment gateway {path}: {text}")));
        }

        response
            .json::<GatewayResponse<T>>()
            .await
            .map_err(|e| Error::network(format!("invalid payment gateway response from {path}: {e}")))
    }

    /// Verifies the `X-Content-HMAC` header: a base64 SHA-256 HMAC, keyed
    /// by `api_secret`, of the alphabetically sorted `key=value&…` form of
    /// the notification payload (§6). Comparison is constant-time.
    pub fn verify_webhook_hmac(&self, fields: &BTreeMap<String, String>, signature_b64: &str) -> bool {
        let payload = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut mac = match Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload.as_bytes());
        let computed = mac.finalize().into_bytes();

        let expected = match BASE64.decode(signature_b64) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        constant_time_eq(&computed, &expected)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method as wm_method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway_config(test_mode: bool) -> PaymentGatewayConfig {
        PaymentGatewayConfig {
            test_mode,
            public_id: "pub".to_string(),
            api_secret: "secret".to_string(),
        }
    }

    #[test]
    fn base_url_switches_on_test_mode() {
        let test_gateway = PaymentGatewayClient::new(&gateway_config(true));
        assert!(test_gateway.base_url.ends_with("/test"));
        let live_gateway = PaymentGatewayClient::new(&gateway_config(false));
        assert!(!live_gateway.base_url.ends_with("/test"));
    }

    #[test]
    fn tariff_id_parses_from_embedded_data() {
        let payload = WebhookPayload {
            transaction_id: Some("tx1".into()),
            account_id: "u1".into(),
            amount: dec!(999),
            status: "Completed".into(),
            token: Some("tok".into()),
            data: Some(serde_json::json!({ "tariff_id": 3 })),
        };
        assert_eq!(payload.tariff_id(), Some(3));
    }

    #[test]
    fn hmac_verification_accepts_matching_signature() {
        let gateway = PaymentGatewayClient::new(&gateway_config(true));
        let mut fields = BTreeMap::new();
        fields.insert("AccountId".to_string(), "u1".to_string());
        fields.insert("Amount".to_string(), "999.00".to_string());
        let payload = "AccountId=u1&Amount=999.00";

        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(payload.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        assert!(gateway.verify_webhook_hmac(&fields, &signature));
    }

    #[test]
    fn hmac_verification_rejects_tampered_signature() {
        let gateway = PaymentGatewayClient::new(&gateway_config(true));
        let mut fields = BTreeMap::new();
        fields.insert("AccountId".to_string(), "u1".to_string());
        assert!(!gateway.verify_webhook_hmac(&fields, &BASE64.encode(b"not-a-real-signature")));
    }

    #[tokio::test]
    async fn charge_token_round_trips_through_gateway_envelope() {
        let server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .and(wm_path("/test/payments/tokens/charge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Success": true,
                "Message": null,
                "Model": { "TransactionId": "tx-1", "Status": "Completed" }
            })))
            .mount(&server)
            .await;

        let mut gateway = PaymentGatewayClient::new(&gateway_config(true));
        gateway.base_url = format!("{}/test", server.uri());

        let response = gateway
            .charge_token(&ChargeTokenRequest {
                amount: dec!(999),
                currency: "RUB".into(),
                account_id: "u1".into(),
                token: "tok".into(),
            })
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.model.unwrap().transaction_id, "tx-1");
    }
}
