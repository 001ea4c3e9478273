//! HTTP client for the hosted payment gateway
//!
//! Every operation is a `PUT` of a JSON body to
//! `/api/rest/version/{v}/merchant/{id}/order/{order}/transaction/{n}` with
//! basic auth `merchant.{id}:{password}`. Anything other than 200/201 is a
//! [`BillingError::Gateway`] carrying the status and body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayResponse, PaymentGateway};
use crate::models::format_amount;

pub struct HttpPaymentGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig, timeout: Duration) -> BillingResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    fn base_url(&self) -> String {
        if self.config.host.starts_with("http://") || self.config.host.starts_with("https://") {
            self.config.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.config.host)
        }
    }

    fn endpoint(&self, order_id: &str, transaction: u32) -> String {
        format!(
            "{}/api/rest/version/{}/merchant/{}/order/{}/transaction/{}",
            self.base_url(),
            self.config.api_version,
            self.config.merchant_id,
            order_id,
            transaction
        )
    }

    async fn put(&self, url: String, body: Value) -> BillingResult<GatewayResponse> {
        let operation = body["apiOperation"].as_str().unwrap_or_default().to_string();
        tracing::debug!(operation = %operation, url = %url, "Sending gateway request");

        let response = self
            .client
            .put(&url)
            .basic_auth(
                format!("merchant.{}", self.config.merchant_id),
                Some(&self.config.api_password),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status != StatusCode::OK && status != StatusCode::CREATED {
            tracing::warn!(operation = %operation, status = status.as_u16(), "Gateway returned error status");
            return Err(BillingError::Gateway(format!(
                "API error {}: {}",
                status.as_u16(),
                text
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| BillingError::Gateway(format!("failed to decode gateway response: {}", e)))
    }
}

fn new_order_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn token_body(operation: &str, token: &str, amount_cents: i64, currency: &str) -> Value {
    json!({
        "apiOperation": operation,
        "order": {
            "amount": format_amount(amount_cents),
            "currency": currency,
        },
        "sourceOfFunds": {
            "type": "CARD",
            "token": token,
        },
    })
}

fn amount_body(operation: &str, amount_cents: i64, currency: &str) -> Value {
    json!({
        "apiOperation": operation,
        "transaction": {
            "amount": format_amount(amount_cents),
            "currency": currency,
        },
    })
}

/// Refunds need a fresh transaction number on an order that already has 1 and 2.
fn refund_transaction_number() -> u32 {
    let nanos = time::OffsetDateTime::now_utc().nanosecond();
    3 + nanos % 997
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, token: &str, amount_cents: i64, currency: &str) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(&new_order_id(), 1);
        self.put(url, token_body("PAY", token, amount_cents, currency)).await
    }

    async fn authorize(
        &self,
        token: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(&new_order_id(), 1);
        self.put(url, token_body("AUTHORIZE", token, amount_cents, currency)).await
    }

    async fn capture(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(order_id, 2);
        self.put(url, amount_body("CAPTURE", amount_cents, currency)).await
    }

    async fn void(&self, order_id: &str) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(order_id, 2);
        let body = json!({
            "apiOperation": "VOID",
            "transaction": { "targetTransactionId": "1" },
        });
        self.put(url, body).await
    }

    async fn update_authorization(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(order_id, 2);
        self.put(url, amount_body("UPDATE_AUTHORIZATION", amount_cents, currency))
            .await
    }

    async fn refund(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        let url = self.endpoint(order_id, refund_transaction_number());
        self.put(url, amount_body("REFUND", amount_cents, currency)).await
    }
}
