//! Payment gateway contract
//!
//! The engine only needs `charge`; the remaining operations are part of the
//! gateway surface used by manual payment flows.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

pub const RESULT_SUCCESS: &str = "SUCCESS";
pub const GATEWAY_CODE_APPROVED: &str = "APPROVED";

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Immediate payment against a stored card token (PAY).
    async fn charge(&self, token: &str, amount_cents: i64, currency: &str) -> BillingResult<GatewayResponse>;

    /// Place a hold without capturing (AUTHORIZE).
    async fn authorize(&self, token: &str, amount_cents: i64, currency: &str)
        -> BillingResult<GatewayResponse>;

    async fn capture(&self, order_id: &str, amount_cents: i64, currency: &str)
        -> BillingResult<GatewayResponse>;

    async fn void(&self, order_id: &str) -> BillingResult<GatewayResponse>;

    async fn update_authorization(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse>;

    async fn refund(&self, order_id: &str, amount_cents: i64, currency: &str)
        -> BillingResult<GatewayResponse>;
}

/// Gateway reply, as much of it as billing cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub gateway_code: String,
    #[serde(default)]
    pub order: GatewayOrder,
    #[serde(default)]
    pub transaction: GatewayTransaction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    #[serde(default)]
    pub id: String,
    /// Number or string depending on the operation
    #[serde(default)]
    pub amount: serde_json::Value,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub amount: serde_json::Value,
    #[serde(default)]
    pub currency: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

impl GatewayResponse {
    pub fn is_approved(&self) -> bool {
        self.result == RESULT_SUCCESS && self.gateway_code == GATEWAY_CODE_APPROVED
    }

    /// Gateway code as sent, `None` when the gateway left it empty.
    pub fn gateway_code(&self) -> Option<&str> {
        Some(self.gateway_code.as_str()).filter(|code| !code.is_empty())
    }

    pub fn approved(transaction_id: impl Into<String>) -> Self {
        Self {
            result: RESULT_SUCCESS.to_string(),
            gateway_code: GATEWAY_CODE_APPROVED.to_string(),
            order: GatewayOrder::default(),
            transaction: GatewayTransaction {
                id: transaction_id.into(),
                status: "CAPTURED".to_string(),
                ..GatewayTransaction::default()
            },
        }
    }

    pub fn declined(result: impl Into<String>, gateway_code: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            gateway_code: gateway_code.into(),
            ..Self::default()
        }
    }
}

/// Outcome a [`ScriptedGateway`] returns for one call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Approve,
    Decline { result: String, gateway_code: String },
    TransportError(String),
}

impl ScriptedOutcome {
    pub fn decline(gateway_code: &str) -> Self {
        Self::Decline {
            result: "FAILURE".to_string(),
            gateway_code: gateway_code.to_string(),
        }
    }
}

/// Recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub operation: &'static str,
    pub reference: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// In-process gateway that replays queued outcomes, approving once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcomes(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        let gateway = Self::new();
        for outcome in outcomes {
            gateway.push(outcome);
        }
        gateway
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        if let Ok(mut queue) = self.outcomes.lock() {
            queue.push_back(outcome);
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of PAY operations seen so far.
    pub fn charge_count(&self) -> usize {
        self.calls().iter().filter(|c| c.operation == "PAY").count()
    }

    fn respond(
        &self,
        operation: &'static str,
        reference: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        let seq = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| BillingError::Gateway("scripted gateway lock poisoned".to_string()))?;
            calls.push(GatewayCall {
                operation,
                reference: reference.to_string(),
                amount_cents,
                currency: currency.to_string(),
            });
            calls.len()
        };

        let next = self.outcomes.lock().ok().and_then(|mut q| q.pop_front());
        match next.unwrap_or(ScriptedOutcome::Approve) {
            ScriptedOutcome::Approve => Ok(GatewayResponse::approved(format!("txn-{}", seq))),
            ScriptedOutcome::Decline {
                result,
                gateway_code,
            } => Ok(GatewayResponse::declined(result, gateway_code)),
            ScriptedOutcome::TransportError(msg) => Err(BillingError::Gateway(msg)),
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, token: &str, amount_cents: i64, currency: &str) -> BillingResult<GatewayResponse> {
        self.respond("PAY", token, amount_cents, currency)
    }

    async fn authorize(
        &self,
        token: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        self.respond("AUTHORIZE", token, amount_cents, currency)
    }

    async fn capture(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        self.respond("CAPTURE", order_id, amount_cents, currency)
    }

    async fn void(&self, order_id: &str) -> BillingResult<GatewayResponse> {
        self.respond("VOID", order_id, 0, "")
    }

    async fn update_authorization(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        self.respond("UPDATE_AUTHORIZATION", order_id, amount_cents, currency)
    }

    async fn refund(
        &self,
        order_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<GatewayResponse> {
        self.respond("REFUND", order_id, amount_cents, currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_requires_both_fields() {
        assert!(GatewayResponse::approved("t1").is_approved());
        assert!(!GatewayResponse::declined("SUCCESS", "DECLINED").is_approved());
        assert!(!GatewayResponse::declined("FAILURE", "APPROVED").is_approved());
        assert!(!GatewayResponse::declined("PENDING", "").is_approved());
    }

    #[test]
    fn test_gateway_code_is_kept_verbatim() {
        assert_eq!(
            GatewayResponse::declined("FAILURE", "INSUFFICIENT_FUNDS").gateway_code(),
            Some("INSUFFICIENT_FUNDS")
        );
        assert_eq!(GatewayResponse::declined("ERROR", "").gateway_code(), None);
    }

    #[test]
    fn test_response_decodes_numeric_amount() {
        let body = r#"{
            "result": "SUCCESS",
            "gatewayCode": "APPROVED",
            "order": {"id": "42", "amount": 1000.0, "currency": "LKR", "status": "CAPTURED"},
            "transaction": {"id": "1", "amount": "1000.00", "currency": "LKR", "type": "PAYMENT", "status": "SUCCESS"}
        }"#;
        let resp: GatewayResponse = serde_json::from_str(body).unwrap();
        assert!(resp.is_approved());
        assert_eq!(resp.transaction.kind, "PAYMENT");
        assert_eq!(resp.order.id, "42");
    }

    #[tokio::test]
    async fn test_scripted_gateway_replays_then_approves() {
        let gateway = ScriptedGateway::with_outcomes([
            ScriptedOutcome::decline("DECLINED"),
            ScriptedOutcome::TransportError("timeout".to_string()),
        ]);

        let first = gateway.charge("tok", 100, "LKR").await.unwrap();
        assert!(!first.is_approved());
        assert!(gateway.charge("tok", 100, "LKR").await.is_err());
        assert!(gateway.charge("tok", 100, "LKR").await.unwrap().is_approved());
        assert_eq!(gateway.charge_count(), 3);
    }
}
