use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// Gateway result codes are provider-specific strings; success is a
// prefix/constant match, never a parse.
const SUCCESS_PREFIXES: [&str; 2] = ["000.000.", "000.100."];
const SUCCESS_CODES: [&str; 3] = ["CAPTURED", "PAID", "AUTHORIZED"];
const FAILURE_CODES: [&str; 5] = ["FAILED", "CANCELLED", "DECLINED", "VOID", "EXPIRED"];

pub fn is_success_code(code: &str) -> bool {
    SUCCESS_PREFIXES.iter().any(|p| code.starts_with(p))
        || SUCCESS_CODES.iter().any(|c| code == *c)
}

pub fn is_failure_code(code: &str) -> bool {
    FAILURE_CODES.iter().any(|c| code == *c)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub charge_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub result_code: String,
    pub description: String,
}

impl GatewayCharge {
    pub fn is_successful(&self) -> bool {
        is_success_code(&self.result_code)
    }

    pub fn is_failed(&self) -> bool {
        is_failure_code(&self.result_code)
    }
}

/// Opaque payment gateway capability (charge creation, refunds, status
/// polling). Real providers live behind this seam in the controller layer.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> Result<GatewayCharge, EngineError>;

    async fn refund(&self, charge_id: &str, amount: Decimal) -> Result<String, EngineError>;

    async fn get_status(&self, charge_id: &str) -> Result<GatewayCharge, EngineError>;
}

/// In-memory gateway used by tests and sandbox environments. Charges are
/// created pending; `settle` drives them to a terminal result code the way a
/// webhook or status poll would.
pub struct SandboxGateway {
    charges: DashMap<String, GatewayCharge>,
    auto_capture: bool,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            charges: DashMap::new(),
            auto_capture: false,
        }
    }

    /// Every charge reports a success code immediately.
    pub fn auto_capturing() -> Self {
        Self {
            charges: DashMap::new(),
            auto_capture: true,
        }
    }

    pub fn settle(&self, charge_id: &str, result_code: &str) {
        if let Some(mut charge) = self.charges.get_mut(charge_id) {
            charge.result_code = result_code.to_string();
        }
    }

    fn next_charge_id() -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..16)
            .map(|_| {
                let chars = b"abcdef0123456789";
                chars[rng.gen_range(0..chars.len())] as char
            })
            .collect();
        format!("ch_{suffix}")
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn charge(&self, request: ChargeRequest) -> Result<GatewayCharge, EngineError> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::Gateway(
                "Charge amount must be a positive number".to_string(),
            ));
        }
        let charge = GatewayCharge {
            charge_id: Self::next_charge_id(),
            amount: request.amount,
            currency: request.currency,
            result_code: if self.auto_capture {
                "000.000.000".to_string()
            } else {
                "000.200.000".to_string()
            },
            description: request.description,
        };
        self.charges.insert(charge.charge_id.clone(), charge.clone());
        tracing::debug!(charge_id = %charge.charge_id, "sandbox charge created");
        Ok(charge)
    }

    async fn refund(&self, charge_id: &str, _amount: Decimal) -> Result<String, EngineError> {
        if !self.charges.contains_key(charge_id) {
            return Err(EngineError::Gateway(format!(
                "Unknown charge {charge_id}"
            )));
        }
        Ok(format!("rf_{charge_id}"))
    }

    async fn get_status(&self, charge_id: &str) -> Result<GatewayCharge, EngineError> {
        self.charges
            .get(charge_id)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::Gateway(format!("Unknown charge {charge_id}")))
    }
}
