use rust_decimal::Decimal;
use thiserror::Error;

use consultlink_common::AppError;

use crate::models::SessionStatus;

/// Why a gift card could not be redeemed. Every rejection carries its own
/// reason so callers can show the user something better than "invalid code".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftCardRejection {
    NotFound,
    AlreadyRedeemed,
    Expired,
    PaymentPending,
    PaymentFailed,
    Cancelled,
}

impl GiftCardRejection {
    pub fn message(&self) -> &'static str {
        match self {
            GiftCardRejection::NotFound => "Gift card not found or not active",
            GiftCardRejection::AlreadyRedeemed => "Gift card has already been redeemed",
            GiftCardRejection::Expired => "Gift card has expired",
            GiftCardRejection::PaymentPending => "Gift card payment is pending",
            GiftCardRejection::PaymentFailed => "Gift card payment failed",
            GiftCardRejection::Cancelled => "Gift card was cancelled",
        }
    }
}

impl std::fmt::Display for GiftCardRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Gift card error: {reason}")]
    GiftCardInvalid { reason: GiftCardRejection },

    #[error("Insufficient wallet balance: amount due {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("A booker cannot book a session with themselves")]
    SelfBookingForbidden,

    #[error("Requested slot is no longer available")]
    SlotUnavailable,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition: cannot {action} a session in status {from:?}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidPrice(_) => "INVALID_PRICE",
            EngineError::GiftCardInvalid { .. } => "GIFT_CARD_INVALID",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::SelfBookingForbidden => "SELF_BOOKING_FORBIDDEN",
            EngineError::SlotUnavailable => "SLOT_UNAVAILABLE",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Gateway(_) => "GATEWAY_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::NotFound(_) => AppError::NotFound(err.to_string()),
            EngineError::Forbidden(_) => AppError::Authorization(err.to_string()),
            EngineError::Conflict(_) | EngineError::InvalidTransition { .. } => {
                AppError::Conflict(err.to_string())
            }
            EngineError::InsufficientFunds { .. } | EngineError::GiftCardInvalid { .. } => {
                AppError::Payment(err.to_string())
            }
            EngineError::Gateway(_) => AppError::ExternalService(err.to_string()),
            EngineError::Internal(_) => AppError::Internal(err.to_string()),
            _ => AppError::Validation(err.to_string()),
        }
    }
}
