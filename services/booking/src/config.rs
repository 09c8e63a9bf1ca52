use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use consultlink_common::DEFAULT_CURRENCY;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    pub currency: String,
    pub payout: PayoutPolicy,
    pub cancellation_notice_hours: i64,
    pub min_withdrawal_amount: Decimal,
}

/// Revenue split between the serving expert and the platform. Rating-based
/// 70/50 is the default; `flat_share` replaces both tiers when set and must
/// be opted into explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutPolicy {
    pub rating_threshold: f64,
    pub high_share: Decimal,
    pub low_share: Decimal,
    pub flat_share: Option<Decimal>,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            rating_threshold: 4.0,
            high_share: Decimal::new(70, 2),
            low_share: Decimal::new(50, 2),
            flat_share: None,
        }
    }
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            payout: PayoutPolicy::default(),
            cancellation_notice_hours: 24,
            min_withdrawal_amount: Decimal::from(10),
        }
    }
}

impl BookingConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            currency: std::env::var("BOOKING_CURRENCY")
                .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string()),
            payout: PayoutPolicy {
                rating_threshold: std::env::var("PAYOUT_RATING_THRESHOLD")
                    .unwrap_or_else(|_| "4.0".to_string())
                    .parse()
                    .unwrap_or(4.0),
                high_share: std::env::var("PAYOUT_HIGH_SHARE")
                    .unwrap_or_else(|_| "0.70".to_string())
                    .parse()
                    .unwrap_or_else(|_| Decimal::new(70, 2)),
                low_share: std::env::var("PAYOUT_LOW_SHARE")
                    .unwrap_or_else(|_| "0.50".to_string())
                    .parse()
                    .unwrap_or_else(|_| Decimal::new(50, 2)),
                flat_share: std::env::var("PAYOUT_FLAT_SHARE")
                    .ok()
                    .and_then(|v| v.parse().ok()),
            },
            cancellation_notice_hours: std::env::var("CANCELLATION_NOTICE_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .unwrap_or(24),
            min_withdrawal_amount: std::env::var("MIN_WITHDRAWAL_AMOUNT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or_else(|_| Decimal::from(10)),
        }
    }
}
