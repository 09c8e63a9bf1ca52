use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::PayoutPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Split {
    pub expert_share: Decimal,
    pub platform_fee: Decimal,
}

/// Computes the serving expert's share of a session fee. Applied exactly once
/// per session, at the moment the lifecycle machine releases the payout.
#[derive(Clone)]
pub struct PayoutCalculator {
    policy: PayoutPolicy,
}

impl PayoutCalculator {
    pub fn new(policy: PayoutPolicy) -> Self {
        Self { policy }
    }

    pub fn compute_share(&self, price: Decimal, average_rating: f64) -> Split {
        let share_pct = match self.policy.flat_share {
            Some(flat) => flat,
            None if average_rating >= self.policy.rating_threshold => self.policy.high_share,
            None => self.policy.low_share,
        };
        let expert_share = (price * share_pct).round_dp(2);
        Split {
            expert_share,
            platform_fee: price - expert_share,
        }
    }
}
