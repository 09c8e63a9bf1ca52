use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

use consultlink_common::PrincipalRole;

// Principal models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum PrincipalRef {
    User(Uuid),
    Expert(Uuid),
}

impl PrincipalRef {
    pub fn id(&self) -> Uuid {
        match self {
            PrincipalRef::User(id) | PrincipalRef::Expert(id) => *id,
        }
    }

    pub fn role(&self) -> PrincipalRole {
        match self {
            PrincipalRef::User(_) => PrincipalRole::User,
            PrincipalRef::Expert(_) => PrincipalRole::Expert,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub wallet_balance: Decimal,
    pub ledger: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(first_name: &str, last_name: &str, email: &str) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            wallet_balance: Decimal::ZERO,
            ledger: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Purse {
    pub balance: Decimal,
    pub ledger: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpertWallets {
    pub earning: Purse,
    pub spending: Purse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expert {
    pub expert_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub free_session_enabled: bool,
    pub average_rating: f64,
    pub number_of_ratings: u32,
    // Deprecated single-purse view, kept equal to earning + spending.
    pub wallet_balance: Decimal,
    pub wallets: ExpertWallets,
    pub ledger: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Expert {
    pub fn new(first_name: &str, last_name: &str, email: &str) -> Self {
        Self {
            expert_id: Uuid::new_v4(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            free_session_enabled: false,
            average_rating: 0.0,
            number_of_ratings: 0,
            wallet_balance: Decimal::ZERO,
            wallets: ExpertWallets::default(),
            ledger: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletPurse {
    Legacy,
    Earning,
    Spending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalances {
    pub legacy: Decimal,
    pub earning: Decimal,
    pub spending: Decimal,
    pub currency: String,
}

// Transaction models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Payment,
    Refund,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    Gateway,
    Wallet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub owner: PrincipalRef,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub channel: PaymentChannel,
    pub payment_ref: Option<String>,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Session models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    UserToExpert,
    ExpertToExpert,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Unconfirmed,
    Confirmed,
    Completed,
    RatingSubmitted,
    Rejected,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::RatingSubmitted | SessionStatus::Rejected | SessionStatus::Cancelled
        )
    }

    /// Whether a session in this status still holds its slot. Cancelled and
    /// rejected sessions are cancellation-equivalent and free the slot.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, SessionStatus::Cancelled | SessionStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wallet,
    Free,
    GiftCard,
    GiftCardPlusWallet,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotApplicable,
    Pending,
    Completed,
    RefundedToWallet,
    DeclinedGiftCardPayment,
    RefundFailedBookerNotFound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DurationBand {
    Quick15,
    Regular30,
    Extra45,
    AllAccess60,
}

impl DurationBand {
    pub fn minutes(&self) -> u32 {
        match self {
            DurationBand::Quick15 => 15,
            DurationBand::Regular30 => 30,
            DurationBand::Extra45 => 45,
            DurationBand::AllAccess60 => 60,
        }
    }
}

/// An exact-match booking bucket. The time component is compared verbatim;
/// slot granularity is the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: String,
}

impl Slot {
    pub fn new(date: NaiveDate, time: &str) -> Self {
        Self {
            date,
            time: time.to_string(),
        }
    }

    /// Best-effort start instant for cancellation-window arithmetic. The time
    /// string is accepted in either 24h ("14:00") or 12h ("2:00 PM") form.
    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        let time = NaiveTime::parse_from_str(&self.time, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&self.time, "%I:%M %p"))
            .ok()?;
        let naive = NaiveDateTime::new(self.date, time);
        Some(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_number: String,
    pub host_link: String,
    pub guest_link: String,
    pub passcode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub kind: SessionKind,
    pub booker: PrincipalRef,
    pub server_id: Uuid,
    pub area_of_expertise: String,
    pub slots: Vec<Slot>,
    pub duration: DurationBand,
    pub note: Option<String>,
    pub status: SessionStatus,
    pub price: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_amount: Decimal,
    pub gift_card_redeemed_id: Option<Uuid>,
    pub gift_card_amount_redeemed: Decimal,
    pub expert_payout_amount: Decimal,
    pub platform_fee_amount: Decimal,
    pub payout_processed: bool,
    pub rating: Option<u8>,
    pub meeting: Option<Meeting>,
    pub end_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.slots.first().and_then(Slot::starts_at)
    }
}

// Gift card models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GiftCardStatus {
    PendingPayment,
    Active,
    Redeemed,
    Expired,
    PaymentFailed,
    Cancelled,
    AnonymousPendingPayment,
    AnonymousActive,
}

impl GiftCardStatus {
    pub fn is_redeemable(&self) -> bool {
        matches!(self, GiftCardStatus::Active | GiftCardStatus::AnonymousActive)
    }

    pub fn is_pending_payment(&self) -> bool {
        matches!(
            self,
            GiftCardStatus::PendingPayment | GiftCardStatus::AnonymousPendingPayment
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftCard {
    pub gift_card_id: Uuid,
    pub original_amount: Decimal,
    pub balance: Decimal,
    pub redemption_code: String,
    pub status: GiftCardStatus,
    pub purchaser: Option<PrincipalRef>,
    pub purchaser_email: String,
    pub recipient_email: String,
    pub recipient_message: Option<String>,
    pub send_anonymously: bool,
    pub payment_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redemption {
    pub gift_card_id: Uuid,
    pub redeemed_amount: Decimal,
}

// Cancellation models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    FeeMayApply,
    NoFee,
}

impl CancellationPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            CancellationPolicy::FeeMayApply => "Cancellation fee may apply",
            CancellationPolicy::NoFee => "No cancellation fee",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub session_kind: SessionKind,
    pub cancelled_by: PrincipalRef,
    pub reasons: Vec<String>,
    pub other_reason: Option<String>,
    pub policy: CancellationPolicy,
    pub cancelled_at: DateTime<Utc>,
}

// Request / response models

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub kind: SessionKind,
    pub booker: PrincipalRef,
    pub server_id: Uuid,
    pub area_of_expertise: String,
    pub slots: Vec<Slot>,
    pub duration: DurationBand,
    pub note: Option<String>,
    pub price: Decimal,
    pub redemption_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransitionAction {
    Confirm,
    Decline,
    Cancel {
        reasons: Vec<String>,
        other_reason: Option<String>,
        purge: bool,
    },
    Complete {
        end_time: Option<DateTime<Utc>>,
    },
    SubmitRating {
        rating: u8,
        comment: Option<String>,
    },
}

impl TransitionAction {
    pub fn name(&self) -> &'static str {
        match self {
            TransitionAction::Confirm => "confirm",
            TransitionAction::Decline => "decline",
            TransitionAction::Cancel { .. } => "cancel",
            TransitionAction::Complete { .. } => "complete",
            TransitionAction::SubmitRating { .. } => "submit_rating",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftCardPurchaseRequest {
    pub amount: Decimal,
    pub purchaser: Option<PrincipalRef>,
    pub purchaser_email: String,
    pub recipient_email: String,
    pub recipient_message: Option<String>,
    pub send_anonymously: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpIntent {
    pub transaction: Transaction,
    pub checkout_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpOutcome {
    pub transaction: Transaction,
    /// False when the confirmation had already been applied (duplicate
    /// webhook or client re-poll); the credit happened exactly once.
    pub newly_applied: bool,
}
