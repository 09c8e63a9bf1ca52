use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{EngineError, GiftCardRejection};
use crate::models::{
    CancellationRecord, Expert, GiftCard, GiftCardStatus, PrincipalRef, Session, Slot, Transaction,
    TransactionStatus, User, WalletPurse,
};

/// Persistence seam for principals and their wallet balances. Balance
/// mutations are atomic per document: the sufficiency check, the balance
/// change and the ledger append happen under one document lock.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), EngineError>;
    async fn insert_expert(&self, expert: Expert) -> Result<(), EngineError>;
    async fn user(&self, id: Uuid) -> Result<Option<User>, EngineError>;
    async fn expert(&self, id: Uuid) -> Result<Option<Expert>, EngineError>;

    /// Credits a purse and appends `tx_id` to its ledger. Never fails for an
    /// existing principal. Returns the new purse balance.
    async fn credit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        tx_id: Uuid,
    ) -> Result<Decimal, EngineError>;

    /// Debits a purse, failing with `INSUFFICIENT_FUNDS` when the balance is
    /// short. Check-and-debit is a single step. Returns the new balance.
    async fn debit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        tx_id: Uuid,
    ) -> Result<Decimal, EngineError>;

    /// Incremental-mean rating update under the expert document lock.
    /// Returns the new average.
    async fn apply_rating(&self, expert_id: Uuid, rating: u8) -> Result<f64, EngineError>;

    async fn set_free_session_enabled(
        &self,
        expert_id: Uuid,
        enabled: bool,
    ) -> Result<(), EngineError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<(), EngineError>;
    async fn get(&self, id: Uuid) -> Result<Option<Session>, EngineError>;
    async fn delete(&self, id: Uuid) -> Result<(), EngineError>;

    /// Compare-and-swap on the session's revision: the write succeeds only
    /// when the stored version matches the one the caller read.
    async fn put_versioned(&self, session: Session) -> Result<Session, EngineError>;

    /// Whether any session of either kind holds the exact `(server, date,
    /// time)` bucket with a status that still occupies it.
    async fn slot_occupied(&self, server_id: Uuid, slot: &Slot) -> Result<bool, EngineError>;

    /// Whether the booker has any prior non-cancelled session of either kind
    /// with this server (free-session eligibility).
    async fn has_prior_with_server(
        &self,
        booker_id: Uuid,
        server_id: Uuid,
    ) -> Result<bool, EngineError>;

    /// Atomically flips `payout_processed` false -> true. Ok(true) when this
    /// call won the flag; Ok(false) when the payout was already taken.
    async fn try_begin_payout(&self, id: Uuid) -> Result<bool, EngineError>;

    /// Compensation for a payout grant that could not be applied.
    async fn reset_payout(&self, id: Uuid) -> Result<(), EngineError>;

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Session>, EngineError>;
    async fn list_for_booker(&self, booker: PrincipalRef) -> Result<Vec<Session>, EngineError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, tx: Transaction) -> Result<(), EngineError>;
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, EngineError>;
    async fn find_by_payment_ref(
        &self,
        payment_ref: &str,
    ) -> Result<Option<Transaction>, EngineError>;

    /// Atomically moves PENDING -> COMPLETED. Ok(true) when this call did the
    /// completion, Ok(false) when it had already happened (duplicate webhook).
    async fn complete_once(&self, id: Uuid) -> Result<bool, EngineError>;

    async fn set_status(&self, id: Uuid, status: TransactionStatus) -> Result<(), EngineError>;
    async fn list_for(&self, owner: PrincipalRef) -> Result<Vec<Transaction>, EngineError>;
}

#[async_trait]
pub trait GiftCardStore: Send + Sync {
    async fn insert(&self, card: GiftCard) -> Result<(), EngineError>;
    async fn get(&self, id: Uuid) -> Result<Option<GiftCard>, EngineError>;
    async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, EngineError>;
    async fn find_by_payment_ref(
        &self,
        payment_ref: &str,
    ) -> Result<Option<GiftCard>, EngineError>;
    async fn code_exists(&self, code: &str) -> Result<bool, EngineError>;

    /// One-time redemption: removes the card in the same atomic step iff it
    /// is redeemable. Any other state fails with the specific rejection.
    async fn take_active_by_code(&self, code: &str) -> Result<GiftCard, EngineError>;

    /// Idempotent activation driven by gateway confirmation; an already
    /// active card is returned unchanged.
    async fn activate(&self, id: Uuid, payment_ref: &str) -> Result<GiftCard, EngineError>;

    async fn mark_payment_failed(&self, id: Uuid) -> Result<GiftCard, EngineError>;
}

#[async_trait]
pub trait CancellationStore: Send + Sync {
    async fn insert(&self, record: CancellationRecord) -> Result<(), EngineError>;
    async fn list_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<CancellationRecord>, EngineError>;
}

/// The injected store bundle the engine is wired with.
#[derive(Clone)]
pub struct Stores {
    pub principals: Arc<dyn PrincipalStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub gift_cards: Arc<dyn GiftCardStore>,
    pub cancellations: Arc<dyn CancellationStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            principals: store.clone(),
            sessions: store.clone(),
            transactions: store.clone(),
            gift_cards: store.clone(),
            cancellations: store,
        }
    }
}

/// DashMap-backed store: one entry per document, mutations run under the
/// entry lock, giving single-writer-per-document semantics.
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    experts: DashMap<Uuid, Expert>,
    sessions: DashMap<Uuid, Session>,
    transactions: DashMap<Uuid, Transaction>,
    gift_cards: DashMap<Uuid, GiftCard>,
    cancellations: DashMap<Uuid, CancellationRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            experts: DashMap::new(),
            sessions: DashMap::new(),
            transactions: DashMap::new(),
            gift_cards: DashMap::new(),
            cancellations: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn rejection_for(status: GiftCardStatus) -> GiftCardRejection {
    match status {
        GiftCardStatus::Redeemed => GiftCardRejection::AlreadyRedeemed,
        GiftCardStatus::Expired => GiftCardRejection::Expired,
        GiftCardStatus::PendingPayment | GiftCardStatus::AnonymousPendingPayment => {
            GiftCardRejection::PaymentPending
        }
        GiftCardStatus::PaymentFailed => GiftCardRejection::PaymentFailed,
        GiftCardStatus::Cancelled => GiftCardRejection::Cancelled,
        // A redeemable card that slipped past the atomic take lost a race.
        GiftCardStatus::Active | GiftCardStatus::AnonymousActive => {
            GiftCardRejection::AlreadyRedeemed
        }
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), EngineError> {
        self.users.insert(user.user_id, user);
        Ok(())
    }

    async fn insert_expert(&self, expert: Expert) -> Result<(), EngineError> {
        self.experts.insert(expert.expert_id, expert);
        Ok(())
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>, EngineError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn expert(&self, id: Uuid) -> Result<Option<Expert>, EngineError> {
        Ok(self.experts.get(&id).map(|e| e.clone()))
    }

    async fn credit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        tx_id: Uuid,
    ) -> Result<Decimal, EngineError> {
        match (owner, purse) {
            (PrincipalRef::User(id), WalletPurse::Legacy) => {
                let mut user = self
                    .users
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::NotFound(format!("User {id} not found")))?;
                user.wallet_balance += amount;
                user.ledger.push(tx_id);
                Ok(user.wallet_balance)
            }
            (PrincipalRef::Expert(id), WalletPurse::Earning | WalletPurse::Spending) => {
                let mut expert = self
                    .experts
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::NotFound(format!("Expert {id} not found")))?;
                let balance = {
                    let target = match purse {
                        WalletPurse::Earning => &mut expert.wallets.earning,
                        _ => &mut expert.wallets.spending,
                    };
                    target.balance += amount;
                    target.ledger.push(tx_id);
                    target.balance
                };
                // Deprecated single-purse view mirrors every purse mutation.
                expert.wallet_balance += amount;
                expert.ledger.push(tx_id);
                Ok(balance)
            }
            (PrincipalRef::User(_), _) => Err(EngineError::Validation(
                "User wallets have a single balance".to_string(),
            )),
            (PrincipalRef::Expert(_), WalletPurse::Legacy) => Err(EngineError::Validation(
                "Expert balances are held in named purses".to_string(),
            )),
        }
    }

    async fn debit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        tx_id: Uuid,
    ) -> Result<Decimal, EngineError> {
        match (owner, purse) {
            (PrincipalRef::User(id), WalletPurse::Legacy) => {
                let mut user = self
                    .users
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::NotFound(format!("User {id} not found")))?;
                if user.wallet_balance < amount {
                    return Err(EngineError::InsufficientFunds {
                        required: amount,
                        available: user.wallet_balance,
                    });
                }
                user.wallet_balance -= amount;
                user.ledger.push(tx_id);
                Ok(user.wallet_balance)
            }
            (PrincipalRef::Expert(id), WalletPurse::Earning | WalletPurse::Spending) => {
                let mut expert = self
                    .experts
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::NotFound(format!("Expert {id} not found")))?;
                let balance = {
                    let target = match purse {
                        WalletPurse::Earning => &mut expert.wallets.earning,
                        _ => &mut expert.wallets.spending,
                    };
                    if target.balance < amount {
                        return Err(EngineError::InsufficientFunds {
                            required: amount,
                            available: target.balance,
                        });
                    }
                    target.balance -= amount;
                    target.ledger.push(tx_id);
                    target.balance
                };
                expert.wallet_balance -= amount;
                expert.ledger.push(tx_id);
                Ok(balance)
            }
            (PrincipalRef::User(_), _) => Err(EngineError::Validation(
                "User wallets have a single balance".to_string(),
            )),
            (PrincipalRef::Expert(_), WalletPurse::Legacy) => Err(EngineError::Validation(
                "Expert balances are held in named purses".to_string(),
            )),
        }
    }

    async fn apply_rating(&self, expert_id: Uuid, rating: u8) -> Result<f64, EngineError> {
        let mut expert = self
            .experts
            .get_mut(&expert_id)
            .ok_or_else(|| EngineError::NotFound(format!("Expert {expert_id} not found")))?;
        let count = expert.number_of_ratings as f64;
        let new_average = (expert.average_rating * count + f64::from(rating)) / (count + 1.0);
        expert.average_rating = new_average;
        expert.number_of_ratings += 1;
        Ok(new_average)
    }

    async fn set_free_session_enabled(
        &self,
        expert_id: Uuid,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let mut expert = self
            .experts
            .get_mut(&expert_id)
            .ok_or_else(|| EngineError::NotFound(format!("Expert {expert_id} not found")))?;
        expert.free_session_enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: Session) -> Result<(), EngineError> {
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, EngineError> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.sessions.remove(&id);
        Ok(())
    }

    async fn put_versioned(&self, session: Session) -> Result<Session, EngineError> {
        let mut entry = self.sessions.get_mut(&session.session_id).ok_or_else(|| {
            EngineError::NotFound(format!("Session {} not found", session.session_id))
        })?;
        if entry.version != session.version {
            return Err(EngineError::Conflict(format!(
                "Session {} was modified concurrently",
                session.session_id
            )));
        }
        let mut updated = session;
        updated.version += 1;
        updated.updated_at = Utc::now();
        *entry = updated.clone();
        Ok(updated)
    }

    async fn slot_occupied(&self, server_id: Uuid, slot: &Slot) -> Result<bool, EngineError> {
        Ok(self.sessions.iter().any(|s| {
            s.server_id == server_id && s.status.occupies_slot() && s.slots.contains(slot)
        }))
    }

    async fn has_prior_with_server(
        &self,
        booker_id: Uuid,
        server_id: Uuid,
    ) -> Result<bool, EngineError> {
        Ok(self.sessions.iter().any(|s| {
            s.server_id == server_id
                && s.booker.id() == booker_id
                && s.status != crate::models::SessionStatus::Cancelled
        }))
    }

    async fn try_begin_payout(&self, id: Uuid) -> Result<bool, EngineError> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Session {id} not found")))?;
        if entry.payout_processed {
            return Ok(false);
        }
        entry.payout_processed = true;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_payout(&self, id: Uuid) -> Result<(), EngineError> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Session {id} not found")))?;
        entry.payout_processed = false;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Session>, EngineError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.server_id == server_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn list_for_booker(&self, booker: PrincipalRef) -> Result<Vec<Session>, EngineError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.booker == booker)
            .map(|s| s.clone())
            .collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert(&self, tx: Transaction) -> Result<(), EngineError> {
        self.transactions.insert(tx.transaction_id, tx);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, EngineError> {
        Ok(self.transactions.get(&id).map(|t| t.clone()))
    }

    async fn find_by_payment_ref(
        &self,
        payment_ref: &str,
    ) -> Result<Option<Transaction>, EngineError> {
        Ok(self
            .transactions
            .iter()
            .find(|t| t.payment_ref.as_deref() == Some(payment_ref))
            .map(|t| t.clone()))
    }

    async fn complete_once(&self, id: Uuid) -> Result<bool, EngineError> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Transaction {id} not found")))?;
        match entry.status {
            TransactionStatus::Completed => Ok(false),
            TransactionStatus::Pending => {
                entry.status = TransactionStatus::Completed;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            status => Err(EngineError::Conflict(format!(
                "Transaction {id} cannot complete from {status:?}"
            ))),
        }
    }

    async fn set_status(&self, id: Uuid, status: TransactionStatus) -> Result<(), EngineError> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Transaction {id} not found")))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_for(&self, owner: PrincipalRef) -> Result<Vec<Transaction>, EngineError> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.owner == owner)
            .map(|t| t.clone())
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }
}

#[async_trait]
impl GiftCardStore for MemoryStore {
    async fn insert(&self, card: GiftCard) -> Result<(), EngineError> {
        self.gift_cards.insert(card.gift_card_id, card);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<GiftCard>, EngineError> {
        Ok(self.gift_cards.get(&id).map(|c| c.clone()))
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>, EngineError> {
        Ok(self
            .gift_cards
            .iter()
            .find(|c| c.redemption_code == code)
            .map(|c| c.clone()))
    }

    async fn find_by_payment_ref(
        &self,
        payment_ref: &str,
    ) -> Result<Option<GiftCard>, EngineError> {
        Ok(self
            .gift_cards
            .iter()
            .find(|c| c.payment_ref.as_deref() == Some(payment_ref))
            .map(|c| c.clone()))
    }

    async fn code_exists(&self, code: &str) -> Result<bool, EngineError> {
        Ok(self.gift_cards.iter().any(|c| c.redemption_code == code))
    }

    async fn take_active_by_code(&self, code: &str) -> Result<GiftCard, EngineError> {
        let id = match self
            .gift_cards
            .iter()
            .find(|c| c.redemption_code == code)
            .map(|c| c.gift_card_id)
        {
            Some(id) => id,
            None => {
                return Err(EngineError::GiftCardInvalid {
                    reason: GiftCardRejection::NotFound,
                })
            }
        };
        let now = Utc::now();
        if let Some((_, card)) = self.gift_cards.remove_if(&id, |_, c| {
            c.status.is_redeemable() && c.expires_at.map_or(true, |t| t > now)
        }) {
            return Ok(card);
        }
        // The card is still there in a non-redeemable state, or another
        // redemption won the race and removed it.
        match self.gift_cards.get(&id) {
            Some(card) if card.expires_at.map_or(false, |t| t <= now) => {
                Err(EngineError::GiftCardInvalid {
                    reason: GiftCardRejection::Expired,
                })
            }
            Some(card) => Err(EngineError::GiftCardInvalid {
                reason: rejection_for(card.status),
            }),
            None => Err(EngineError::GiftCardInvalid {
                reason: GiftCardRejection::AlreadyRedeemed,
            }),
        }
    }

    async fn activate(&self, id: Uuid, payment_ref: &str) -> Result<GiftCard, EngineError> {
        let mut entry = self
            .gift_cards
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Gift card {id} not found")))?;
        if entry.status.is_redeemable() {
            return Ok(entry.clone());
        }
        if !entry.status.is_pending_payment() {
            return Err(EngineError::Conflict(format!(
                "Gift card {id} is not awaiting payment"
            )));
        }
        entry.status = if entry.send_anonymously {
            GiftCardStatus::AnonymousActive
        } else {
            GiftCardStatus::Active
        };
        entry.balance = entry.original_amount;
        entry.payment_ref = Some(payment_ref.to_string());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn mark_payment_failed(&self, id: Uuid) -> Result<GiftCard, EngineError> {
        let mut entry = self
            .gift_cards
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Gift card {id} not found")))?;
        entry.status = GiftCardStatus::PaymentFailed;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

#[async_trait]
impl CancellationStore for MemoryStore {
    async fn insert(&self, record: CancellationRecord) -> Result<(), EngineError> {
        self.cancellations.insert(record.record_id, record);
        Ok(())
    }

    async fn list_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<CancellationRecord>, EngineError> {
        Ok(self
            .cancellations
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Expert, User};

    #[tokio::test]
    async fn debit_checks_balance_atomically() {
        let store = MemoryStore::new();
        let user = User::new("Sara", "Anwar", "sara@example.com");
        let owner = PrincipalRef::User(user.user_id);
        store.insert_user(user).await.unwrap();

        store
            .credit(owner, WalletPurse::Legacy, Decimal::from(50), Uuid::new_v4())
            .await
            .unwrap();

        let err = store
            .debit(owner, WalletPurse::Legacy, Decimal::from(60), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_FUNDS");

        let balance = store
            .debit(owner, WalletPurse::Legacy, Decimal::from(50), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn expert_purse_mutations_mirror_legacy_balance() {
        let store = MemoryStore::new();
        let expert = Expert::new("Omar", "Hadi", "omar@example.com");
        let id = expert.expert_id;
        let owner = PrincipalRef::Expert(id);
        store.insert_expert(expert).await.unwrap();

        store
            .credit(owner, WalletPurse::Earning, Decimal::from(70), Uuid::new_v4())
            .await
            .unwrap();
        store
            .credit(owner, WalletPurse::Spending, Decimal::from(30), Uuid::new_v4())
            .await
            .unwrap();
        store
            .debit(owner, WalletPurse::Spending, Decimal::from(10), Uuid::new_v4())
            .await
            .unwrap();

        let expert = store.expert(id).await.unwrap().unwrap();
        assert_eq!(expert.wallets.earning.balance, Decimal::from(70));
        assert_eq!(expert.wallets.spending.balance, Decimal::from(20));
        assert_eq!(
            expert.wallet_balance,
            expert.wallets.earning.balance + expert.wallets.spending.balance
        );
        assert_eq!(expert.ledger.len(), 3);
    }

    #[tokio::test]
    async fn rating_update_is_incremental_mean() {
        let store = MemoryStore::new();
        let expert = Expert::new("Lina", "Said", "lina@example.com");
        let id = expert.expert_id;
        store.insert_expert(expert).await.unwrap();

        assert_eq!(store.apply_rating(id, 4).await.unwrap(), 4.0);
        assert_eq!(store.apply_rating(id, 5).await.unwrap(), 4.5);
        let expert = store.expert(id).await.unwrap().unwrap();
        assert_eq!(expert.number_of_ratings, 2);
    }
}
