use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    PaymentChannel, PrincipalRef, Transaction, TransactionKind, TransactionStatus,
};
use crate::store::TransactionStore;

/// Append-only transaction recording. Every wallet balance mutation pairs
/// with exactly one entry written here; entries are never deleted, only
/// status-advanced by gateway confirmation.
#[derive(Clone)]
pub struct LedgerService {
    transactions: Arc<dyn TransactionStore>,
    currency: String,
}

impl LedgerService {
    pub fn new(transactions: Arc<dyn TransactionStore>, currency: String) -> Self {
        Self {
            transactions,
            currency,
        }
    }

    /// Builds an entry without persisting it, so callers can reserve the
    /// transaction id before the paired balance write.
    pub fn entry(
        &self,
        owner: PrincipalRef,
        kind: TransactionKind,
        status: TransactionStatus,
        channel: PaymentChannel,
        amount: Decimal,
        description: &str,
    ) -> Transaction {
        let now = Utc::now();
        Transaction {
            transaction_id: Uuid::new_v4(),
            owner,
            kind,
            amount,
            currency: self.currency.clone(),
            status,
            channel,
            payment_ref: None,
            description: description.to_string(),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn record(&self, tx: Transaction) -> Result<Transaction, EngineError> {
        tracing::info!(
            transaction_id = %tx.transaction_id,
            owner = %tx.owner.id(),
            kind = ?tx.kind,
            amount = %tx.amount,
            status = ?tx.status,
            "ledger entry recorded"
        );
        self.transactions.insert(tx.clone()).await?;
        Ok(tx)
    }

    /// Idempotent completion: Ok(true) when this call moved the entry to
    /// COMPLETED, Ok(false) when a duplicate confirmation already had.
    pub async fn complete_once(&self, id: Uuid) -> Result<bool, EngineError> {
        self.transactions.complete_once(id).await
    }

    pub async fn set_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), EngineError> {
        self.transactions.set_status(id, status).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Transaction, EngineError> {
        self.transactions
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Transaction {id} not found")))
    }

    pub async fn find_by_payment_ref(
        &self,
        payment_ref: &str,
    ) -> Result<Option<Transaction>, EngineError> {
        self.transactions.find_by_payment_ref(payment_ref).await
    }

    pub async fn list_for(&self, owner: PrincipalRef) -> Result<Vec<Transaction>, EngineError> {
        self.transactions.list_for(owner).await
    }
}
