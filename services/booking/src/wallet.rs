use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::BookingConfig;
use crate::error::EngineError;
use crate::gateways::{ChargeRequest, PaymentGateway};
use crate::ledger::LedgerService;
use crate::models::{
    PaymentChannel, PrincipalRef, TopUpIntent, TopUpOutcome, Transaction, TransactionKind,
    TransactionStatus, WalletBalances, WalletPurse,
};
use crate::store::PrincipalStore;

/// The purse a booker pays out of: users hold a single balance, experts
/// spend from their spending purse.
pub fn booking_purse(owner: PrincipalRef) -> WalletPurse {
    match owner {
        PrincipalRef::User(_) => WalletPurse::Legacy,
        PrincipalRef::Expert(_) => WalletPurse::Spending,
    }
}

/// Balance movements paired 1:1 with ledger entries. Debits are atomic
/// check-and-debit; credits never fail for an existing principal.
#[derive(Clone)]
pub struct WalletService {
    principals: Arc<dyn PrincipalStore>,
    ledger: LedgerService,
    gateway: Arc<dyn PaymentGateway>,
    config: BookingConfig,
}

impl WalletService {
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        ledger: LedgerService,
        gateway: Arc<dyn PaymentGateway>,
        config: BookingConfig,
    ) -> Self {
        Self {
            principals,
            ledger,
            gateway,
            config,
        }
    }

    pub async fn balances(&self, owner: PrincipalRef) -> Result<WalletBalances, EngineError> {
        match owner {
            PrincipalRef::User(id) => {
                let user = self
                    .principals
                    .user(id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("User {id} not found")))?;
                Ok(WalletBalances {
                    legacy: user.wallet_balance,
                    earning: Decimal::ZERO,
                    spending: Decimal::ZERO,
                    currency: self.config.currency.clone(),
                })
            }
            PrincipalRef::Expert(id) => {
                let expert = self
                    .principals
                    .expert(id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("Expert {id} not found")))?;
                Ok(WalletBalances {
                    legacy: expert.wallet_balance,
                    earning: expert.wallets.earning.balance,
                    spending: expert.wallets.spending.balance,
                    currency: self.config.currency.clone(),
                })
            }
        }
    }

    pub async fn purse_balance(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
    ) -> Result<Decimal, EngineError> {
        let balances = self.balances(owner).await?;
        Ok(match purse {
            WalletPurse::Legacy => balances.legacy,
            WalletPurse::Earning => balances.earning,
            WalletPurse::Spending => balances.spending,
        })
    }

    /// Debits the purse and records the paired PAYMENT entry. Fails with
    /// `INSUFFICIENT_FUNDS` before any state changes.
    pub async fn debit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Transaction, EngineError> {
        let mut tx = self.ledger.entry(
            owner,
            TransactionKind::Payment,
            TransactionStatus::Completed,
            PaymentChannel::Wallet,
            amount,
            description,
        );
        tx.metadata = metadata;
        let balance = self
            .principals
            .debit(owner, purse, amount, tx.transaction_id)
            .await?;
        let tx = self.ledger.record(tx).await?;
        tracing::info!(
            owner = %owner.id(),
            ?purse,
            %amount,
            new_balance = %balance,
            "wallet debited"
        );
        Ok(tx)
    }

    /// Credits the purse (DEPOSIT or REFUND) and records the paired entry.
    pub async fn credit(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
        kind: TransactionKind,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Transaction, EngineError> {
        let mut tx = self.ledger.entry(
            owner,
            kind,
            TransactionStatus::Completed,
            PaymentChannel::Wallet,
            amount,
            description,
        );
        tx.metadata = metadata;
        let balance = self
            .principals
            .credit(owner, purse, amount, tx.transaction_id)
            .await?;
        let tx = self.ledger.record(tx).await?;
        tracing::info!(
            owner = %owner.id(),
            ?purse,
            %amount,
            new_balance = %balance,
            "wallet credited"
        );
        Ok(tx)
    }

    /// Starts a gateway-funded top-up: the charge is created and a PENDING
    /// DEPOSIT entry carries the charge reference. Nothing is credited until
    /// the gateway confirms.
    pub async fn begin_top_up(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
    ) -> Result<TopUpIntent, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "Top-up amount must be a positive number".to_string(),
            ));
        }
        match (owner, purse) {
            (PrincipalRef::User(_), WalletPurse::Legacy) => {}
            (PrincipalRef::Expert(_), WalletPurse::Earning | WalletPurse::Spending) => {}
            _ => {
                return Err(EngineError::Validation(
                    "Unsupported wallet purse for this principal".to_string(),
                ))
            }
        }

        let mut gateway_metadata = HashMap::new();
        gateway_metadata.insert("owner_id".to_string(), owner.id().to_string());
        gateway_metadata.insert("type".to_string(), "wallet_top_up".to_string());
        let charge = self
            .gateway
            .charge(ChargeRequest {
                amount,
                currency: self.config.currency.clone(),
                description: "Wallet top-up".to_string(),
                metadata: gateway_metadata,
            })
            .await?;

        let mut tx = self.ledger.entry(
            owner,
            TransactionKind::Deposit,
            TransactionStatus::Pending,
            PaymentChannel::Gateway,
            amount,
            "Wallet top-up",
        );
        tx.payment_ref = Some(charge.charge_id.clone());
        tx.metadata = Some(serde_json::json!({ "purse": purse }));
        let tx = self.ledger.record(tx).await?;

        Ok(TopUpIntent {
            transaction: tx,
            checkout_ref: charge.charge_id,
        })
    }

    /// Confirms a top-up from the gateway status. Idempotent: an entry that
    /// is already COMPLETED returns the applied result without crediting
    /// again, whether the duplicate came from a webhook or a client poll.
    pub async fn verify_top_up(&self, payment_ref: &str) -> Result<TopUpOutcome, EngineError> {
        let tx = self
            .ledger
            .find_by_payment_ref(payment_ref)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound("Transaction record not found".to_string())
            })?;

        if tx.status == TransactionStatus::Completed {
            return Ok(TopUpOutcome {
                transaction: tx,
                newly_applied: false,
            });
        }

        let charge = self.gateway.get_status(payment_ref).await?;
        if charge.is_successful() {
            let newly_applied = self.ledger.complete_once(tx.transaction_id).await?;
            if newly_applied {
                let purse = tx
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("purse"))
                    .and_then(|p| serde_json::from_value::<WalletPurse>(p.clone()).ok())
                    .unwrap_or_else(|| booking_purse(tx.owner));
                self.principals
                    .credit(tx.owner, purse, tx.amount, tx.transaction_id)
                    .await?;
                tracing::info!(
                    owner = %tx.owner.id(),
                    amount = %tx.amount,
                    charge_id = %payment_ref,
                    "top-up confirmed and credited"
                );
            }
            Ok(TopUpOutcome {
                transaction: self.ledger.get(tx.transaction_id).await?,
                newly_applied,
            })
        } else if charge.is_failed() {
            self.ledger
                .set_status(tx.transaction_id, TransactionStatus::Failed)
                .await?;
            tracing::warn!(
                charge_id = %payment_ref,
                result_code = %charge.result_code,
                "top-up payment failed"
            );
            Ok(TopUpOutcome {
                transaction: self.ledger.get(tx.transaction_id).await?,
                newly_applied: false,
            })
        } else {
            Ok(TopUpOutcome {
                transaction: tx,
                newly_applied: false,
            })
        }
    }

    /// Files a withdrawal from the expert's earning purse. Funds leave the
    /// purse up front; the WITHDRAWAL entry stays PENDING until settled.
    pub async fn request_withdrawal(
        &self,
        expert_id: Uuid,
        amount: Decimal,
    ) -> Result<Transaction, EngineError> {
        if amount < self.config.min_withdrawal_amount {
            return Err(EngineError::Validation(format!(
                "Amount must be at least {} {}",
                self.config.min_withdrawal_amount, self.config.currency
            )));
        }
        let owner = PrincipalRef::Expert(expert_id);
        let tx = self.ledger.entry(
            owner,
            TransactionKind::Withdrawal,
            TransactionStatus::Pending,
            PaymentChannel::Gateway,
            amount,
            "Earning wallet withdrawal",
        );
        self.principals
            .debit(owner, WalletPurse::Earning, amount, tx.transaction_id)
            .await?;
        let tx = self.ledger.record(tx).await?;
        tracing::info!(
            expert_id = %expert_id,
            %amount,
            transaction_id = %tx.transaction_id,
            "withdrawal requested"
        );
        Ok(tx)
    }

    /// Settles a pending withdrawal. Approval completes the entry; decline
    /// returns the funds to the earning purse with a paired REFUND entry.
    pub async fn settle_withdrawal(
        &self,
        transaction_id: Uuid,
        approved: bool,
    ) -> Result<Transaction, EngineError> {
        let tx = self.ledger.get(transaction_id).await?;
        if tx.kind != TransactionKind::Withdrawal {
            return Err(EngineError::Validation(
                "Transaction is not a withdrawal".to_string(),
            ));
        }

        if approved {
            self.ledger.complete_once(transaction_id).await?;
            return self.ledger.get(transaction_id).await;
        }

        match tx.status {
            TransactionStatus::Cancelled => Ok(tx),
            TransactionStatus::Pending => {
                self.ledger
                    .set_status(transaction_id, TransactionStatus::Cancelled)
                    .await?;
                self.credit(
                    tx.owner,
                    WalletPurse::Earning,
                    tx.amount,
                    TransactionKind::Refund,
                    "Withdrawal declined, funds returned",
                    Some(serde_json::json!({ "withdrawal_id": transaction_id })),
                )
                .await?;
                self.ledger.get(transaction_id).await
            }
            status => Err(EngineError::Conflict(format!(
                "Withdrawal {transaction_id} cannot be declined from {status:?}"
            ))),
        }
    }

    pub async fn transactions_for(
        &self,
        owner: PrincipalRef,
    ) -> Result<Vec<Transaction>, EngineError> {
        self.ledger.list_for(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::SandboxGateway;
    use crate::models::Expert;
    use crate::store::Stores;

    fn wallet_with_gateway() -> (WalletService, Arc<SandboxGateway>, Stores) {
        let stores = Stores::in_memory();
        let gateway = Arc::new(SandboxGateway::new());
        let config = BookingConfig::default();
        let ledger = LedgerService::new(stores.transactions.clone(), config.currency.clone());
        let wallet = WalletService::new(
            stores.principals.clone(),
            ledger,
            gateway.clone(),
            config,
        );
        (wallet, gateway, stores)
    }

    async fn seeded_expert(stores: &Stores) -> Uuid {
        let expert = Expert::new("Noor", "Aziz", "noor@example.com");
        let id = expert.expert_id;
        stores.principals.insert_expert(expert).await.unwrap();
        id
    }

    #[tokio::test]
    async fn top_up_verify_is_idempotent() {
        let (wallet, gateway, stores) = wallet_with_gateway();
        let expert_id = seeded_expert(&stores).await;
        let owner = PrincipalRef::Expert(expert_id);

        let intent = wallet
            .begin_top_up(owner, WalletPurse::Spending, Decimal::from(100))
            .await
            .unwrap();
        gateway.settle(&intent.checkout_ref, "000.000.100");

        let first = wallet.verify_top_up(&intent.checkout_ref).await.unwrap();
        assert!(first.newly_applied);
        let second = wallet.verify_top_up(&intent.checkout_ref).await.unwrap();
        assert!(!second.newly_applied);

        let balances = wallet.balances(owner).await.unwrap();
        assert_eq!(balances.spending, Decimal::from(100));
    }

    #[tokio::test]
    async fn declined_withdrawal_returns_funds() {
        let (wallet, _gateway, stores) = wallet_with_gateway();
        let expert_id = seeded_expert(&stores).await;
        let owner = PrincipalRef::Expert(expert_id);

        wallet
            .credit(
                owner,
                WalletPurse::Earning,
                Decimal::from(80),
                TransactionKind::Deposit,
                "Session earnings",
                None,
            )
            .await
            .unwrap();

        let tx = wallet
            .request_withdrawal(expert_id, Decimal::from(50))
            .await
            .unwrap();
        assert_eq!(
            wallet.purse_balance(owner, WalletPurse::Earning).await.unwrap(),
            Decimal::from(30)
        );

        let settled = wallet.settle_withdrawal(tx.transaction_id, false).await.unwrap();
        assert_eq!(settled.status, TransactionStatus::Cancelled);
        assert_eq!(
            wallet.purse_balance(owner, WalletPurse::Earning).await.unwrap(),
            Decimal::from(80)
        );
    }

    #[tokio::test]
    async fn withdrawal_below_minimum_is_rejected() {
        let (wallet, _gateway, stores) = wallet_with_gateway();
        let expert_id = seeded_expert(&stores).await;
        let err = wallet
            .request_withdrawal(expert_id, Decimal::from(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }
}
