use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::availability::AvailabilityService;
use crate::booking::BookingService;
use crate::config::BookingConfig;
use crate::error::EngineError;
use crate::gateways::{PaymentGateway, SandboxGateway};
use crate::giftcard::GiftCardService;
use crate::ledger::LedgerService;
use crate::lifecycle::LifecycleService;
use crate::meetings::{MeetingProvider, StubMeetingProvider};
use crate::models::{
    BookingRequest, Expert, GiftCard, GiftCardPurchaseRequest, PrincipalRef, Redemption, Session,
    TopUpIntent, TopUpOutcome, Transaction, TransitionAction, User, WalletBalances, WalletPurse,
};
use crate::notifications::{LoggingNotifier, Notifier};
use crate::payout::PayoutCalculator;
use crate::store::Stores;
use crate::wallet::WalletService;

/// Facade wiring the engine's services over one store bundle and one set of
/// external collaborators. HTTP controllers (out of scope here) call this.
#[derive(Clone)]
pub struct BookingEngine {
    stores: Stores,
    booking: BookingService,
    lifecycle: LifecycleService,
    availability: AvailabilityService,
    gift_cards: GiftCardService,
    wallet: WalletService,
}

impl BookingEngine {
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        meetings: Arc<dyn MeetingProvider>,
        config: BookingConfig,
    ) -> Self {
        let ledger = LedgerService::new(stores.transactions.clone(), config.currency.clone());
        let wallet = WalletService::new(
            stores.principals.clone(),
            ledger,
            gateway.clone(),
            config.clone(),
        );
        let gift_cards = GiftCardService::new(
            stores.gift_cards.clone(),
            gateway,
            notifier.clone(),
            config.currency.clone(),
        );
        let availability = AvailabilityService::new(stores.sessions.clone());
        let payout = PayoutCalculator::new(config.payout.clone());
        let booking = BookingService::new(
            stores.principals.clone(),
            stores.sessions.clone(),
            availability.clone(),
            wallet.clone(),
            gift_cards.clone(),
            payout.clone(),
            notifier.clone(),
            config.clone(),
        );
        let lifecycle = LifecycleService::new(
            stores.sessions.clone(),
            stores.principals.clone(),
            stores.cancellations.clone(),
            wallet.clone(),
            payout,
            meetings,
            notifier,
            config,
        );
        Self {
            stores,
            booking,
            lifecycle,
            availability,
            gift_cards,
            wallet,
        }
    }

    /// Engine over the in-memory store with sandbox collaborators.
    pub fn in_memory(config: BookingConfig) -> Self {
        Self::new(
            Stores::in_memory(),
            Arc::new(SandboxGateway::new()),
            Arc::new(LoggingNotifier),
            Arc::new(StubMeetingProvider),
            config,
        )
    }

    // Booking & lifecycle

    pub async fn book_session(&self, request: BookingRequest) -> Result<Session, EngineError> {
        self.booking.book_session(request).await
    }

    pub async fn transition_session(
        &self,
        session_id: Uuid,
        action: TransitionAction,
        actor: PrincipalRef,
    ) -> Result<Session, EngineError> {
        self.lifecycle.transition(session_id, action, actor).await
    }

    pub async fn is_available(
        &self,
        server_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<bool, EngineError> {
        self.availability.is_available(server_id, date, time).await
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Option<Session>, EngineError> {
        self.stores.sessions.get(session_id).await
    }

    // Gift cards

    pub async fn redeem_gift_card(
        &self,
        code: &str,
        session_price: Decimal,
    ) -> Result<Redemption, EngineError> {
        self.gift_cards.redeem(code, session_price).await
    }

    pub async fn purchase_gift_card(
        &self,
        request: GiftCardPurchaseRequest,
    ) -> Result<GiftCard, EngineError> {
        self.gift_cards.purchase(request).await
    }

    pub async fn confirm_gift_card_payment(
        &self,
        payment_ref: &str,
    ) -> Result<GiftCard, EngineError> {
        self.gift_cards.confirm_payment(payment_ref).await
    }

    pub async fn gift_card_by_code(&self, code: &str) -> Result<GiftCard, EngineError> {
        self.gift_cards.preview(code).await
    }

    // Wallets

    pub async fn wallet_balances(
        &self,
        owner: PrincipalRef,
    ) -> Result<WalletBalances, EngineError> {
        self.wallet.balances(owner).await
    }

    pub async fn transactions_for(
        &self,
        owner: PrincipalRef,
    ) -> Result<Vec<Transaction>, EngineError> {
        self.wallet.transactions_for(owner).await
    }

    pub async fn begin_top_up(
        &self,
        owner: PrincipalRef,
        purse: WalletPurse,
        amount: Decimal,
    ) -> Result<TopUpIntent, EngineError> {
        self.wallet.begin_top_up(owner, purse, amount).await
    }

    pub async fn verify_top_up(&self, payment_ref: &str) -> Result<TopUpOutcome, EngineError> {
        self.wallet.verify_top_up(payment_ref).await
    }

    pub async fn request_withdrawal(
        &self,
        expert_id: Uuid,
        amount: Decimal,
    ) -> Result<Transaction, EngineError> {
        self.wallet.request_withdrawal(expert_id, amount).await
    }

    pub async fn settle_withdrawal(
        &self,
        transaction_id: Uuid,
        approved: bool,
    ) -> Result<Transaction, EngineError> {
        self.wallet.settle_withdrawal(transaction_id, approved).await
    }

    // Principal management (registration lives with the out-of-scope user
    // service; these exist for seeding and administration)

    pub async fn register_user(&self, user: User) -> Result<(), EngineError> {
        self.stores.principals.insert_user(user).await
    }

    pub async fn register_expert(&self, expert: Expert) -> Result<(), EngineError> {
        self.stores.principals.insert_expert(expert).await
    }

    pub async fn set_free_session_enabled(
        &self,
        expert_id: Uuid,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.stores
            .principals
            .set_free_session_enabled(expert_id, enabled)
            .await
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }
}
