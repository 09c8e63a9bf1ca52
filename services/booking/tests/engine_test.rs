use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use consultlink_booking::gateways::SandboxGateway;
use consultlink_booking::meetings::StubMeetingProvider;
use consultlink_booking::notifications::LoggingNotifier;
use consultlink_booking::{
    BookingConfig, BookingEngine, BookingRequest, DurationBand, Expert, GiftCardPurchaseRequest,
    PaymentMethod, PaymentStatus, PrincipalRef, SessionKind, SessionStatus, Slot, Stores,
    TransactionKind, TransitionAction, User, WalletPurse,
};

struct Harness {
    engine: BookingEngine,
    gateway: Arc<SandboxGateway>,
}

fn harness() -> Harness {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consultlink_booking=debug".into()),
        )
        .with_test_writer()
        .try_init()
        .ok();

    let gateway = Arc::new(SandboxGateway::new());
    let engine = BookingEngine::new(
        Stores::in_memory(),
        gateway.clone(),
        Arc::new(LoggingNotifier),
        Arc::new(StubMeetingProvider),
        BookingConfig::default(),
    );
    Harness { engine, gateway }
}

impl Harness {
    async fn seed_user(&self, balance: i64) -> PrincipalRef {
        let user = User::new("Maha", "Karim", "maha@example.com");
        let owner = PrincipalRef::User(user.user_id);
        self.engine.register_user(user).await.unwrap();
        if balance > 0 {
            self.fund(owner, WalletPurse::Legacy, balance).await;
        }
        owner
    }

    async fn seed_expert(&self, average_rating: f64) -> Uuid {
        let mut expert = Expert::new("Rania", "Fahad", "rania@example.com");
        expert.average_rating = average_rating;
        expert.number_of_ratings = if average_rating > 0.0 { 10 } else { 0 };
        let id = expert.expert_id;
        self.engine.register_expert(expert).await.unwrap();
        id
    }

    async fn fund(&self, owner: PrincipalRef, purse: WalletPurse, amount: i64) {
        let intent = self
            .engine
            .begin_top_up(owner, purse, Decimal::from(amount))
            .await
            .unwrap();
        self.gateway.settle(&intent.checkout_ref, "CAPTURED");
        let outcome = self.engine.verify_top_up(&intent.checkout_ref).await.unwrap();
        assert!(outcome.newly_applied);
    }

    async fn active_gift_card(&self, amount: i64) -> String {
        let card = self
            .engine
            .purchase_gift_card(GiftCardPurchaseRequest {
                amount: Decimal::from(amount),
                purchaser: None,
                purchaser_email: "buyer@example.com".to_string(),
                recipient_email: "maha@example.com".to_string(),
                recipient_message: None,
                send_anonymously: false,
            })
            .await
            .unwrap();
        let charge_id = card.payment_ref.clone().unwrap();
        self.gateway.settle(&charge_id, "000.000.000");
        let card = self.engine.confirm_gift_card_payment(&charge_id).await.unwrap();
        card.redemption_code
    }
}

fn slot(day: u32, time: &str) -> Slot {
    Slot::new(NaiveDate::from_ymd_opt(2027, 3, day).unwrap(), time)
}

fn booking(booker: PrincipalRef, server_id: Uuid, price: i64, s: Slot) -> BookingRequest {
    BookingRequest {
        kind: match booker {
            PrincipalRef::User(_) => SessionKind::UserToExpert,
            PrincipalRef::Expert(_) => SessionKind::ExpertToExpert,
        },
        booker,
        server_id,
        area_of_expertise: "Career coaching".to_string(),
        slots: vec![s],
        duration: DurationBand::Regular30,
        note: None,
        price: Decimal::from(price),
        redemption_code: None,
    }
}

#[tokio::test]
async fn wallet_booking_debits_exactly_the_price() {
    let h = harness();
    let booker = h.seed_user(150).await;
    let expert_id = h.seed_expert(3.5).await;

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 100, slot(10, "10:00")))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Unconfirmed);
    assert_eq!(session.payment_method, PaymentMethod::Wallet);
    assert_eq!(session.payment_status, PaymentStatus::Completed);
    assert_eq!(session.payment_amount, Decimal::from(100));
    assert!(!session.payout_processed);

    let balances = h.engine.wallet_balances(booker).await.unwrap();
    assert_eq!(balances.legacy, Decimal::from(50));

    // Every balance mutation has a matching ledger entry.
    let txs = h.engine.transactions_for(booker).await.unwrap();
    assert!(txs
        .iter()
        .any(|t| t.kind == TransactionKind::Payment && t.amount == Decimal::from(100)));
}

#[tokio::test]
async fn insufficient_funds_leaves_no_trace() {
    let h = harness();
    let booker = h.seed_user(50).await;
    let expert_id = h.seed_expert(4.5).await;

    let err = h
        .engine
        .book_session(booking(booker, expert_id, 60, slot(11, "09:00")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INSUFFICIENT_FUNDS");

    let balances = h.engine.wallet_balances(booker).await.unwrap();
    assert_eq!(balances.legacy, Decimal::from(50));
    let sessions = h
        .engine
        .stores()
        .sessions
        .list_for_server(expert_id)
        .await
        .unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn gift_card_discount_and_decline_refund_round_trip() {
    let h = harness();
    let booker = h.seed_user(200).await;
    let expert_id = h.seed_expert(4.0).await;
    let code = h.active_gift_card(40).await;

    let mut request = booking(booker, expert_id, 100, slot(12, "14:00"));
    request.redemption_code = Some(code.clone());
    let session = h.engine.book_session(request).await.unwrap();

    assert_eq!(session.payment_method, PaymentMethod::GiftCardPlusWallet);
    assert_eq!(session.gift_card_amount_redeemed, Decimal::from(40));
    assert_eq!(session.payment_amount, Decimal::from(60));
    assert_eq!(
        h.engine.wallet_balances(booker).await.unwrap().legacy,
        Decimal::from(140)
    );

    // The card is single-use: the same code is dead for a second booking.
    let err = h
        .engine
        .redeem_gift_card(&code, Decimal::from(10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "GIFT_CARD_INVALID");

    // Declining refunds the wallet-paid 60, never the gift-carded 40.
    let declined = h
        .engine
        .transition_session(
            session.session_id,
            TransitionAction::Decline,
            PrincipalRef::Expert(expert_id),
        )
        .await
        .unwrap();
    assert_eq!(declined.status, SessionStatus::Rejected);
    assert_eq!(declined.payment_status, PaymentStatus::RefundedToWallet);
    assert_eq!(
        h.engine.wallet_balances(booker).await.unwrap().legacy,
        Decimal::from(200)
    );
}

#[tokio::test]
async fn fully_gift_carded_session_forfeits_value_on_decline() {
    let h = harness();
    let booker = h.seed_user(0).await;
    let expert_id = h.seed_expert(4.8).await;
    let code = h.active_gift_card(80).await;

    let mut request = booking(booker, expert_id, 50, slot(13, "16:00"));
    request.redemption_code = Some(code);
    let session = h.engine.book_session(request).await.unwrap();

    assert_eq!(session.payment_method, PaymentMethod::GiftCard);
    assert_eq!(session.payment_amount, Decimal::ZERO);
    assert_eq!(session.gift_card_amount_redeemed, Decimal::from(50));

    let declined = h
        .engine
        .transition_session(
            session.session_id,
            TransitionAction::Decline,
            PrincipalRef::Expert(expert_id),
        )
        .await
        .unwrap();
    assert_eq!(
        declined.payment_status,
        PaymentStatus::DeclinedGiftCardPayment
    );
    assert_eq!(
        h.engine.wallet_balances(booker).await.unwrap().legacy,
        Decimal::ZERO
    );
}

#[tokio::test]
async fn free_session_eligibility_zeroes_the_price() {
    let h = harness();
    let booker = h.seed_user(0).await;
    let expert_id = h.seed_expert(0.0).await;
    h.engine
        .set_free_session_enabled(expert_id, true)
        .await
        .unwrap();

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 90, slot(14, "11:00")))
        .await
        .unwrap();
    assert_eq!(session.price, Decimal::ZERO);
    assert_eq!(session.payment_method, PaymentMethod::Free);
    assert_eq!(session.payment_status, PaymentStatus::NotApplicable);

    // A second booking with the same expert is no longer free.
    let err = h
        .engine
        .book_session(booking(booker, expert_id, 90, slot(15, "11:00")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INSUFFICIENT_FUNDS");
}

#[tokio::test]
async fn availability_tracks_booking_and_cancellation() {
    let h = harness();
    let booker = h.seed_user(100).await;
    let expert_id = h.seed_expert(4.1).await;
    let date = NaiveDate::from_ymd_opt(2027, 3, 20).unwrap();

    assert!(h.engine.is_available(expert_id, date, "10:00").await.unwrap());

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 50, Slot::new(date, "10:00")))
        .await
        .unwrap();
    assert!(!h.engine.is_available(expert_id, date, "10:00").await.unwrap());

    // The same party is also blocked for expert-to-expert consultations.
    let other_expert = h.seed_expert(3.0).await;
    let other_ref = PrincipalRef::Expert(other_expert);
    h.fund(other_ref, WalletPurse::Spending, 100).await;
    let err = h
        .engine
        .book_session(booking(other_ref, expert_id, 50, Slot::new(date, "10:00")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SLOT_UNAVAILABLE");

    h.engine
        .transition_session(
            session.session_id,
            TransitionAction::Cancel {
                reasons: vec!["Schedule conflict".to_string()],
                other_reason: None,
                purge: false,
            },
            booker,
        )
        .await
        .unwrap();
    assert!(h.engine.is_available(expert_id, date, "10:00").await.unwrap());
}

#[tokio::test]
async fn cancel_refunds_wallet_payment_and_records_audit() {
    let h = harness();
    let booker = h.seed_user(100).await;
    let expert_id = h.seed_expert(4.1).await;

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 70, slot(21, "15:00")))
        .await
        .unwrap();

    let cancelled = h
        .engine
        .transition_session(
            session.session_id,
            TransitionAction::Cancel {
                reasons: vec!["Feeling unwell".to_string()],
                other_reason: None,
                purge: true,
            },
            booker,
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::RefundedToWallet);
    assert_eq!(
        h.engine.wallet_balances(booker).await.unwrap().legacy,
        Decimal::from(100)
    );

    // Purge removed the session document, but the audit entry survives.
    assert!(h.engine.session(session.session_id).await.unwrap().is_none());
    let records = h
        .engine
        .stores()
        .cancellations
        .list_for_session(session.session_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn payout_releases_exactly_once_with_rating_split() {
    let h = harness();
    let booker = h.seed_user(200).await;
    let expert_id = h.seed_expert(4.2).await;
    let server = PrincipalRef::Expert(expert_id);

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 200, slot(22, "10:00")))
        .await
        .unwrap();

    let confirmed = h
        .engine
        .transition_session(session.session_id, TransitionAction::Confirm, server)
        .await
        .unwrap();
    assert_eq!(confirmed.status, SessionStatus::Confirmed);
    assert!(confirmed.payout_processed);
    assert_eq!(confirmed.expert_payout_amount, Decimal::from(140));
    assert_eq!(confirmed.platform_fee_amount, Decimal::from(60));
    assert!(confirmed.meeting.is_some());

    let balances = h.engine.wallet_balances(server).await.unwrap();
    assert_eq!(balances.earning, Decimal::from(140));

    // A duplicate confirm is rejected and credits nothing.
    let err = h
        .engine
        .transition_session(session.session_id, TransitionAction::Confirm, server)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_TRANSITION");

    // Completion runs the payout fallback; the flag keeps it a no-op.
    h.engine
        .transition_session(
            session.session_id,
            TransitionAction::Complete { end_time: None },
            server,
        )
        .await
        .unwrap();
    let balances = h.engine.wallet_balances(server).await.unwrap();
    assert_eq!(balances.earning, Decimal::from(140));
    assert_eq!(balances.legacy, Decimal::from(140));
}

#[tokio::test]
async fn low_rated_expert_gets_half_the_fee() {
    let h = harness();
    let booker = h.seed_user(100).await;
    let expert_id = h.seed_expert(3.2).await;
    let server = PrincipalRef::Expert(expert_id);

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 100, slot(23, "10:00")))
        .await
        .unwrap();
    h.engine
        .transition_session(session.session_id, TransitionAction::Confirm, server)
        .await
        .unwrap();

    let balances = h.engine.wallet_balances(server).await.unwrap();
    assert_eq!(balances.earning, Decimal::from(50));
}

#[tokio::test]
async fn rating_submission_closes_the_loop_and_moves_the_average() {
    let h = harness();
    let booker = h.seed_user(100).await;
    let expert_id = h.seed_expert(0.0).await;
    let server = PrincipalRef::Expert(expert_id);

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 80, slot(24, "13:00")))
        .await
        .unwrap();
    h.engine
        .transition_session(session.session_id, TransitionAction::Confirm, server)
        .await
        .unwrap();
    h.engine
        .transition_session(
            session.session_id,
            TransitionAction::Complete { end_time: None },
            booker,
        )
        .await
        .unwrap();

    // Only the booker may rate, and only once the session completed.
    let err = h
        .engine
        .transition_session(
            session.session_id,
            TransitionAction::SubmitRating {
                rating: 5,
                comment: None,
            },
            server,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "FORBIDDEN");

    let rated = h
        .engine
        .transition_session(
            session.session_id,
            TransitionAction::SubmitRating {
                rating: 5,
                comment: Some("Excellent guidance".to_string()),
            },
            booker,
        )
        .await
        .unwrap();
    assert_eq!(rated.status, SessionStatus::RatingSubmitted);
    assert_eq!(rated.rating, Some(5));

    let expert = h
        .engine
        .stores()
        .principals
        .expert(expert_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(expert.average_rating, 5.0);
    assert_eq!(expert.number_of_ratings, 1);
}

#[tokio::test]
async fn expert_to_expert_booking_spends_from_the_spending_purse() {
    let h = harness();
    let consulting_expert = h.seed_expert(4.6).await;
    let booking_expert = h.seed_expert(2.0).await;
    let booker = PrincipalRef::Expert(booking_expert);
    h.fund(booker, WalletPurse::Spending, 120).await;

    // Self-booking is rejected outright.
    let err = h
        .engine
        .book_session(booking(booker, booking_expert, 50, slot(25, "10:00")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SELF_BOOKING_FORBIDDEN");

    let session = h
        .engine
        .book_session(booking(booker, consulting_expert, 100, slot(25, "11:00")))
        .await
        .unwrap();
    assert_eq!(session.kind, SessionKind::ExpertToExpert);

    let balances = h.engine.wallet_balances(booker).await.unwrap();
    assert_eq!(balances.spending, Decimal::from(20));
    // The deprecated single-purse view mirrors the purse totals.
    assert_eq!(balances.legacy, Decimal::from(20));

    // Declining refunds into the same purse the payment came from.
    h.engine
        .transition_session(
            session.session_id,
            TransitionAction::Decline,
            PrincipalRef::Expert(consulting_expert),
        )
        .await
        .unwrap();
    let balances = h.engine.wallet_balances(booker).await.unwrap();
    assert_eq!(balances.spending, Decimal::from(120));
}

#[tokio::test]
async fn earnings_flow_into_withdrawal() {
    let h = harness();
    let booker = h.seed_user(100).await;
    let expert_id = h.seed_expert(4.9).await;
    let server = PrincipalRef::Expert(expert_id);

    let session = h
        .engine
        .book_session(booking(booker, expert_id, 100, slot(26, "09:00")))
        .await
        .unwrap();
    h.engine
        .transition_session(session.session_id, TransitionAction::Confirm, server)
        .await
        .unwrap();
    assert_eq!(
        h.engine.wallet_balances(server).await.unwrap().earning,
        Decimal::from(70)
    );

    let withdrawal = h
        .engine
        .request_withdrawal(expert_id, Decimal::from(70))
        .await
        .unwrap();
    assert_eq!(
        h.engine.wallet_balances(server).await.unwrap().earning,
        Decimal::ZERO
    );

    let settled = h
        .engine
        .settle_withdrawal(withdrawal.transaction_id, true)
        .await
        .unwrap();
    assert_eq!(
        settled.status,
        consultlink_booking::TransactionStatus::Completed
    );
}
