use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::availability::AvailabilityService;
use crate::config::BookingConfig;
use crate::error::EngineError;
use crate::giftcard::GiftCardService;
use crate::models::{
    BookingRequest, PaymentMethod, PaymentStatus, PrincipalRef, Session, SessionKind,
    SessionStatus,
};
use crate::notifications::{NotificationTemplate, Notifier};
use crate::payout::PayoutCalculator;
use crate::store::{PrincipalStore, SessionStore};
use crate::wallet::{booking_purse, WalletService};

/// Validates a booking request, settles the money side (free-session
/// eligibility, gift card discount, wallet debit) and creates the session in
/// `unconfirmed` state awaiting the serving expert.
#[derive(Clone)]
pub struct BookingService {
    principals: Arc<dyn PrincipalStore>,
    sessions: Arc<dyn SessionStore>,
    availability: AvailabilityService,
    wallet: WalletService,
    gift_cards: GiftCardService,
    payout: PayoutCalculator,
    notifier: Arc<dyn Notifier>,
    config: BookingConfig,
}

impl BookingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        sessions: Arc<dyn SessionStore>,
        availability: AvailabilityService,
        wallet: WalletService,
        gift_cards: GiftCardService,
        payout: PayoutCalculator,
        notifier: Arc<dyn Notifier>,
        config: BookingConfig,
    ) -> Self {
        Self {
            principals,
            sessions,
            availability,
            wallet,
            gift_cards,
            payout,
            notifier,
            config,
        }
    }

    pub async fn book_session(&self, request: BookingRequest) -> Result<Session, EngineError> {
        self.validate_request(&request)?;

        let server = self
            .principals
            .expert(request.server_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Expert not found".to_string()))?;
        self.ensure_booker_exists(request.booker).await?;

        for slot in &request.slots {
            if !self
                .availability
                .is_slot_available(request.server_id, slot)
                .await?
            {
                return Err(EngineError::SlotUnavailable);
            }
        }

        // Free-session eligibility: the expert opted in and this booker has
        // never had a non-cancelled session of either kind with them.
        let free_session = server.free_session_enabled
            && !self
                .sessions
                .has_prior_with_server(request.booker.id(), request.server_id)
                .await?;
        let price = if free_session {
            Decimal::ZERO
        } else {
            request.price
        };

        let session_id = Uuid::new_v4();
        let purse = booking_purse(request.booker);

        let mut gift_card_redeemed_id = None;
        let mut gift_card_amount_redeemed = Decimal::ZERO;
        let mut amount_due = price;

        if price > Decimal::ZERO {
            if let Some(code) = request.redemption_code.as_deref() {
                // Pre-check the wallet against the post-discount remainder so
                // an insufficient balance aborts before the one-time card is
                // consumed.
                let card = self.gift_cards.preview(code).await?;
                let projected_due =
                    (price - price.min(card.original_amount)).max(Decimal::ZERO);
                if projected_due > Decimal::ZERO {
                    let available = self.wallet.purse_balance(request.booker, purse).await?;
                    if available < projected_due {
                        return Err(EngineError::InsufficientFunds {
                            required: projected_due,
                            available,
                        });
                    }
                }

                let redemption = self.gift_cards.redeem(code, price).await?;
                gift_card_redeemed_id = Some(redemption.gift_card_id);
                gift_card_amount_redeemed = redemption.redeemed_amount;
                amount_due = (price - redemption.redeemed_amount).max(Decimal::ZERO);
                tracing::info!(
                    %session_id,
                    code,
                    redeemed = %redemption.redeemed_amount,
                    due = %amount_due,
                    "gift card applied to booking"
                );
            }
        }

        let payment_amount = if amount_due > Decimal::ZERO {
            self.wallet
                .debit(
                    request.booker,
                    purse,
                    amount_due,
                    "Session booking payment",
                    Some(serde_json::json!({ "session_id": session_id })),
                )
                .await?;
            amount_due
        } else {
            Decimal::ZERO
        };

        let (payment_method, payment_status) = if price == Decimal::ZERO {
            (PaymentMethod::Free, PaymentStatus::NotApplicable)
        } else if gift_card_amount_redeemed > Decimal::ZERO && payment_amount > Decimal::ZERO {
            (PaymentMethod::GiftCardPlusWallet, PaymentStatus::Completed)
        } else if gift_card_amount_redeemed > Decimal::ZERO {
            (PaymentMethod::GiftCard, PaymentStatus::Completed)
        } else {
            (PaymentMethod::Wallet, PaymentStatus::Completed)
        };

        // Tentative split from the server's current rating; stored but not
        // applied until the lifecycle machine releases the payout.
        let split = self.payout.compute_share(price, server.average_rating);

        let now = Utc::now();
        let session = Session {
            session_id,
            kind: request.kind,
            booker: request.booker,
            server_id: request.server_id,
            area_of_expertise: request.area_of_expertise,
            slots: request.slots,
            duration: request.duration,
            note: request.note,
            status: SessionStatus::Unconfirmed,
            price,
            payment_method,
            payment_status,
            payment_amount,
            gift_card_redeemed_id,
            gift_card_amount_redeemed,
            expert_payout_amount: split.expert_share,
            platform_fee_amount: split.platform_fee,
            payout_processed: false,
            rating: None,
            meeting: None,
            end_time: None,
            completed_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(session.clone()).await?;

        tracing::info!(
            %session_id,
            booker = %request.booker.id(),
            server = %request.server_id,
            %price,
            %payment_amount,
            ?payment_method,
            "session booked"
        );

        self.notifier
            .send(
                request.booker,
                NotificationTemplate::BookingCreated,
                serde_json::json!({
                    "session_id": session_id,
                    "payment_amount": payment_amount,
                    "currency": self.config.currency,
                }),
            )
            .await;
        self.notifier
            .send(
                PrincipalRef::Expert(request.server_id),
                NotificationTemplate::SessionRequest,
                serde_json::json!({ "session_id": session_id }),
            )
            .await;

        Ok(session)
    }

    fn validate_request(&self, request: &BookingRequest) -> Result<(), EngineError> {
        match (request.kind, request.booker) {
            (SessionKind::UserToExpert, PrincipalRef::User(_)) => {}
            (SessionKind::ExpertToExpert, PrincipalRef::Expert(id)) => {
                if id == request.server_id {
                    return Err(EngineError::SelfBookingForbidden);
                }
            }
            _ => {
                return Err(EngineError::Validation(
                    "Booker role does not match the session kind".to_string(),
                ))
            }
        }
        if request.price < Decimal::ZERO {
            return Err(EngineError::InvalidPrice(
                "Price must be a non-negative number".to_string(),
            ));
        }
        if request.slots.is_empty() {
            return Err(EngineError::Validation(
                "At least one slot is required".to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_booker_exists(&self, booker: PrincipalRef) -> Result<(), EngineError> {
        let exists = match booker {
            PrincipalRef::User(id) => self.principals.user(id).await?.is_some(),
            PrincipalRef::Expert(id) => self.principals.expert(id).await?.is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(EngineError::NotFound("Booking principal not found".to_string()))
        }
    }
}
