use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{EngineError, GiftCardRejection};
use crate::gateways::PaymentGateway;
use crate::models::{GiftCard, GiftCardPurchaseRequest, GiftCardStatus, Redemption};
use crate::notifications::{NotificationTemplate, Notifier};
use crate::store::{rejection_for, GiftCardStore};

/// One-time-use stored-value instrument. A card is purchased pending
/// payment, activated by gateway confirmation, and consumed whole on its
/// first redemption; any value above the session price is forfeited.
#[derive(Clone)]
pub struct GiftCardService {
    cards: Arc<dyn GiftCardStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    currency: String,
}

impl GiftCardService {
    pub fn new(
        cards: Arc<dyn GiftCardStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        currency: String,
    ) -> Self {
        Self {
            cards,
            gateway,
            notifier,
            currency,
        }
    }

    fn generate_code() -> String {
        let chars = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..8)
            .map(|_| chars[rng.gen_range(0..chars.len())] as char)
            .collect();
        format!("GC-{suffix}")
    }

    async fn unique_code(&self) -> Result<String, EngineError> {
        loop {
            let code = Self::generate_code();
            if !self.cards.code_exists(&code).await? {
                return Ok(code);
            }
        }
    }

    pub async fn purchase(
        &self,
        request: GiftCardPurchaseRequest,
    ) -> Result<GiftCard, EngineError> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "Gift card amount must be a positive number".to_string(),
            ));
        }
        if !request.recipient_email.contains('@') {
            return Err(EngineError::Validation(
                "Invalid recipient email format".to_string(),
            ));
        }

        let gift_card_id = Uuid::new_v4();
        let redemption_code = self.unique_code().await?;

        // Charge before persisting: a gateway rejection leaves no
        // half-created card behind.
        let mut metadata = HashMap::new();
        metadata.insert("gift_card_id".to_string(), gift_card_id.to_string());
        metadata.insert("type".to_string(), "gift_card_purchase".to_string());
        let charge = self
            .gateway
            .charge(crate::gateways::ChargeRequest {
                amount: request.amount,
                currency: self.currency.clone(),
                description: format!("Gift card purchase for {}", request.recipient_email),
                metadata,
            })
            .await?;

        let now = Utc::now();
        let card = GiftCard {
            gift_card_id,
            original_amount: request.amount,
            balance: request.amount,
            redemption_code,
            status: if request.send_anonymously {
                GiftCardStatus::AnonymousPendingPayment
            } else {
                GiftCardStatus::PendingPayment
            },
            purchaser: request.purchaser,
            purchaser_email: request.purchaser_email,
            recipient_email: request.recipient_email,
            recipient_message: request.recipient_message,
            send_anonymously: request.send_anonymously,
            payment_ref: Some(charge.charge_id.clone()),
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.cards.insert(card.clone()).await?;
        tracing::info!(
            gift_card_id = %card.gift_card_id,
            charge_id = %charge.charge_id,
            amount = %card.original_amount,
            "gift card purchase initiated"
        );
        Ok(card)
    }

    /// Applies a gateway payment result to a pending card. Safe to call from
    /// both the webhook and the client poll: an already active (or already
    /// redeemed) card is left untouched.
    pub async fn confirm_payment(&self, payment_ref: &str) -> Result<GiftCard, EngineError> {
        let card = self
            .cards
            .find_by_payment_ref(payment_ref)
            .await?
            .ok_or_else(|| EngineError::NotFound("Gift card not found".to_string()))?;

        if card.status.is_redeemable() {
            tracing::debug!(gift_card_id = %card.gift_card_id, "payment already processed");
            return Ok(card);
        }
        if !card.status.is_pending_payment() {
            return Ok(card);
        }

        let charge = self.gateway.get_status(payment_ref).await?;
        if charge.is_successful() {
            let card = self.cards.activate(card.gift_card_id, payment_ref).await?;
            tracing::info!(
                gift_card_id = %card.gift_card_id,
                code = %card.redemption_code,
                "gift card activated"
            );
            if let Some(purchaser) = card.purchaser {
                self.notifier
                    .send(
                        purchaser,
                        NotificationTemplate::GiftCardPurchased,
                        serde_json::json!({
                            "gift_card_id": card.gift_card_id,
                            "recipient_email": card.recipient_email,
                            "amount": card.original_amount,
                        }),
                    )
                    .await;
            }
            Ok(card)
        } else if charge.is_failed() {
            tracing::warn!(
                gift_card_id = %card.gift_card_id,
                result_code = %charge.result_code,
                "gift card payment failed"
            );
            self.cards.mark_payment_failed(card.gift_card_id).await
        } else {
            Ok(card)
        }
    }

    /// Fetches a redeemable card without consuming it, failing with the
    /// status-specific rejection otherwise.
    pub async fn preview(&self, code: &str) -> Result<GiftCard, EngineError> {
        let card = self
            .cards
            .find_by_code(code)
            .await?
            .ok_or(EngineError::GiftCardInvalid {
                reason: GiftCardRejection::NotFound,
            })?;
        if card.expires_at.map_or(false, |t| t <= Utc::now()) {
            return Err(EngineError::GiftCardInvalid {
                reason: GiftCardRejection::Expired,
            });
        }
        if !card.status.is_redeemable() {
            return Err(EngineError::GiftCardInvalid {
                reason: rejection_for(card.status),
            });
        }
        Ok(card)
    }

    /// One-time redemption against a session price. The discount is
    /// `min(session_price, original_amount)` and the card is removed in the
    /// same atomic step; there is no partial-balance retention.
    pub async fn redeem(
        &self,
        code: &str,
        session_price: Decimal,
    ) -> Result<Redemption, EngineError> {
        if session_price < Decimal::ZERO {
            return Err(EngineError::Validation(
                "Session price must be a non-negative number".to_string(),
            ));
        }
        let card = self.cards.take_active_by_code(code).await?;
        let redeemed_amount = session_price.min(card.original_amount);
        tracing::info!(
            gift_card_id = %card.gift_card_id,
            code = %card.redemption_code,
            %redeemed_amount,
            forfeited = %(card.original_amount - redeemed_amount),
            "gift card redeemed"
        );
        Ok(Redemption {
            gift_card_id: card.gift_card_id,
            redeemed_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::SandboxGateway;
    use crate::notifications::LoggingNotifier;
    use crate::store::MemoryStore;

    fn service_with_gateway() -> (GiftCardService, Arc<SandboxGateway>) {
        let gateway = Arc::new(SandboxGateway::new());
        let service = GiftCardService::new(
            Arc::new(MemoryStore::new()),
            gateway.clone(),
            Arc::new(LoggingNotifier),
            "SAR".to_string(),
        );
        (service, gateway)
    }

    fn purchase_request(amount: Decimal) -> GiftCardPurchaseRequest {
        GiftCardPurchaseRequest {
            amount,
            purchaser: None,
            purchaser_email: "buyer@example.com".to_string(),
            recipient_email: "friend@example.com".to_string(),
            recipient_message: None,
            send_anonymously: false,
        }
    }

    #[tokio::test]
    async fn purchase_then_confirm_activates_once() {
        let (service, gateway) = service_with_gateway();
        let card = service
            .purchase(purchase_request(Decimal::from(40)))
            .await
            .unwrap();
        assert_eq!(card.status, GiftCardStatus::PendingPayment);

        let charge_id = card.payment_ref.clone().unwrap();
        gateway.settle(&charge_id, "CAPTURED");

        let card = service.confirm_payment(&charge_id).await.unwrap();
        assert_eq!(card.status, GiftCardStatus::Active);

        // Duplicate webhook delivery is a no-op.
        let card = service.confirm_payment(&charge_id).await.unwrap();
        assert_eq!(card.status, GiftCardStatus::Active);
    }

    #[tokio::test]
    async fn failed_payment_marks_card() {
        let (service, gateway) = service_with_gateway();
        let card = service
            .purchase(purchase_request(Decimal::from(25)))
            .await
            .unwrap();
        let charge_id = card.payment_ref.clone().unwrap();
        gateway.settle(&charge_id, "DECLINED");

        let card = service.confirm_payment(&charge_id).await.unwrap();
        assert_eq!(card.status, GiftCardStatus::PaymentFailed);

        let err = service.redeem(&card.redemption_code, Decimal::from(10)).await;
        assert_eq!(err.unwrap_err().kind(), "GIFT_CARD_INVALID");
    }

    #[tokio::test]
    async fn redemption_is_single_use_and_capped_at_price() {
        let (service, gateway) = service_with_gateway();
        let card = service
            .purchase(purchase_request(Decimal::from(40)))
            .await
            .unwrap();
        let charge_id = card.payment_ref.clone().unwrap();
        gateway.settle(&charge_id, "000.000.000");
        service.confirm_payment(&charge_id).await.unwrap();

        let redemption = service
            .redeem(&card.redemption_code, Decimal::from(25))
            .await
            .unwrap();
        assert_eq!(redemption.redeemed_amount, Decimal::from(25));

        // The remainder is forfeited; a second attempt finds no card.
        let err = service
            .redeem(&card.redemption_code, Decimal::from(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "GIFT_CARD_INVALID");
    }
}
