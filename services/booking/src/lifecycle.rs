use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::BookingConfig;
use crate::error::EngineError;
use crate::meetings::MeetingProvider;
use crate::models::{
    CancellationPolicy, CancellationRecord, PaymentStatus, PrincipalRef, Session, SessionStatus,
    TransactionKind, TransitionAction, WalletPurse,
};
use crate::notifications::{NotificationTemplate, Notifier};
use crate::payout::PayoutCalculator;
use crate::store::{CancellationStore, PrincipalStore, SessionStore};
use crate::wallet::{booking_purse, WalletService};

const CAS_RETRIES: usize = 3;

/// Advisory cancellation-fee label: a fee may apply inside the notice
/// window. Sessions with an unparseable start time get the benefit of the
/// doubt.
pub fn cancellation_policy(
    starts_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    notice_hours: i64,
) -> CancellationPolicy {
    match starts_at {
        Some(start) if start - now < Duration::hours(notice_hours) => {
            CancellationPolicy::FeeMayApply
        }
        _ => CancellationPolicy::NoFee,
    }
}

/// Drives sessions through confirm / decline / cancel / complete /
/// submit-rating, with refunds on decline and cancel and an exactly-once
/// payout release guarded by the session's payout flag.
#[derive(Clone)]
pub struct LifecycleService {
    sessions: Arc<dyn SessionStore>,
    principals: Arc<dyn PrincipalStore>,
    cancellations: Arc<dyn CancellationStore>,
    wallet: WalletService,
    payout: PayoutCalculator,
    meetings: Arc<dyn MeetingProvider>,
    notifier: Arc<dyn Notifier>,
    config: BookingConfig,
}

impl LifecycleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        principals: Arc<dyn PrincipalStore>,
        cancellations: Arc<dyn CancellationStore>,
        wallet: WalletService,
        payout: PayoutCalculator,
        meetings: Arc<dyn MeetingProvider>,
        notifier: Arc<dyn Notifier>,
        config: BookingConfig,
    ) -> Self {
        Self {
            sessions,
            principals,
            cancellations,
            wallet,
            payout,
            meetings,
            notifier,
            config,
        }
    }

    pub async fn transition(
        &self,
        session_id: Uuid,
        action: TransitionAction,
        actor: PrincipalRef,
    ) -> Result<Session, EngineError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Session not found".to_string()))?;

        match action {
            TransitionAction::Confirm => self.confirm(session, actor).await,
            TransitionAction::Decline => self.decline(session, actor).await,
            TransitionAction::Cancel {
                reasons,
                other_reason,
                purge,
            } => self.cancel(session, actor, reasons, other_reason, purge).await,
            TransitionAction::Complete { end_time } => {
                self.complete(session, actor, end_time).await
            }
            TransitionAction::SubmitRating { rating, comment } => {
                self.submit_rating(session, actor, rating, comment).await
            }
        }
    }

    async fn confirm(
        &self,
        session: Session,
        actor: PrincipalRef,
    ) -> Result<Session, EngineError> {
        self.require_server(&session, actor, "confirm")?;

        let mut confirmed = self
            .update_session(session.session_id, |s| {
                if s.status != SessionStatus::Unconfirmed {
                    return Err(EngineError::InvalidTransition {
                        from: s.status,
                        action: "confirm",
                    });
                }
                s.status = SessionStatus::Confirmed;
                Ok(())
            })
            .await?;

        self.release_payout(&confirmed).await?;

        // Meeting provisioning is a delegated side effect; a provider outage
        // never rolls back the confirmation.
        match self.meetings.provision(session.session_id).await {
            Ok(meeting) => {
                confirmed = self
                    .update_session(session.session_id, |s| {
                        s.meeting = Some(meeting.clone());
                        Ok(())
                    })
                    .await?;
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "meeting provisioning failed"
                );
            }
        }

        self.notifier
            .send(
                confirmed.booker,
                NotificationTemplate::SessionConfirmed,
                serde_json::json!({ "session_id": confirmed.session_id }),
            )
            .await;

        self.sessions
            .get(session.session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Session not found".to_string()))
    }

    async fn decline(
        &self,
        session: Session,
        actor: PrincipalRef,
    ) -> Result<Session, EngineError> {
        self.require_server(&session, actor, "decline")?;

        let rejected = self
            .update_session(session.session_id, |s| {
                if s.status.is_terminal() {
                    return Err(EngineError::InvalidTransition {
                        from: s.status,
                        action: "decline",
                    });
                }
                s.status = SessionStatus::Rejected;
                Ok(())
            })
            .await?;

        let rejected = self.refund_booker(rejected, "declined").await?;

        self.notifier
            .send(
                rejected.booker,
                NotificationTemplate::SessionRejected,
                serde_json::json!({ "session_id": rejected.session_id }),
            )
            .await;

        Ok(rejected)
    }

    async fn cancel(
        &self,
        session: Session,
        actor: PrincipalRef,
        reasons: Vec<String>,
        other_reason: Option<String>,
        purge: bool,
    ) -> Result<Session, EngineError> {
        self.require_participant(&session, actor)?;
        if session.status.is_terminal() || session.status == SessionStatus::Completed {
            return Err(EngineError::InvalidTransition {
                from: session.status,
                action: "cancel",
            });
        }

        let now = Utc::now();
        let policy = cancellation_policy(
            session.starts_at(),
            now,
            self.config.cancellation_notice_hours,
        );

        // The audit record is written before the session is touched: the fee
        // decision must survive the cancellation, including the purge flow.
        let record = CancellationRecord {
            record_id: Uuid::new_v4(),
            session_id: session.session_id,
            session_kind: session.kind,
            cancelled_by: actor,
            reasons,
            other_reason,
            policy,
            cancelled_at: now,
        };
        self.cancellations.insert(record).await?;
        tracing::info!(
            session_id = %session.session_id,
            cancelled_by = %actor.id(),
            policy = policy.label(),
            "cancellation recorded"
        );

        let cancelled = self
            .update_session(session.session_id, |s| {
                if s.status.is_terminal() || s.status == SessionStatus::Completed {
                    return Err(EngineError::InvalidTransition {
                        from: s.status,
                        action: "cancel",
                    });
                }
                s.status = SessionStatus::Cancelled;
                Ok(())
            })
            .await?;

        let cancelled = self.refund_booker(cancelled, "cancelled").await?;

        if purge {
            self.sessions.delete(session.session_id).await?;
        }

        let counterparty = if actor == cancelled.booker {
            PrincipalRef::Expert(cancelled.server_id)
        } else {
            cancelled.booker
        };
        self.notifier
            .send(
                counterparty,
                NotificationTemplate::SessionCancelled,
                serde_json::json!({
                    "session_id": cancelled.session_id,
                    "policy": policy.label(),
                }),
            )
            .await;

        Ok(cancelled)
    }

    async fn complete(
        &self,
        session: Session,
        actor: PrincipalRef,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Session, EngineError> {
        self.require_participant(&session, actor)?;

        let completed = self
            .update_session(session.session_id, |s| {
                if s.status != SessionStatus::Confirmed {
                    return Err(EngineError::InvalidTransition {
                        from: s.status,
                        action: "complete",
                    });
                }
                let now = Utc::now();
                s.status = SessionStatus::Completed;
                s.end_time = Some(end_time.unwrap_or(now));
                s.completed_at = Some(now);
                Ok(())
            })
            .await?;

        // Fallback for sessions whose confirm never credited the payout; the
        // payout flag keeps this at most once.
        self.release_payout(&completed).await?;

        self.sessions
            .get(session.session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Session not found".to_string()))
    }

    async fn submit_rating(
        &self,
        session: Session,
        actor: PrincipalRef,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Session, EngineError> {
        if actor != session.booker {
            return Err(EngineError::Forbidden(
                "Only the booker can rate this session".to_string(),
            ));
        }
        if !(1..=5).contains(&rating) {
            return Err(EngineError::Validation(
                "Invalid rating. Must be between 1 and 5".to_string(),
            ));
        }

        let rated = self
            .update_session(session.session_id, |s| {
                if s.status != SessionStatus::Completed {
                    return Err(EngineError::InvalidTransition {
                        from: s.status,
                        action: "submit_rating",
                    });
                }
                s.status = SessionStatus::RatingSubmitted;
                s.rating = Some(rating);
                Ok(())
            })
            .await?;

        let new_average = self
            .principals
            .apply_rating(session.server_id, rating)
            .await?;
        tracing::info!(
            session_id = %session.session_id,
            expert_id = %session.server_id,
            rating,
            new_average,
            comment = comment.as_deref().unwrap_or(""),
            "rating submitted"
        );

        Ok(rated)
    }

    /// Releases the expert's share exactly once per session. The payout flag
    /// is flipped with an atomic check-and-set; the loser of a duplicate
    /// confirm/complete race sees the flag already taken and credits nothing.
    async fn release_payout(&self, session: &Session) -> Result<(), EngineError> {
        if session.price <= Decimal::ZERO {
            return Ok(());
        }
        if !self.sessions.try_begin_payout(session.session_id).await? {
            tracing::debug!(
                session_id = %session.session_id,
                "payout already processed"
            );
            return Ok(());
        }

        let expert = match self.principals.expert(session.server_id).await? {
            Some(expert) => expert,
            None => {
                self.sessions.reset_payout(session.session_id).await?;
                return Err(EngineError::Internal(format!(
                    "Serving expert {} not found for payout",
                    session.server_id
                )));
            }
        };

        let split = self
            .payout
            .compute_share(session.price, expert.average_rating);
        if let Err(err) = self
            .wallet
            .credit(
                PrincipalRef::Expert(session.server_id),
                WalletPurse::Earning,
                split.expert_share,
                TransactionKind::Deposit,
                "Session earnings (confirmed)",
                Some(serde_json::json!({ "session_id": session.session_id })),
            )
            .await
        {
            self.sessions.reset_payout(session.session_id).await?;
            return Err(err);
        }

        self.update_session(session.session_id, |s| {
            s.expert_payout_amount = split.expert_share;
            s.platform_fee_amount = split.platform_fee;
            Ok(())
        })
        .await?;

        tracing::info!(
            session_id = %session.session_id,
            expert_id = %session.server_id,
            expert_share = %split.expert_share,
            platform_fee = %split.platform_fee,
            "payout released"
        );
        Ok(())
    }

    /// Refund rule shared by decline and cancel: the wallet-paid portion
    /// goes back to the booker; gift-card value is never refunded. A missing
    /// booker is recorded but never blocks the transition.
    async fn refund_booker(
        &self,
        session: Session,
        cause: &'static str,
    ) -> Result<Session, EngineError> {
        let new_payment_status = if session.payment_status == PaymentStatus::Completed
            && session.payment_amount > Decimal::ZERO
        {
            let refund = self
                .wallet
                .credit(
                    session.booker,
                    booking_purse(session.booker),
                    session.payment_amount,
                    TransactionKind::Refund,
                    &format!("Refund for {cause} session"),
                    Some(serde_json::json!({ "session_id": session.session_id })),
                )
                .await;
            match refund {
                Ok(_) => {
                    tracing::info!(
                        session_id = %session.session_id,
                        booker = %session.booker.id(),
                        amount = %session.payment_amount,
                        cause,
                        "booking payment refunded to wallet"
                    );
                    Some(PaymentStatus::RefundedToWallet)
                }
                Err(EngineError::NotFound(_)) => {
                    tracing::error!(
                        session_id = %session.session_id,
                        booker = %session.booker.id(),
                        "booker not found for wallet refund"
                    );
                    Some(PaymentStatus::RefundFailedBookerNotFound)
                }
                Err(err) => return Err(err),
            }
        } else if session.payment_status == PaymentStatus::Completed
            && session.gift_card_amount_redeemed > Decimal::ZERO
            && session.payment_amount == Decimal::ZERO
        {
            // Paid fully by gift card: no refund, the value is forfeited.
            Some(PaymentStatus::DeclinedGiftCardPayment)
        } else {
            None
        };

        match new_payment_status {
            Some(status) => {
                self.update_session(session.session_id, |s| {
                    s.payment_status = status;
                    Ok(())
                })
                .await
            }
            None => Ok(session),
        }
    }

    fn require_server(
        &self,
        session: &Session,
        actor: PrincipalRef,
        action: &str,
    ) -> Result<(), EngineError> {
        match actor {
            PrincipalRef::Expert(id) if id == session.server_id => Ok(()),
            _ => Err(EngineError::Forbidden(format!(
                "Only the serving expert can {action} this session"
            ))),
        }
    }

    fn require_participant(
        &self,
        session: &Session,
        actor: PrincipalRef,
    ) -> Result<(), EngineError> {
        let is_server = matches!(actor, PrincipalRef::Expert(id) if id == session.server_id);
        if actor == session.booker || is_server {
            Ok(())
        } else {
            Err(EngineError::Forbidden(
                "You are not a participant in this session".to_string(),
            ))
        }
    }

    /// Optimistic read-modify-write: re-reads the session and retries on a
    /// version conflict, so concurrent transitions race on the version field
    /// instead of overwriting each other.
    async fn update_session<F>(&self, id: Uuid, mut apply: F) -> Result<Session, EngineError>
    where
        F: FnMut(&mut Session) -> Result<(), EngineError>,
    {
        for _ in 0..CAS_RETRIES {
            let mut session = self
                .sessions
                .get(id)
                .await?
                .ok_or_else(|| EngineError::NotFound("Session not found".to_string()))?;
            apply(&mut session)?;
            match self.sessions.put_versioned(session).await {
                Ok(updated) => return Ok(updated),
                Err(EngineError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EngineError::Conflict(format!(
            "Session {id} kept changing concurrently"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn inside_notice_window_flags_a_fee() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let start = now + Duration::hours(5);
        assert_eq!(
            cancellation_policy(Some(start), now, 24),
            CancellationPolicy::FeeMayApply
        );
    }

    #[test]
    fn outside_notice_window_is_free() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let start = now + Duration::hours(48);
        assert_eq!(
            cancellation_policy(Some(start), now, 24),
            CancellationPolicy::NoFee
        );
    }

    #[test]
    fn unknown_start_time_is_free() {
        let now = Utc::now();
        assert_eq!(cancellation_policy(None, now, 24), CancellationPolicy::NoFee);
    }
}
