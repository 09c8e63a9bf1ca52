use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::PrincipalRef;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    BookingCreated,
    SessionRequest,
    SessionConfirmed,
    SessionRejected,
    SessionCancelled,
    GiftCardPurchased,
    GiftCardReceived,
    WithdrawalSettled,
}

/// Fire-and-forget delivery seam. Implementations must never surface a
/// failure into the calling transition; delivery problems are their own to
/// log and retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: PrincipalRef,
        template: NotificationTemplate,
        data: serde_json::Value,
    );
}

/// Default notifier: records the notification in the trace log.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(
        &self,
        recipient: PrincipalRef,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) {
        tracing::info!(
            recipient = %recipient.id(),
            template = ?template,
            %data,
            "notification dispatched"
        );
    }
}
