use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::Slot;
use crate::store::SessionStore;

/// Answers whether a serving expert is free at an exact `(date, time)`
/// bucket. A party can be booked either as the user-facing expert or as the
/// consulting expert in an expert-to-expert session; both kinds are checked.
#[derive(Clone)]
pub struct AvailabilityService {
    sessions: Arc<dyn SessionStore>,
}

impl AvailabilityService {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    pub async fn is_available(
        &self,
        server_id: Uuid,
        date: NaiveDate,
        time: &str,
    ) -> Result<bool, EngineError> {
        self.is_slot_available(server_id, &Slot::new(date, time)).await
    }

    pub async fn is_slot_available(
        &self,
        server_id: Uuid,
        slot: &Slot,
    ) -> Result<bool, EngineError> {
        Ok(!self.sessions.slot_occupied(server_id, slot).await?)
    }
}
