use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::Meeting;

/// Opaque video-conferencing capability. The engine only needs a meeting
/// number and join links once a session is confirmed.
#[async_trait]
pub trait MeetingProvider: Send + Sync {
    async fn provision(&self, session_id: Uuid) -> Result<Meeting, EngineError>;
}

/// Stand-in provider generating local meeting coordinates.
pub struct StubMeetingProvider;

impl StubMeetingProvider {
    fn meeting_number() -> String {
        let mut rng = rand::thread_rng();
        rng.gen_range(1_000_000_000u64..10_000_000_000u64).to_string()
    }

    fn passcode() -> String {
        let chars = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| chars[rng.gen_range(0..chars.len())] as char)
            .collect()
    }
}

#[async_trait]
impl MeetingProvider for StubMeetingProvider {
    async fn provision(&self, session_id: Uuid) -> Result<Meeting, EngineError> {
        let meeting_number = Self::meeting_number();
        Ok(Meeting {
            host_link: format!(
                "/expertpanel/sessioncall?meetingId={meeting_number}&sessionId={session_id}"
            ),
            guest_link: format!(
                "/userpanel/sessioncall?meetingId={meeting_number}&sessionId={session_id}"
            ),
            passcode: Self::passcode(),
            meeting_number,
        })
    }
}
