use crate::messages::IngestPayload;
use crate::store::{validate_room_number, RoomId, SetOutcome, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do with a state message that omits `suction_on` or `motion`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbsentFieldPolicy {
    /// Treat the missing field as `false`
    #[default]
    DefaultFalse,
    /// Keep the stored value
    LeaveUntouched,
}

impl AbsentFieldPolicy {
    /// Value to write for a boolean field, `None` to leave it alone.
    pub fn resolve(self, field: Option<bool>) -> Option<bool> {
        match (field, self) {
            (Some(value), _) => Some(value),
            (None, AbsentFieldPolicy::DefaultFalse) => Some(false),
            (None, AbsentFieldPolicy::LeaveUntouched) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MalformedTopic,
    InvalidPayload(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MalformedTopic => write!(f, "malformed topic"),
            DropReason::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied {
        room: String,
        room_id: RoomId,
        /// `None` when the field was absent and left untouched
        suction: Option<SetOutcome>,
        /// `None` when `motion` was absent and left untouched
        occupancy_changed: Option<bool>,
    },
    Dropped(DropReason),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Room segment of `<prefix>/<room>/...`: the text between the first and the
/// second `/`, trimmed. Blank segments yield `None`.
pub fn room_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.splitn(3, '/');
    let _prefix = segments.next()?;
    let room = segments.next()?;
    segments.next()?;
    validate_room_number(room).ok()
}

/// Maps one state message onto store writes.
#[derive(Clone)]
pub struct TopicRouter {
    store: Arc<StateStore>,
    policy: AbsentFieldPolicy,
}

impl TopicRouter {
    pub fn new(store: Arc<StateStore>, policy: AbsentFieldPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn policy(&self) -> AbsentFieldPolicy {
        self.policy
    }

    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<RouteOutcome, RouteError> {
        let Some(room) = room_from_topic(topic) else {
            warn!("Dropping message on malformed topic '{}'", topic);
            return Ok(RouteOutcome::Dropped(DropReason::MalformedTopic));
        };

        let message = match IngestPayload::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping message on {}: {} ({})",
                    topic,
                    e,
                    String::from_utf8_lossy(payload)
                );
                return Ok(RouteOutcome::Dropped(DropReason::InvalidPayload(e.to_string())));
            }
        };

        let room_id = self.store.ensure_room(room).await?;

        let suction = match self.policy.resolve(message.suction_on) {
            Some(value) => Some(self.store.set_current(room_id, value).await?),
            None => {
                debug!("{}: suction_on absent, stored value left untouched", room);
                None
            }
        };

        let occupancy_changed = match self.policy.resolve(message.motion) {
            Some(motion) => Some(self.store.set_occupancy(room_id, motion).await?),
            None => {
                debug!("{}: motion absent, occupancy left untouched", room);
                None
            }
        };

        Ok(RouteOutcome::Applied {
            room: room.to_string(),
            room_id,
            suction,
            occupancy_changed,
        })
    }
}
