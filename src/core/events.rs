//! Defense events published for external consumers.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::alert::{AdvancedDdosAlert, DdosAlert};
use crate::core::enforcement::BlockTarget;
use crate::core::rate_limiter::RateLimitViolation;

/// Kind of mitigation step a [`DefenseActionResult`] reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefenseAction {
    ApplyBlock,
    RemoveBlock,
    PersistBlockEvent,
}

/// Outcome of a detached mitigation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseActionResult {
    pub action: DefenseAction,
    pub target: Option<BlockTarget>,
    pub success: bool,
    /// Underlying error message when the action could not be completed
    pub message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl DefenseActionResult {
    pub fn succeeded(action: DefenseAction, target: Option<BlockTarget>) -> Self {
        Self {
            action,
            target,
            success: true,
            message: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        action: DefenseAction,
        target: Option<BlockTarget>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action,
            target,
            success: false,
            message: Some(message.into()),
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DefenseEvent {
    DdosAlert(DdosAlert),
    AdvancedAlert(AdvancedDdosAlert),
    RateLimitViolation(RateLimitViolation),
    ActionResult(DefenseActionResult),
    AnalysisError { stage: String, message: String },
}

/// Broadcast fan-out of defense events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DefenseEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DefenseEvent> {
        self.sender.subscribe()
    }

    /// Publishing without subscribers is fine; the event is dropped.
    pub fn publish(&self, event: DefenseEvent) {
        if self.sender.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(DefenseEvent::AnalysisError {
            stage: "signatures".to_string(),
            message: "bad pattern".to_string(),
        });
        match rx.recv().await.unwrap() {
            DefenseEvent::AnalysisError { stage, .. } => assert_eq!(stage, "signatures"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(DefenseEvent::ActionResult(DefenseActionResult::succeeded(
            DefenseAction::ApplyBlock,
            None,
        )));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = DefenseEvent::ActionResult(DefenseActionResult::failed(
            DefenseAction::PersistBlockEvent,
            None,
            "redis down",
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ActionResult");
        assert_eq!(json["payload"]["message"], "redis down");
    }
}
