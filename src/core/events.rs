//! Unit status notifications
//!
//! Fire-and-forget: a sink must never fail or block the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::defaults;
use crate::core::unit::{BuildStatus, UnitId};

/// "unit X reached state Y"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitEvent {
    pub unit: UnitId,
    pub status: BuildStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl UnitEvent {
    pub fn new(unit: UnitId, status: BuildStatus, message: impl Into<String>) -> Self {
        Self {
            unit,
            status,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Receiver of unit events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: UnitEvent);
}

/// Logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: UnitEvent) {
        match event.status {
            BuildStatus::Failed => {
                tracing::warn!("{} -> {}: {}", event.unit, event.status, event.message);
            }
            _ => tracing::info!("{} -> {}: {}", event.unit, event.status, event.message),
        }
    }
}

/// Broadcasts events to live subscribers
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: broadcast::Sender<UnitEvent>,
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new(defaults::EVENT_CHANNEL_CAPACITY)
    }
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New live subscription; only events published after this call are seen
    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: UnitEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Discards events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: UnitEvent) {}
}
