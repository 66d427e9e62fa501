//! Event bus — in-process, typed publish/subscribe for map state changes.
//!
//! DESIGN
//! ======
//! Collaborators (renderer, editor UI) react to state changes without
//! polling by subscribing here. Events are a closed set of tagged variants
//! with typed payloads; there is no stringly-typed topic space. Built on
//! `tokio::sync::broadcast`: emission never blocks the service, and a
//! lagging subscriber misses events rather than stalling everyone else.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ledger::ChangeSubject;
use crate::services::coordinator::DimensionCache;
use crate::snapshot::MapSnapshot;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Where a change originated. Remote changes never re-save or re-broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// Everything the map state service announces to local collaborators.
#[derive(Debug, Clone)]
pub enum MapEvent {
    /// Initialization finished (loaded or fell back to default).
    Loaded { snapshot: MapSnapshot },
    /// The snapshot changed; payload is a full copy.
    Changed { snapshot: MapSnapshot, source: ChangeSource },
    ElementAdded { subject: ChangeSubject, id: Uuid },
    ElementRemoved { subject: ChangeSubject, id: Uuid },
    DimensionsChanged { cache: DimensionCache },
    Saved { version: i64 },
    SaveError { message: String },
}

/// Typed fan-out handle. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MapEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.tx.subscribe()
    }

    /// Best-effort emission; dropped silently when nobody is listening.
    pub fn emit(&self, event: MapEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
