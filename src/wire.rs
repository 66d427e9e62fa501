//! Wire protocol — room-scoped events exchanged over the realtime channel.
//!
//! DESIGN
//! ======
//! Every message is one `WireEvent`, JSON-encoded as
//! `{"event": "...", "data": {...}}`. Outbound traffic is `join-room`,
//! `leave-room`, and `map-update`; inbound traffic is `map-updated` and
//! `asset-added`. Each event carries the room it belongs to, and the
//! channel discards inbound events for rooms other than the one it has
//! joined.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::{MapSnapshot, PlacedAsset};

/// The universal channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WireEvent {
    JoinRoom { room_id: Uuid },
    LeaveRoom { room_id: Uuid },
    /// Outbound: a locally saved snapshot for the room's other clients.
    MapUpdate { room_id: Uuid, snapshot: MapSnapshot },
    /// Inbound: another client's saved snapshot.
    MapUpdated { room_id: Uuid, snapshot: MapSnapshot },
    /// Inbound: a single asset placed by another client.
    AssetAdded { room_id: Uuid, asset: PlacedAsset },
}

impl WireEvent {
    #[must_use]
    pub fn room_id(&self) -> Uuid {
        match self {
            WireEvent::JoinRoom { room_id }
            | WireEvent::LeaveRoom { room_id }
            | WireEvent::MapUpdate { room_id, .. }
            | WireEvent::MapUpdated { room_id, .. }
            | WireEvent::AssetAdded { room_id, .. } => *room_id,
        }
    }

    /// Encode for transmission.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a received message.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error on malformed or unknown payloads.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_helpers;

    #[test]
    fn join_room_encodes_kebab_case_event() {
        let room_id = Uuid::new_v4();
        let text = WireEvent::JoinRoom { room_id }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "join-room");
        assert_eq!(value["data"]["roomId"], room_id.to_string());
    }

    #[test]
    fn map_update_round_trip() {
        let room_id = Uuid::new_v4();
        let original =
            WireEvent::MapUpdate { room_id, snapshot: test_helpers::populated_snapshot() };
        let text = original.encode().unwrap();
        let restored = WireEvent::decode(&text).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.room_id(), room_id);
    }

    #[test]
    fn asset_added_round_trip() {
        let room_id = Uuid::new_v4();
        let original =
            WireEvent::AssetAdded { room_id, asset: test_helpers::placed_asset("a.png") };
        let text = original.encode().unwrap();
        assert_eq!(WireEvent::decode(&text).unwrap(), original);
    }

    #[test]
    fn decode_rejects_unknown_event() {
        let err = WireEvent::decode(r#"{"event":"not-a-thing","data":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(WireEvent::decode("{nope").is_err());
    }
}
