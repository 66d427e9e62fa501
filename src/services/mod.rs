//! Domain services behind the map state façade.
//!
//! ARCHITECTURE
//! ============
//! Service modules own one concern each: dimension policy enforcement,
//! area bookkeeping, store round-trips, the realtime channel. The map
//! state service composes them and is the only module collaborators call.

pub mod areas;
pub mod coordinator;
pub mod map_state;
pub mod persistence;
pub mod realtime;
