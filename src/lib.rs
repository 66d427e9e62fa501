//! Client-side synchronization core for shared 2D room maps.
//!
//! One room's map — dimensions, interactive and impassable areas, placed
//! assets, layers — lives in a single [`snapshot::MapSnapshot`] owned by
//! the [`services::map_state::MapStateService`]. Local edits are validated,
//! journaled in a bounded [`ledger::ChangeLedger`], debounce-saved to the
//! backing store, and broadcast to the room over the realtime channel;
//! remote updates replace local state last-writer-wins.

pub mod config;
pub mod dimensions;
pub mod events;
pub mod ledger;
pub mod services;
pub mod snapshot;
pub mod wire;
