//! Realtime channel — room-scoped websocket client for live map sync.
//!
//! DESIGN
//! ======
//! A background task owns the socket and runs a `select!` loop over caller
//! commands and inbound traffic. Callers talk to it through a bounded
//! command queue; `broadcast` uses `try_send` so the save path never blocks
//! on the channel, and a full queue drops the event with a warning.
//!
//! The task is only ever joined to one room. Joining a new room leaves the
//! old one first, and inbound events are routed through `route_inbound`,
//! which discards anything tagged with a different room — cross-room
//! leakage is a correctness bug, not an optimization concern.
//!
//! ERROR HANDLING
//! ==============
//! Connection loss triggers bounded, jittered reconnect attempts, and the
//! current room is re-joined after a successful reconnect. Channel failures
//! never block local edits; the next successful save's broadcast
//! resynchronizes remote viewers.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::snapshot::{MapSnapshot, PlacedAsset};
use crate::wire::WireEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel task is not running")]
    Closed,
    #[error("broadcast queue full; event dropped")]
    QueueFull,
}

/// Connection lifecycle. Connected-but-not-joined still reads as
/// `Connecting`; `Joined` is the only state where traffic flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Joined,
}

/// Remote change forwarded to the map state service's apply path.
#[derive(Debug, Clone)]
pub enum RemoteUpdate {
    Snapshot(MapSnapshot),
    Asset(PlacedAsset),
}

#[derive(Debug)]
enum Command {
    Join(Uuid),
    Leave,
    Broadcast(WireEvent),
    Shutdown,
}

// =============================================================================
// CHANNEL HANDLE
// =============================================================================

/// Caller-side handle. Cheap to clone; all clones drive the same task.
#[derive(Clone)]
pub struct RealtimeChannel {
    cmd_tx: mpsc::Sender<Command>,
    phase: Arc<Mutex<ChannelPhase>>,
}

impl RealtimeChannel {
    /// Spawn the channel task. Returns the handle, the stream of remote
    /// updates for the joined room, and the task handle for shutdown.
    #[must_use]
    pub fn connect(
        ws_url: &str,
        config: &SyncConfig,
    ) -> (Self, mpsc::Receiver<RemoteUpdate>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_queue);
        let (updates_tx, updates_rx) = mpsc::channel(config.channel_queue);
        let phase = Arc::new(Mutex::new(ChannelPhase::Disconnected));

        let task = tokio::spawn(run_channel(
            ws_url.to_owned(),
            *config,
            cmd_rx,
            updates_tx,
            Arc::clone(&phase),
        ));

        (Self { cmd_tx, phase }, updates_rx, task)
    }

    #[must_use]
    pub fn phase(&self) -> ChannelPhase {
        *self.phase.lock().expect("channel phase poisoned")
    }

    /// Join a room, leaving the current one first if different.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the channel task has exited.
    pub async fn join(&self, room_id: Uuid) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Join(room_id))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Leave the current room, if any.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the channel task has exited.
    pub async fn leave(&self) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Leave)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Fire-and-forget broadcast of a saved snapshot to the joined room.
    /// Never waits for acknowledgement and never blocks the save path.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` or `Closed`; both are non-fatal to the caller.
    pub fn broadcast_map(&self, room_id: Uuid, snapshot: MapSnapshot) -> Result<(), ChannelError> {
        match self
            .cmd_tx
            .try_send(Command::Broadcast(WireEvent::MapUpdate { room_id, snapshot }))
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%room_id, "broadcast queue full; dropping map update");
                Err(ChannelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Stop the channel task, leaving the room first.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// =============================================================================
// INBOUND ROUTING
// =============================================================================

/// Decode one inbound message and decide whether it applies to the joined
/// room. Events for other rooms are discarded.
#[must_use]
pub fn route_inbound(text: &str, joined: Option<Uuid>) -> Option<RemoteUpdate> {
    let event = match WireEvent::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "discarding undecodable channel message");
            return None;
        }
    };

    let room_id = event.room_id();
    if joined != Some(room_id) {
        debug!(%room_id, "discarding event for non-joined room");
        return None;
    }

    match event {
        WireEvent::MapUpdated { snapshot, .. } => Some(RemoteUpdate::Snapshot(snapshot)),
        WireEvent::AssetAdded { asset, .. } => Some(RemoteUpdate::Asset(asset)),
        // join/leave/map-update are outbound-only; ignore echoes.
        _ => None,
    }
}

// =============================================================================
// CHANNEL TASK
// =============================================================================

async fn run_channel(
    ws_url: String,
    config: SyncConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    updates_tx: mpsc::Sender<RemoteUpdate>,
    phase: Arc<Mutex<ChannelPhase>>,
) {
    let mut joined: Option<Uuid> = None;
    let mut attempts: u32 = 0;

    loop {
        set_phase(&phase, ChannelPhase::Connecting);

        let mut stream = match connect_async(&ws_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                attempts += 1;
                if attempts > config.reconnect_attempts {
                    error!(error = %e, attempts, "realtime channel giving up after reconnect attempts");
                    set_phase(&phase, ChannelPhase::Disconnected);
                    return;
                }
                let delay = backoff_delay(attempts, config.reconnect_base_ms);
                warn!(error = %e, attempt = attempts, delay_ms = delay.as_millis() as u64, "realtime connect failed; retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        attempts = 0;
        info!(url = %ws_url, "realtime channel connected");

        // Re-join the room we were in before the connection dropped.
        if let Some(room_id) = joined {
            if send_event(&mut stream, &WireEvent::JoinRoom { room_id }).await.is_err() {
                continue;
            }
            set_phase(&phase, ChannelPhase::Joined);
        }

        if serve_connection(&mut stream, &mut cmd_rx, &updates_tx, &mut joined, &phase).await {
            set_phase(&phase, ChannelPhase::Disconnected);
            return;
        }

        warn!("realtime connection lost; reconnecting");
    }
}

/// Drive one live connection. Returns true on deliberate shutdown, false
/// when the connection dropped and a reconnect should follow.
async fn serve_connection(
    stream: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<Command>,
    updates_tx: &mpsc::Sender<RemoteUpdate>,
    joined: &mut Option<Uuid>,
    phase: &Arc<Mutex<ChannelPhase>>,
) -> bool {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => {
                        if let Some(room_id) = joined.take() {
                            let _ = send_event(stream, &WireEvent::LeaveRoom { room_id }).await;
                        }
                        let _ = stream.close(None).await;
                        return true;
                    }
                    Some(Command::Join(room_id)) => {
                        if *joined == Some(room_id) {
                            continue;
                        }
                        // Never a member of two rooms at once.
                        if let Some(old) = joined.take() {
                            if send_event(stream, &WireEvent::LeaveRoom { room_id: old }).await.is_err() {
                                *joined = Some(room_id);
                                return false;
                            }
                        }
                        if send_event(stream, &WireEvent::JoinRoom { room_id }).await.is_err() {
                            *joined = Some(room_id);
                            return false;
                        }
                        *joined = Some(room_id);
                        set_phase(phase, ChannelPhase::Joined);
                        info!(%room_id, "joined room");
                    }
                    Some(Command::Leave) => {
                        if let Some(room_id) = joined.take() {
                            let _ = send_event(stream, &WireEvent::LeaveRoom { room_id }).await;
                            set_phase(phase, ChannelPhase::Connecting);
                            info!(%room_id, "left room");
                        }
                    }
                    Some(Command::Broadcast(event)) => {
                        if send_event(stream, &event).await.is_err() {
                            return false;
                        }
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(update) = route_inbound(&text, *joined) {
                            if updates_tx.send(update).await.is_err() {
                                // Service side hung up; nothing left to do.
                                return true;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return false,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event(stream: &mut WsStream, event: &WireEvent) -> Result<(), ()> {
    let text = match event.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode outbound event");
            return Err(());
        }
    };
    stream
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| warn!(error = %e, "websocket send failed"))
}

fn set_phase(phase: &Arc<Mutex<ChannelPhase>>, next: ChannelPhase) {
    *phase.lock().expect("channel phase poisoned") = next;
}

/// Linear back-off with jitter so a herd of clients does not reconnect in
/// lockstep.
fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let base = base_ms.saturating_mul(u64::from(attempt));
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
