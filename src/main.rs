use std::sync::Arc;

use mapsync::config::SyncConfig;
use mapsync::dimensions::DEFAULT_WORLD_DIMENSIONS;
use mapsync::services::coordinator::DimensionCoordinator;
use mapsync::services::map_state::MapStateService;
use mapsync::services::persistence::HttpMapStore;
use mapsync::services::realtime::RealtimeChannel;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let api_url = std::env::var("MAPSYNC_API_URL").expect("MAPSYNC_API_URL required");
    let ws_url = std::env::var("MAPSYNC_WS_URL").expect("MAPSYNC_WS_URL required");
    let room_id: uuid::Uuid = std::env::var("MAPSYNC_ROOM_ID")
        .expect("MAPSYNC_ROOM_ID required")
        .parse()
        .expect("invalid MAPSYNC_ROOM_ID");

    let config = SyncConfig::from_env();
    let store = Arc::new(HttpMapStore::new(&api_url));
    let (channel, updates_rx, channel_task) = RealtimeChannel::connect(&ws_url, &config);
    let coordinator = Arc::new(DimensionCoordinator::new(DEFAULT_WORLD_DIMENSIONS));
    let service = MapStateService::new(store, channel, coordinator, config);

    service
        .initialize(room_id, updates_rx)
        .await
        .expect("map state initialization failed");

    let mut events = service.subscribe();
    tracing::info!(%room_id, "map sync running; ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(?event, "map event"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.shutdown().await;
    let _ = channel_task.await;
}
