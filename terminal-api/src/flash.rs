//! Background task feeding instrument changes into the flash engine

use std::sync::Arc;

use terminal_core::{EntityKind, EntityRecord};
use terminal_sync::{CellKey, Clock, FlashEngine, Query, Selection, SyncHandle, SyncResult, SystemClock};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Every field of every record as a flash cell
fn cells(records: Vec<EntityRecord>) -> impl Iterator<Item = (CellKey, terminal_core::FieldValue)> {
    records.into_iter().flat_map(|record| {
        let key = record.key;
        record
            .fields
            .into_iter()
            .map(move |(field, value)| (CellKey::new(key.clone(), field), value))
    })
}

/// Watch all instruments and record highlights as their fields move
pub async fn spawn_watcher(
    sync: SyncHandle,
    flash: Arc<RwLock<FlashEngine>>,
    clock: Arc<SystemClock>,
) -> SyncResult<()> {
    let mut selector = sync.select(Query::Kind(EntityKind::Instrument)).await?;

    // Seed previous values so the first update already flashes
    if let Selection::Kind(records) = selector.current() {
        flash.write().await.observe_batch(cells(records), clock.now_ms());
    }

    tokio::spawn(async move {
        while let Ok(selection) = selector.changed().await {
            let Selection::Kind(records) = selection else {
                continue;
            };
            let now = clock.now_ms();
            let mut flash = flash.write().await;
            let changed = flash.observe_batch(cells(records), now);
            let expired = flash.sweep(now);
            if !changed.is_empty() {
                debug!(
                    "Flashing {} cells ({} highlights expired)",
                    changed.len(),
                    expired.len()
                );
            }
        }
        info!("Flash watcher stopped: sync engine closed");
    });

    Ok(())
}
