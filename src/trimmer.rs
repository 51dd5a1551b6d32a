//! Background maintenance worker.
//!
//! A single worker thread drains maintenance requests for one cache.
//! Requests are idempotent: each one re-checks its condition under the
//! cache lock, so queueing the same request many times is safe and cheap.
//! Worker errors are logged and never propagate to callers.

use crate::cache::Shared;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Maintenance requests accepted by the worker.
pub(crate) enum Maintenance {
    /// Evict to the byte budget, then compact the journal if warranted.
    Trim,
    /// Stop the worker.
    Shutdown,
}

/// Spawn the maintenance worker for a cache.
pub(crate) fn spawn(shared: Arc<Shared>, rx: Receiver<Maintenance>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("blobcache-maintenance".to_string())
        .spawn(move || run(shared, rx))
        .expect("failed to spawn maintenance thread")
}

fn run(shared: Arc<Shared>, rx: Receiver<Maintenance>) {
    while let Ok(request) = rx.recv() {
        match request {
            Maintenance::Shutdown => break,
            Maintenance::Trim => {
                let mut inner = shared.inner.lock();
                if inner.is_closed() {
                    continue;
                }
                if let Err(err) = inner.trim_to_size() {
                    warn!(error = %err, "background trim failed");
                    continue;
                }
                if inner.journal_rebuild_required() {
                    if let Err(err) = inner.rebuild_journal() {
                        warn!(error = %err, "journal rebuild failed");
                    }
                }
            }
        }
    }
}
