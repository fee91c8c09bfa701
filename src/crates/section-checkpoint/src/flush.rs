//! Final write on page hide, unload or process exit
//!
//! Periodic writers only persist on their ticks and only when the value moved
//! enough, so the last second of progress would be lost when the host goes
//! away. [`ExitFlusher`] keeps a registry of active writers and, when fired,
//! writes each writer's last sample synchronously, bypassing the delta policy.
//!
//! When a [`BeaconTransport`] is installed the flushed payload is also handed
//! to it. The transport is fire-and-forget: the flusher never waits on it and
//! ignores its result, so a flush can never hold up unload.
//!
//! Native hosts can call [`ExitFlusher::install_signal_handlers`]. Installing
//! the handlers replaces the default terminate-on-signal behaviour, so after
//! the flush the flusher raises an exit request; the host awaits
//! [`ExitFlusher::wait_for_exit`] and shuts down.

use crate::record::Snapshot;
use crate::writer::WriterState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Best-effort transport that survives the host unloading
pub trait BeaconTransport: Send + Sync {
    /// Queue `body` for delivery; must return without waiting on the network.
    /// Returns whether the payload was accepted.
    fn send(&self, section_id: &str, body: &str) -> bool;
}

/// Registry of active writers flushed on exit
#[derive(Clone, Default)]
pub struct ExitFlusher {
    writers: Arc<Mutex<HashMap<Uuid, Weak<WriterState>>>>,
    beacon: Arc<Mutex<Option<Arc<dyn BeaconTransport>>>>,
    exit_requested: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl std::fmt::Debug for ExitFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitFlusher")
            .field("registered", &self.registered_count())
            .field("beacon", &self.beacon.lock().is_some())
            .field("exit_requested", &self.is_exit_requested())
            .finish()
    }
}

impl ExitFlusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the transport used in addition to the local write
    pub fn set_beacon(&self, beacon: Arc<dyn BeaconTransport>) {
        *self.beacon.lock() = Some(beacon);
    }

    /// Number of writers currently registered
    pub fn registered_count(&self) -> usize {
        self.writers.lock().len()
    }

    pub(crate) fn register(&self, writer: &Arc<WriterState>) {
        self.writers
            .lock()
            .entry(writer.id())
            .or_insert_with(|| Arc::downgrade(writer));
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        self.writers.lock().remove(&id);
    }

    /// Write every registered writer's last sample.
    ///
    /// Returns the number of sections written locally.
    pub fn flush_all(&self) -> usize {
        let writers: Vec<Arc<WriterState>> = {
            let mut registry = self.writers.lock();
            registry.retain(|_, writer| writer.strong_count() > 0);
            registry.values().filter_map(Weak::upgrade).collect()
        };
        let beacon = self.beacon.lock().clone();

        let mut flushed = 0;
        for writer in writers {
            let Some(snapshot) = writer.flush() else {
                continue;
            };
            flushed += 1;

            if let Some(beacon) = &beacon {
                send_beacon(beacon.as_ref(), writer.section_id(), &snapshot);
            }
        }

        debug!(flushed, "Exit flush complete");
        flushed
    }

    /// Host signal that the page is being hidden or unloaded
    pub fn page_hidden(&self) -> usize {
        info!("Page hidden, flushing checkpoints");
        self.flush_all()
    }

    /// Flush every writer, then ask the host to exit.
    ///
    /// Returns the number of sections written.
    pub fn exit_on_signal(&self) -> usize {
        let flushed = self.flush_all();
        self.request_exit();
        flushed
    }

    /// Raise the exit request and wake every waiter
    pub fn request_exit(&self) {
        if !self.exit_requested.swap(true, Ordering::SeqCst) {
            info!("Exit requested");
        }
        self.exit_notify.notify_waiters();
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Resolve once an exit was requested, immediately if it already was
    pub async fn wait_for_exit(&self) {
        let notified = self.exit_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_exit_requested() {
            return;
        }
        notified.await;
    }

    /// Flush on SIGINT/SIGTERM (Ctrl+C elsewhere), then request exit.
    ///
    /// The handlers take over the default terminate behaviour; the host must
    /// await [`wait_for_exit`](Self::wait_for_exit) and shut down itself.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let flusher = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let (mut sigint, mut sigterm) =
                    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!(error = %e, "Failed to install exit signal handlers");
                            return;
                        }
                    };

                tokio::select! {
                    _ = sigint.recv() => warn!("Received SIGINT, flushing checkpoints"),
                    _ = sigterm.recv() => warn!("Received SIGTERM, flushing checkpoints"),
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to install Ctrl+C handler");
                    return;
                }
                warn!("Received Ctrl+C, flushing checkpoints");
            }

            flusher.exit_on_signal();
        })
    }
}

fn send_beacon(beacon: &dyn BeaconTransport, section_id: &str, snapshot: &Snapshot) {
    let body = match snapshot.envelope_payload().and_then(|payload| {
        serde_json::to_string(&serde_json::json!({
            "sectionId": section_id,
            "kind": snapshot.kind(),
            "payload": payload,
        }))
    }) {
        Ok(body) => body,
        Err(e) => {
            warn!(section = section_id, error = %e, "Failed to encode beacon payload");
            return;
        }
    };

    if !beacon.send(section_id, &body) {
        debug!(section = section_id, "Beacon transport declined payload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::SectionNamespace;
    use crate::record::MediaPosition;
    use crate::store::{KeyStore, MemoryBackend};
    use crate::testing::RecordingBeacon;
    use crate::writer::CheckpointWriter;

    #[tokio::test]
    async fn test_register_and_deregister_on_stop() {
        let store = Arc::new(KeyStore::open(Arc::new(MemoryBackend::new())));
        let flusher = ExitFlusher::new();

        let writer = CheckpointWriter::reactive(WriterState::new(
            store,
            SectionNamespace::new("s"),
            0.0,
            flusher.clone(),
        ));
        assert_eq!(flusher.registered_count(), 1);

        writer.stop();
        assert_eq!(flusher.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_bypasses_delta_and_sends_beacon() {
        let backend = MemoryBackend::new();
        let store = Arc::new(KeyStore::open(Arc::new(backend.clone())));
        let flusher = ExitFlusher::new();
        let beacon = Arc::new(RecordingBeacon::new());
        flusher.set_beacon(beacon.clone());

        let writer = CheckpointWriter::reactive(WriterState::new(
            store,
            SectionNamespace::new("lecture-4"),
            1.0,
            flusher.clone(),
        ));

        assert!(writer.observe(Snapshot::Media(MediaPosition::new("v", 30.0, 600.0))));
        // Below the delta: sampled but not persisted
        assert!(!writer.observe(Snapshot::Media(MediaPosition::new("v", 30.6, 600.0))));

        assert_eq!(flusher.page_hidden(), 1);
        assert_eq!(
            writer.last_persisted(),
            Some(Snapshot::Media(MediaPosition::new("v", 30.6, 600.0)))
        );

        let sent = beacon.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "lecture-4");
        assert!(sent[0].1.contains("\"positionSeconds\":30.6"));
    }

    #[tokio::test]
    async fn test_flush_without_samples_writes_nothing() {
        let backend = MemoryBackend::new();
        let store = Arc::new(KeyStore::open(Arc::new(backend.clone())));
        let flusher = ExitFlusher::new();
        let _writer = CheckpointWriter::reactive(WriterState::new(
            store,
            SectionNamespace::new("s"),
            0.0,
            flusher.clone(),
        ));

        assert_eq!(flusher.flush_all(), 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_exit_signal_flushes_then_wakes_host() {
        let backend = MemoryBackend::new();
        let store = Arc::new(KeyStore::open(Arc::new(backend.clone())));
        let flusher = ExitFlusher::new();
        let writer = CheckpointWriter::reactive(WriterState::new(
            store,
            SectionNamespace::new("lecture-4"),
            1.0,
            flusher.clone(),
        ));
        writer.observe(Snapshot::Media(MediaPosition::new("v", 30.0, 600.0)));
        writer.observe(Snapshot::Media(MediaPosition::new("v", 30.4, 600.0)));

        let host = flusher.clone();
        let waiter = tokio::spawn(async move { host.wait_for_exit().await });
        tokio::task::yield_now().await;
        assert!(!flusher.is_exit_requested());

        assert_eq!(flusher.exit_on_signal(), 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("host was not woken")
            .unwrap();

        assert!(flusher.is_exit_requested());
        assert_eq!(
            writer.last_persisted(),
            Some(Snapshot::Media(MediaPosition::new("v", 30.4, 600.0)))
        );
    }

    #[tokio::test]
    async fn test_wait_for_exit_after_request_returns_immediately() {
        let flusher = ExitFlusher::new();
        flusher.request_exit();
        tokio::time::timeout(std::time::Duration::from_secs(1), flusher.wait_for_exit())
            .await
            .expect("late waiter must not block");
    }

    #[tokio::test]
    async fn test_dropped_writer_is_not_flushed() {
        let store = Arc::new(KeyStore::open(Arc::new(MemoryBackend::new())));
        let flusher = ExitFlusher::new();
        {
            let writer = CheckpointWriter::reactive(WriterState::new(
                store,
                SectionNamespace::new("s"),
                0.0,
                flusher.clone(),
            ));
            writer.observe(Snapshot::Generic(serde_json::json!({"a": 1})));
        }

        assert_eq!(flusher.registered_count(), 0);
        assert_eq!(flusher.flush_all(), 0);
    }
}
