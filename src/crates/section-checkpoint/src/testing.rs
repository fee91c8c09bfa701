//! Test doubles for hosts and for this crate's own tests
//!
//! - [`FakePlayer`] - scriptable [`PlayerHandle`] recording seeks and plays
//! - [`CountingBackend`] - [`MemoryBackend`] that counts writes
//! - [`RecordingBeacon`] - [`BeaconTransport`] that keeps what it was sent

use crate::flush::BeaconTransport;
use crate::probe::{PlayerError, PlayerHandle};
use crate::store::{BackendError, MemoryBackend, StorageBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Scriptable in-memory player
#[derive(Debug)]
pub struct FakePlayer {
    position: Mutex<f64>,
    duration: Mutex<f64>,
    ready_delay: Mutex<Duration>,
    detached: AtomicBool,
    reject_play: AtomicBool,
    calls: AtomicUsize,
    plays: AtomicUsize,
    seeks: Mutex<Vec<f64>>,
}

impl FakePlayer {
    pub fn new(duration: f64) -> Self {
        Self {
            position: Mutex::new(0.0),
            duration: Mutex::new(duration),
            ready_delay: Mutex::new(Duration::ZERO),
            detached: AtomicBool::new(false),
            reject_play: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            plays: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_position(&self, seconds: f64) {
        *self.position.lock() = seconds;
    }

    pub fn set_duration(&self, seconds: f64) {
        *self.duration.lock() = seconds;
    }

    /// Make `ready()` take `delay` before resolving
    pub fn set_ready_delay(&self, delay: Duration) {
        *self.ready_delay.lock() = delay;
    }

    /// Simulate the SDK destroying the player
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn reattach(&self) {
        self.detached.store(false, Ordering::SeqCst);
    }

    /// Make `play()` reject, as autoplay policies do
    pub fn reject_play(&self) {
        self.reject_play.store(true, Ordering::SeqCst);
    }

    /// Total number of player calls
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    /// Every position passed to `set_current_time`
    pub fn seeks(&self) -> Vec<f64> {
        self.seeks.lock().clone()
    }

    fn enter(&self) -> Result<(), PlayerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.detached.load(Ordering::SeqCst) {
            Err(PlayerError::Detached)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PlayerHandle for FakePlayer {
    async fn ready(&self) -> Result<(), PlayerError> {
        let delay = *self.ready_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.enter()
    }

    async fn current_time(&self) -> Result<f64, PlayerError> {
        self.enter()?;
        Ok(*self.position.lock())
    }

    async fn duration(&self) -> Result<f64, PlayerError> {
        self.enter()?;
        Ok(*self.duration.lock())
    }

    async fn set_current_time(&self, seconds: f64) -> Result<(), PlayerError> {
        self.enter()?;
        self.seeks.lock().push(seconds);
        *self.position.lock() = seconds;
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.enter()?;
        if self.reject_play.load(Ordering::SeqCst) {
            return Err(PlayerError::Rejected("autoplay blocked".to_string()));
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Memory backend counting successful writes
#[derive(Debug, Clone, Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    writes: std::sync::Arc<AtomicUsize>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            inner: MemoryBackend::with_quota(quota_bytes),
            writes: Default::default(),
        }
    }

    /// Successful `set_item` calls, including the availability probe
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn items(&self) -> HashMap<String, String> {
        self.inner.snapshot()
    }
}

impl StorageBackend for CountingBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.inner.set_item(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), BackendError> {
        self.inner.remove_item(key)
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        self.inner.keys()
    }
}

/// Beacon transport recording `(section, body)` pairs
#[derive(Debug, Default)]
pub struct RecordingBeacon {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

impl BeaconTransport for RecordingBeacon {
    fn send(&self, section_id: &str, body: &str) -> bool {
        self.sent.lock().push((section_id.to_string(), body.to_string()));
        true
    }
}
