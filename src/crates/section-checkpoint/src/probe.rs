//! Liveness checks for external media players
//!
//! Player handles come from SDKs the engine does not control: an embed can be
//! torn down by a re-render, navigation or the SDK itself while a timer still
//! holds the handle. Before every periodic sample and before a restore seek
//! the engine asks a [`LivenessProbe`] whether the handle is still usable.
//!
//! ```text
//!   Unknown ──check()──▶ Probing ──ok──────▶ Alive ──check()──▶ Probing ...
//!      ▲                    │
//!      │                    └──error/timeout──▶ Dead (terminal)
//!      └──────────── rearm(new handle) ◀────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a player call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    /// The underlying player has been destroyed
    #[error("player detached")]
    Detached,

    /// The player rejected the call
    #[error("player call rejected: {0}")]
    Rejected(String),
}

/// Capability interface over a concrete media player
///
/// Implemented by native media elements and third-party embed SDKs alike.
/// Every call may suspend for an unbounded time and may fail.
#[async_trait]
pub trait PlayerHandle: Send + Sync {
    /// Resolves once the player can accept commands
    async fn ready(&self) -> Result<(), PlayerError>;

    /// Current playback position in seconds
    async fn current_time(&self) -> Result<f64, PlayerError>;

    /// Duration of the loaded asset in seconds
    async fn duration(&self) -> Result<f64, PlayerError>;

    /// Seek to `seconds`
    async fn set_current_time(&self, seconds: f64) -> Result<(), PlayerError>;

    /// Resume playback
    async fn play(&self) -> Result<(), PlayerError>;
}

/// Probe state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Unknown,
    Probing,
    Alive,
    Dead,
}

struct ProbeInner {
    player: Arc<dyn PlayerHandle>,
    state: ProbeState,
    generation: u64,
}

/// Tracks whether one player handle is still usable
pub struct LivenessProbe {
    inner: Mutex<ProbeInner>,
    timeout: Duration,
}

impl std::fmt::Debug for LivenessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LivenessProbe")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LivenessProbe {
    pub fn new(player: Arc<dyn PlayerHandle>, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(ProbeInner {
                player,
                state: ProbeState::Unknown,
                generation: 0,
            }),
            timeout,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.inner.lock().state
    }

    /// Longest a single check may wait on the player
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The handle currently being probed
    pub fn player(&self) -> Arc<dyn PlayerHandle> {
        self.inner.lock().player.clone()
    }

    /// Check the handle by calling `ready()` and `duration()`.
    ///
    /// Returns `false` without touching the player once the probe is `Dead`.
    /// A rejected call or a call outliving the probe timeout marks the handle
    /// dead; a duration that is not yet a finite number (metadata still
    /// loading) only fails this check.
    pub async fn check(&self) -> bool {
        let (player, generation) = {
            let mut inner = self.inner.lock();
            if inner.state == ProbeState::Dead {
                return false;
            }
            inner.state = ProbeState::Probing;
            (inner.player.clone(), inner.generation)
        };

        let result = tokio::time::timeout(self.timeout, async {
            player.ready().await?;
            player.duration().await
        })
        .await;

        let next = match result {
            Ok(Ok(duration)) if duration.is_finite() && duration > 0.0 => ProbeState::Alive,
            Ok(Ok(duration)) => {
                debug!(duration, "Player duration not available yet");
                ProbeState::Unknown
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Player probe rejected");
                ProbeState::Dead
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Player probe timed out");
                ProbeState::Dead
            }
        };

        let mut inner = self.inner.lock();
        // A handle swapped in while probing gets its own verdict
        if inner.generation != generation {
            return false;
        }
        inner.state = next;
        next == ProbeState::Alive
    }

    /// Record that a call outside the probe failed on the current handle
    pub fn mark_dead(&self) {
        self.inner.lock().state = ProbeState::Dead;
    }

    /// Replace the handle and reset to `Unknown`
    pub fn rearm(&self, player: Arc<dyn PlayerHandle>) {
        let mut inner = self.inner.lock();
        inner.player = player;
        inner.state = ProbeState::Unknown;
        inner.generation += 1;
    }
}
