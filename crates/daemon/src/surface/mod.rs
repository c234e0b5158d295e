//! Control surface of the external media player.
//!
//! Commands are fire-and-forget: callers refresh the poller afterwards to
//! observe their effect.

pub mod playerctl;

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::model::RepeatMode;

pub use playerctl::PlayerctlSurface;

/// Error type for control surface calls
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// No player answered
    #[error("Player unavailable: {0}")]
    PlayerUnavailable(String),

    /// The player answered but refused the command
    #[error("Player command failed: {0}")]
    CommandFailed(String),

    #[error("Player call timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fields read from the player in one sample, before stabilization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFields {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Seconds
    pub position: f64,
    /// Seconds
    pub duration: f64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    /// 0..=100
    pub volume: u8,
    pub is_playing: bool,
    /// Artwork location reported by the player, if any
    pub art_url: Option<String>,
}

/// Connection to the external player.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn read_fields(&self) -> Result<RawFields, SurfaceError>;

    async fn next(&self) -> Result<(), SurfaceError>;

    async fn previous(&self) -> Result<(), SurfaceError>;

    async fn toggle_play_pause(&self) -> Result<(), SurfaceError>;

    async fn set_shuffle(&self, enabled: bool) -> Result<(), SurfaceError>;

    /// Advance repeat off -> all -> one -> off.
    async fn cycle_repeat(&self) -> Result<(), SurfaceError>;

    async fn seek(&self, seconds: f64) -> Result<(), SurfaceError>;

    /// `volume` is 0..=100.
    async fn set_volume(&self, volume: u8) -> Result<(), SurfaceError>;
}

/// In-process player, for replaying scripted sessions and for tests.
///
/// Commands act on the stored fields the way a real player would; `None`
/// fields make every call fail with `PlayerUnavailable`.
#[derive(Debug, Default)]
pub struct MemorySurface {
    fields: Mutex<Option<RawFields>>,
}

impl MemorySurface {
    pub fn new(fields: Option<RawFields>) -> Self {
        Self {
            fields: Mutex::new(fields),
        }
    }

    pub fn set_fields(&self, fields: Option<RawFields>) {
        *self.lock() = fields;
    }

    pub fn fields(&self) -> Option<RawFields> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RawFields>> {
        self.fields.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(&self, f: impl FnOnce(&mut RawFields)) -> Result<(), SurfaceError> {
        match self.lock().as_mut() {
            Some(fields) => {
                f(fields);
                Ok(())
            }
            None => Err(SurfaceError::PlayerUnavailable(
                "memory player has no track".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ControlSurface for MemorySurface {
    async fn read_fields(&self) -> Result<RawFields, SurfaceError> {
        self.fields().ok_or_else(|| {
            SurfaceError::PlayerUnavailable("memory player has no track".to_string())
        })
    }

    async fn next(&self) -> Result<(), SurfaceError> {
        self.apply(|f| f.position = 0.0)
    }

    async fn previous(&self) -> Result<(), SurfaceError> {
        self.apply(|f| f.position = 0.0)
    }

    async fn toggle_play_pause(&self) -> Result<(), SurfaceError> {
        self.apply(|f| f.is_playing = !f.is_playing)
    }

    async fn set_shuffle(&self, enabled: bool) -> Result<(), SurfaceError> {
        self.apply(|f| f.shuffle = enabled)
    }

    async fn cycle_repeat(&self) -> Result<(), SurfaceError> {
        self.apply(|f| f.repeat = f.repeat.next())
    }

    async fn seek(&self, seconds: f64) -> Result<(), SurfaceError> {
        self.apply(|f| f.position = seconds.clamp(0.0, f.duration.max(0.0)))
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SurfaceError> {
        self.apply(|f| f.volume = volume.min(100))
    }
}
