//! Value types shared by the poller, the quality session and the status server.
//!
//! Every type here is immutable once built: a new tick or a new fold produces a
//! new value instead of mutating the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::artwork::Artwork;

/// Sentinel for a numeric audio field nobody has reported yet.
pub const UNKNOWN: i32 = -1;

/// Sentinel for an unknown sample rate.
pub const UNKNOWN_RATE: f64 = -1.0;

/// Repeat setting of the mirrored player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    /// Successor in the off -> all -> one -> off cycle.
    pub fn next(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

impl std::fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepeatMode::Off => write!(f, "off"),
            RepeatMode::All => write!(f, "all"),
            RepeatMode::One => write!(f, "one"),
        }
    }
}

/// Title/artist/album triple used to detect track changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl TrackIdentity {
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        album: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: album.into(),
        }
    }

    /// Composite key, also used by the artwork cache.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.title, self.artist, self.album)
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.artist.is_empty() && self.album.is_empty()
    }
}

/// One observation of the mirrored player.
///
/// Structural equality is what the poller uses to suppress duplicate publishes,
/// so every field takes part in `PartialEq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub is_playing: bool,
    /// Transport position in seconds
    pub position: f64,
    /// Track duration in seconds
    pub duration: f64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    /// 0..=100
    pub volume: u8,
    pub artwork: Option<Artwork>,
}

impl PlayerSnapshot {
    pub fn identity(&self) -> TrackIdentity {
        TrackIdentity::new(&self.title, &self.artist, &self.album)
    }
}

/// Codec classification derived from the fused log facts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Atmos,
    Lossless,
    Aac,
    #[default]
    Unknown,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Atmos => write!(f, "atmos"),
            Codec::Lossless => write!(f, "lossless"),
            Codec::Aac => write!(f, "aac"),
            Codec::Unknown => write!(f, "unknown"),
        }
    }
}

/// Host subsystem a fact was extracted from.
///
/// The precedence applied when merging differs per kind, see [`crate::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Audio decoder; authoritative
    Decoder,
    /// The player application's own log lines; gap-filling only
    CompanionApp,
    /// Media pipeline setting up the output queue
    MediaPipeline,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Decoder => write!(f, "decoder"),
            SourceKind::CompanionApp => write!(f, "companion_app"),
            SourceKind::MediaPipeline => write!(f, "media_pipeline"),
        }
    }
}

/// Audio format observation, either straight from one log entry or merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormatFact {
    /// Hz, [`UNKNOWN_RATE`] when unknown
    pub sample_rate: f64,
    /// Bits per sample, [`UNKNOWN`] when unknown
    pub bit_depth: i32,
    /// kbps, [`UNKNOWN`] when unknown or unbounded
    pub bit_rate: i32,
    pub codec: Codec,
    pub source: SourceKind,
    pub observed_at: DateTime<Utc>,
}

impl AudioFormatFact {
    /// A fact with every field unknown, used as the seed of a fold.
    pub fn unknown(source: SourceKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            sample_rate: UNKNOWN_RATE,
            bit_depth: UNKNOWN,
            bit_rate: UNKNOWN,
            codec: Codec::Unknown,
            source,
            observed_at,
        }
    }

    pub fn has_sample_rate(&self) -> bool {
        self.sample_rate > 0.0
    }

    pub fn has_bit_depth(&self) -> bool {
        self.bit_depth != UNKNOWN
    }

    pub fn has_bit_rate(&self) -> bool {
        self.bit_rate != UNKNOWN
    }

    /// Short human readable quality label, e.g. `24-bit / 96.0 kHz`.
    pub fn label(&self) -> String {
        match self.codec {
            Codec::Atmos => "Dolby Atmos".to_string(),
            Codec::Lossless => match (self.has_bit_depth(), self.has_sample_rate()) {
                (true, true) => format!(
                    "{}-bit / {:.1} kHz",
                    self.bit_depth,
                    self.sample_rate / 1000.0
                ),
                (false, true) => format!("{:.1} kHz", self.sample_rate / 1000.0),
                _ => "Lossless".to_string(),
            },
            Codec::Aac if self.has_bit_rate() => format!("AAC {} kbps", self.bit_rate),
            Codec::Aac => "AAC".to_string(),
            Codec::Unknown => String::new(),
        }
    }
}

/// Opaque token for "the current track". Newer tokens compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpochToken(u64);

impl EpochToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EpochToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A detected track change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEpoch {
    pub token: EpochToken,
    pub started_at: DateTime<Utc>,
}

impl TrackEpoch {
    /// Whether `other` supersedes this epoch.
    pub fn is_superseded_by(&self, other: &TrackEpoch) -> bool {
        other.token > self.token
    }
}

/// Hands out strictly increasing epoch tokens.
#[derive(Debug, Default)]
pub struct EpochMinter {
    last: AtomicU64,
}

impl EpochMinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self, started_at: DateTime<Utc>) -> TrackEpoch {
        let token = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        TrackEpoch {
            token: EpochToken(token),
            started_at,
        }
    }
}
