//! tunewatch
//!
//! Mirrors the state of an external media player and fuses host log lines into
//! a best-effort audio format classification for the playing track.

pub mod artwork;
pub mod events;
pub mod extract;
pub mod hub;
pub mod merge;
pub mod mirror;
pub mod model;
pub mod poller;
pub mod progress;
pub mod session;
pub mod startup;
pub mod status_server;
pub mod surface;

pub use tunewatch_config as config;
pub use tunewatch_config::Config;

pub use artwork::{Artwork, ArtworkCache, ArtworkResolver, NoArtwork, ReportedArtwork};
pub use events::{EventSource, JournalSource, LogEntry, MemoryEventSource, SourceError};
pub use extract::FactExtractor;
pub use hub::{BroadcastHub, Subscription};
pub use merge::FactMerger;
pub use mirror::{Mirror, MirrorError};
pub use model::{
    AudioFormatFact, Codec, EpochMinter, EpochToken, PlayerSnapshot, RepeatMode, SourceKind,
    TrackEpoch, TrackIdentity, UNKNOWN, UNKNOWN_RATE,
};
pub use poller::{stabilize, PlayerStatePoller, PollIntervals, TickOutcome};
pub use progress::{format_time, parse_clock_time, PlaybackProgress, ProgressSink};
pub use session::{QualitySession, ScanPhase, ScanSettings, TrackChangeListener};
pub use startup::{check_tool_available, run_startup_checks, StartupError};
pub use status_server::{
    create_status_router, run_status_server, ServerError, StatusReport, StatusState,
};
pub use surface::{ControlSurface, MemorySurface, PlayerctlSurface, RawFields, SurfaceError};
