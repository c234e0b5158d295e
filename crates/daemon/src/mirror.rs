//! Wiring of the poller, the quality session and the status server.
//!
//! Each collaborator is constructed once here and injected into the
//! components that need it; they all live as long as the `Mirror`.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::artwork::{ArtworkCache, ArtworkResolver, ReportedArtwork};
use crate::config::{Config, ConfigError};
use crate::events::{EventSource, JournalSource};
use crate::extract::FactExtractor;
use crate::hub::Subscription;
use crate::model::{AudioFormatFact, PlayerSnapshot};
use crate::poller::{PlayerStatePoller, PollIntervals};
use crate::session::{QualitySession, TrackChangeListener};
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{create_status_router, run_status_server, ServerError, StatusState};
use crate::surface::{ControlSurface, PlayerctlSurface, SurfaceError};

/// Error type for mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Status server error: {0}")]
    Server(#[from] ServerError),
}

/// The running system: one poller signalling one quality session.
pub struct Mirror {
    pub config: Config,
    session: QualitySession,
    poller: PlayerStatePoller,
}

impl Mirror {
    /// Load the config file (plus env overrides), run startup checks and build
    /// the system over `playerctl` and the journal.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, MirrorError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Build over `playerctl` and the journal from an already loaded config.
    pub fn with_config(config: Config) -> Result<Self, MirrorError> {
        config.validate()?;
        run_startup_checks()?;
        Ok(Self::new_without_checks(config))
    }

    /// Like [`Mirror::with_config`] without probing for the external tools.
    pub fn new_without_checks(config: Config) -> Self {
        let timeout = config.poll.command_timeout();
        let surface = Arc::new(PlayerctlSurface::new(config.player.name.clone(), timeout));
        let identifiers = FactExtractor::new(&config.sources).subsystems();
        let source = Arc::new(JournalSource::new(identifiers, timeout));
        Self::with_collaborators(config, surface, source, Arc::new(ReportedArtwork))
    }

    /// Build over arbitrary collaborators.
    pub fn with_collaborators(
        config: Config,
        surface: Arc<dyn ControlSurface>,
        source: Arc<dyn EventSource>,
        resolver: Arc<dyn ArtworkResolver>,
    ) -> Self {
        let session = QualitySession::from_config(source, &config.quality, &config.sources);
        let artwork = Arc::new(ArtworkCache::new(resolver));
        let listener: Arc<dyn TrackChangeListener> = Arc::new(session.clone());
        let poller = PlayerStatePoller::new(
            surface,
            artwork,
            PollIntervals::from_config(&config.poll),
            Some(listener),
        );

        Self {
            config,
            session,
            poller,
        }
    }

    pub fn poller(&self) -> &PlayerStatePoller {
        &self.poller
    }

    pub fn session(&self) -> &QualitySession {
        &self.session
    }

    /// Start polling. Idempotent.
    pub fn start(&self) {
        self.poller.start();
    }

    /// Stop polling and abandon any running scan.
    pub fn stop(&self) {
        self.poller.stop();
        self.session.stop();
    }

    pub fn subscribe_snapshots(&self) -> Subscription<PlayerSnapshot> {
        self.poller.subscribe_snapshots()
    }

    pub fn subscribe_facts(&self) -> Subscription<AudioFormatFact> {
        self.session.subscribe_facts()
    }

    pub fn latest_snapshot(&self) -> Option<PlayerSnapshot> {
        self.poller.latest_snapshot()
    }

    pub fn latest_fact(&self) -> Option<AudioFormatFact> {
        self.session.latest_fact()
    }

    pub async fn refresh_now(&self) -> Option<PlayerSnapshot> {
        self.poller.refresh_now().await
    }

    pub async fn next(&self) -> Result<(), SurfaceError> {
        self.poller.next().await
    }

    pub async fn previous(&self) -> Result<(), SurfaceError> {
        self.poller.previous().await
    }

    pub async fn toggle_play_pause(&self) -> Result<(), SurfaceError> {
        self.poller.toggle_play_pause().await
    }

    pub async fn toggle_shuffle(&self) -> Result<(), SurfaceError> {
        self.poller.toggle_shuffle().await
    }

    pub async fn cycle_repeat(&self) -> Result<(), SurfaceError> {
        self.poller.cycle_repeat().await
    }

    pub async fn seek(&self, seconds: f64) -> Result<(), SurfaceError> {
        self.poller.seek(seconds).await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<(), SurfaceError> {
        self.poller.set_volume(volume).await
    }

    pub fn status_state(&self) -> StatusState {
        StatusState {
            snapshots: self.poller.snapshots_hub(),
            facts: self.session.facts_hub(),
        }
    }

    pub fn status_router(&self) -> axum::Router {
        create_status_router(self.status_state())
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Starts the poller and, when enabled, serves status on the configured
    /// address. A status server that fails to bind ends the run with an error.
    pub async fn run_with_server(&self, shutdown: CancellationToken) -> Result<(), MirrorError> {
        self.start();

        let result = if self.config.status.enabled {
            run_status_server(self.status_state(), &self.config.status.bind, shutdown.clone())
                .await
                .map_err(MirrorError::from)
        } else {
            shutdown.cancelled().await;
            Ok(())
        };

        self.stop();
        info!("mirror stopped");
        result
    }
}
