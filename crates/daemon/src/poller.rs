//! Adaptive poller mirroring the external player.
//!
//! Each tick samples the control surface, stabilizes transiently empty
//! identity fields, detects track changes, and republishes the snapshot only
//! when it differs from the last one published. Samples are numbered; a
//! sample that completes after a newer one was applied is discarded.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunewatch_config::PollConfig;

use crate::artwork::{Artwork, ArtworkCache};
use crate::hub::{BroadcastHub, Subscription};
use crate::model::{EpochMinter, PlayerSnapshot, TrackEpoch, TrackIdentity};
use crate::progress::ProgressSink;
use crate::session::TrackChangeListener;
use crate::surface::{ControlSurface, RawFields, SurfaceError};

/// The three sampling tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub playing: Duration,
    pub paused: Duration,
    pub unreachable: Duration,
}

impl PollIntervals {
    pub fn from_config(config: &PollConfig) -> Self {
        Self {
            playing: config.playing_interval(),
            paused: config.paused_interval(),
            unreachable: config.unreachable_interval(),
        }
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self::from_config(&PollConfig::default())
    }
}

/// What the last applied sample saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Playing,
    Paused,
    Unreachable,
}

/// Replace empty identity fields with the last known value of that field.
pub fn stabilize(
    previous: &TrackIdentity,
    title: &str,
    artist: &str,
    album: &str,
) -> TrackIdentity {
    fn pick(previous: &str, current: &str) -> String {
        if current.is_empty() {
            previous.to_string()
        } else {
            current.to_string()
        }
    }

    TrackIdentity {
        title: pick(&previous.title, title),
        artist: pick(&previous.artist, artist),
        album: pick(&previous.album, album),
    }
}

#[derive(Debug, Default)]
struct PollerState {
    /// Stabilized identity of the last applied sample
    stable: TrackIdentity,
    last_outcome: Option<TickOutcome>,
    last_published: Option<PlayerSnapshot>,
    /// Artwork resolved for the identity key it belongs to
    artwork: Option<(String, Option<Artwork>)>,
    /// Ticket handed to the most recently started sample
    issued: u64,
    /// Ticket of the most recently applied sample
    applied: u64,
    epoch: Option<TrackEpoch>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PollerInner {
    surface: Arc<dyn ControlSurface>,
    artwork: Arc<ArtworkCache>,
    intervals: PollIntervals,
    snapshots: BroadcastHub<PlayerSnapshot>,
    listener: Option<Arc<dyn TrackChangeListener>>,
    /// UI progress object; never owned by the poller
    progress: Mutex<Option<Weak<dyn ProgressSink>>>,
    minter: EpochMinter,
    state: Mutex<PollerState>,
    run: Mutex<Option<RunHandle>>,
}

/// Handle to the player state poller. Clones share the same poller.
#[derive(Clone)]
pub struct PlayerStatePoller {
    inner: Arc<PollerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl PlayerStatePoller {
    pub fn new(
        surface: Arc<dyn ControlSurface>,
        artwork: Arc<ArtworkCache>,
        intervals: PollIntervals,
        listener: Option<Arc<dyn TrackChangeListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                surface,
                artwork,
                intervals,
                snapshots: BroadcastHub::new(),
                listener,
                progress: Mutex::new(None),
                minter: EpochMinter::new(),
                state: Mutex::new(PollerState::default()),
                run: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PollerState> {
        lock(&self.inner.state)
    }

    /// Spawn the sampling loop. No-op when it is already running.
    pub fn start(&self) {
        let mut run = lock(&self.inner.run);
        if let Some(handle) = run.as_ref() {
            if !handle.task.is_finished() {
                debug!("player poller already running");
                return;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime, player poller not started");
                return;
            }
        };

        let cancel = CancellationToken::new();
        let poller = self.clone();
        let token = cancel.clone();
        let task = runtime.spawn(async move { poller.run(token).await });
        *run = Some(RunHandle { cancel, task });
    }

    /// Stop the sampling loop. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.run).take() {
            handle.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.run)
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    async fn run(self, cancel: CancellationToken) {
        info!("player poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.refresh_now() => {}
            }

            let delay = self.next_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("player poller stopped");
    }

    /// Delay before the next tick, picked from the last applied sample.
    pub fn next_interval(&self) -> Duration {
        match self.state().last_outcome {
            Some(TickOutcome::Unreachable) => self.inner.intervals.unreachable,
            Some(TickOutcome::Paused) => self.inner.intervals.paused,
            Some(TickOutcome::Playing) | None => self.inner.intervals.playing,
        }
    }

    pub fn last_outcome(&self) -> Option<TickOutcome> {
        self.state().last_outcome
    }

    /// Sample the player once and publish the result if it changed.
    ///
    /// Returns the snapshot built by this sample, or `None` when the player
    /// was unreachable or a newer sample superseded this one.
    pub async fn refresh_now(&self) -> Option<PlayerSnapshot> {
        let ticket = {
            let mut state = self.state();
            state.issued += 1;
            state.issued
        };

        let fields = match self.inner.surface.read_fields().await {
            Ok(fields) => fields,
            Err(e) => {
                let mut state = self.state();
                if ticket > state.applied {
                    state.applied = ticket;
                    state.last_outcome = Some(TickOutcome::Unreachable);
                }
                debug!(error = %e, "player sample failed");
                return None;
            }
        };

        let (identity, changed, cached_artwork) = {
            let mut state = self.state();
            if ticket <= state.applied {
                debug!(ticket, applied = state.applied, "discarding stale player sample");
                return None;
            }
            state.applied = ticket;
            state.last_outcome = Some(if fields.is_playing {
                TickOutcome::Playing
            } else {
                TickOutcome::Paused
            });

            let identity = stabilize(&state.stable, &fields.title, &fields.artist, &fields.album);
            let changed = if identity != state.stable {
                let epoch = self.inner.minter.mint(Utc::now());
                state.stable = identity.clone();
                state.epoch = Some(epoch);
                Some(epoch)
            } else {
                None
            };

            let key = identity.key();
            let cached_artwork = match &state.artwork {
                Some((k, art)) if *k == key && (art.is_some() || fields.art_url.is_none()) => {
                    Some(art.clone())
                }
                _ => None,
            };
            (identity, changed, cached_artwork)
        };

        if let Some(epoch) = changed {
            info!(
                epoch = %epoch.token,
                title = %identity.title,
                artist = %identity.artist,
                album = %identity.album,
                "track changed"
            );
            if let Some(listener) = &self.inner.listener {
                listener.on_track_changed(epoch);
            }
        }

        let artwork = match cached_artwork {
            Some(art) => art,
            None if identity.is_empty() => None,
            None => {
                self.inner
                    .artwork
                    .resolve(&identity, fields.art_url.as_deref())
                    .await
            }
        };

        let snapshot = build_snapshot(&identity, &fields, artwork.clone());
        {
            let mut state = self.state();
            if state.applied != ticket || state.stable != identity {
                debug!(ticket, "player sample superseded while resolving artwork");
                return None;
            }
            state.artwork = Some((identity.key(), artwork));

            if state.last_published.as_ref() != Some(&snapshot) {
                self.inner.snapshots.publish(snapshot.clone());
                state.last_published = Some(snapshot.clone());
            }
        }

        self.update_progress(snapshot.position, snapshot.duration);
        Some(snapshot)
    }

    fn update_progress(&self, position: f64, duration: f64) {
        let mut slot = lock(&self.inner.progress);
        let Some(weak) = slot.as_ref() else {
            return;
        };
        match weak.upgrade() {
            Some(sink) => sink.update(position, duration),
            None => {
                debug!("progress sink dropped, unbinding");
                *slot = None;
            }
        }
    }

    /// Attach a progress sink without taking ownership of it.
    pub fn bind_progress<S: ProgressSink + 'static>(&self, sink: &Arc<S>) {
        let weak: Weak<S> = Arc::downgrade(sink);
        let weak: Weak<dyn ProgressSink> = weak;
        *lock(&self.inner.progress) = Some(weak);
    }

    pub fn has_progress_sink(&self) -> bool {
        lock(&self.inner.progress)
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn subscribe_snapshots(&self) -> Subscription<PlayerSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Hub of snapshots, for read-only consumers such as the status server.
    pub fn snapshots_hub(&self) -> BroadcastHub<PlayerSnapshot> {
        self.inner.snapshots.clone()
    }

    pub fn latest_snapshot(&self) -> Option<PlayerSnapshot> {
        self.inner.snapshots.latest()
    }

    pub fn current_epoch(&self) -> Option<TrackEpoch> {
        self.state().epoch
    }

    async fn after_command(
        &self,
        command: &str,
        result: Result<(), SurfaceError>,
    ) -> Result<(), SurfaceError> {
        match &result {
            Ok(()) => debug!(command, "player command sent"),
            Err(e) => warn!(command, error = %e, "player command failed"),
        }
        self.refresh_now().await;
        result
    }

    pub async fn next(&self) -> Result<(), SurfaceError> {
        let result = self.inner.surface.next().await;
        self.after_command("next", result).await
    }

    pub async fn previous(&self) -> Result<(), SurfaceError> {
        let result = self.inner.surface.previous().await;
        self.after_command("previous", result).await
    }

    pub async fn toggle_play_pause(&self) -> Result<(), SurfaceError> {
        let result = self.inner.surface.toggle_play_pause().await;
        self.after_command("toggle_play_pause", result).await
    }

    pub async fn seek(&self, seconds: f64) -> Result<(), SurfaceError> {
        let result = self.inner.surface.seek(seconds).await;
        self.after_command("seek", result).await
    }

    /// Values above 100 are clamped.
    pub async fn set_volume(&self, volume: u8) -> Result<(), SurfaceError> {
        let result = self.inner.surface.set_volume(volume.min(100)).await;
        self.after_command("set_volume", result).await
    }

    /// Flip shuffle relative to the last published snapshot.
    pub async fn toggle_shuffle(&self) -> Result<(), SurfaceError> {
        let current = self
            .state()
            .last_published
            .as_ref()
            .is_some_and(|s| s.shuffle);
        let result = self.inner.surface.set_shuffle(!current).await;
        self.after_command("toggle_shuffle", result).await
    }

    pub async fn cycle_repeat(&self) -> Result<(), SurfaceError> {
        let result = self.inner.surface.cycle_repeat().await;
        self.after_command("cycle_repeat", result).await
    }
}

fn build_snapshot(
    identity: &TrackIdentity,
    fields: &RawFields,
    artwork: Option<Artwork>,
) -> PlayerSnapshot {
    PlayerSnapshot {
        title: identity.title.clone(),
        artist: identity.artist.clone(),
        album: identity.album.clone(),
        is_playing: fields.is_playing,
        position: fields.position,
        duration: fields.duration,
        shuffle: fields.shuffle,
        repeat: fields.repeat,
        volume: fields.volume.min(100),
        artwork,
    }
}

impl std::fmt::Debug for PlayerStatePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PlayerStatePoller")
            .field("stable", &state.stable)
            .field("last_outcome", &state.last_outcome)
            .field("epoch", &state.epoch)
            .finish()
    }
}
