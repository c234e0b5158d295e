//! Quality-fusion session: one bounded log scan per track epoch.
//!
//! `on_track_changed` resets the per-track state and spawns a scan loop tagged
//! with the new epoch token. The loop queries the event source without holding
//! any lock, then re-checks its token under the lock before folding or
//! publishing anything. A superseded loop notices at its next check point and
//! exits without applying its result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunewatch_config::{QualityConfig, SourcesConfig};

use crate::events::{EventSource, LogEntry};
use crate::extract::FactExtractor;
use crate::hub::{BroadcastHub, Subscription};
use crate::merge::FactMerger;
use crate::model::{AudioFormatFact, SourceKind, TrackEpoch};

/// Receiver of the poller's track change signal.
pub trait TrackChangeListener: Send + Sync {
    fn on_track_changed(&self, epoch: TrackEpoch);
}

/// Timing of one scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    /// Hard bound on the whole scan
    pub timeout: Duration,
    /// Sleep between two queries
    pub quantum: Duration,
    /// How far before the epoch start the first query reaches
    pub lookback: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &QualityConfig) -> Self {
        Self {
            timeout: config.scan_timeout(),
            quantum: config.scan_quantum(),
            lookback: config.lookback(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&QualityConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Scanning,
}

/// Why a scan loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    DecoderSeen,
    Corroborated,
    TimedOut,
    SourceFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::DecoderSeen => write!(f, "decoder fact"),
            StopReason::Corroborated => write!(f, "companion and pipeline corroborated"),
            StopReason::TimedOut => write!(f, "timeout"),
            StopReason::SourceFailed => write!(f, "source failure"),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    epoch: Option<TrackEpoch>,
    accumulated: Option<AudioFormatFact>,
    seen: HashSet<SourceKind>,
    /// Timestamp of the latest entry examined this epoch
    cursor: Option<DateTime<Utc>>,
    phase: ScanPhase,
    task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn is_current(&self, epoch: &TrackEpoch) -> bool {
        self.epoch.map(|e| e.token) == Some(epoch.token)
    }
}

struct SessionInner {
    source: Arc<dyn EventSource>,
    extractor: FactExtractor,
    merger: FactMerger,
    settings: ScanSettings,
    facts: BroadcastHub<AudioFormatFact>,
    state: Mutex<SessionState>,
}

/// Handle to the quality session. Clones share the same session.
#[derive(Clone)]
pub struct QualitySession {
    inner: Arc<SessionInner>,
}

impl QualitySession {
    pub fn new(
        source: Arc<dyn EventSource>,
        extractor: FactExtractor,
        merger: FactMerger,
        settings: ScanSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                source,
                extractor,
                merger,
                settings,
                facts: BroadcastHub::new(),
                state: Mutex::new(SessionState {
                    epoch: None,
                    accumulated: None,
                    seen: HashSet::new(),
                    cursor: None,
                    phase: ScanPhase::Idle,
                    task: None,
                }),
            }),
        }
    }

    pub fn from_config(
        source: Arc<dyn EventSource>,
        quality: &QualityConfig,
        sources: &SourcesConfig,
    ) -> Self {
        Self::new(
            source,
            FactExtractor::new(sources),
            FactMerger::from_config(quality),
            ScanSettings::from_config(quality),
        )
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a scan for `epoch`, superseding any scan of an older epoch.
    ///
    /// Signals carrying a token that is not newer than the current one are ignored.
    pub fn on_track_changed(&self, epoch: TrackEpoch) {
        let mut state = self.lock();
        if let Some(current) = state.epoch {
            if !current.is_superseded_by(&epoch) {
                debug!(
                    current = %current.token,
                    signal = %epoch.token,
                    "ignoring stale track change"
                );
                return;
            }
        }

        // The previous loop is left to notice the new token on its own
        state.task = None;
        state.epoch = Some(epoch);
        state.accumulated = None;
        state.seen.clear();
        state.cursor = None;
        self.inner.facts.clear_latest();

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(epoch = %epoch.token, "no async runtime, quality scan skipped");
                state.phase = ScanPhase::Idle;
                return;
            }
        };

        state.phase = ScanPhase::Scanning;
        let session = self.clone();
        state.task = Some(runtime.spawn(async move { session.scan(epoch).await }));
        info!(epoch = %epoch.token, started_at = %epoch.started_at, "quality scan started");
    }

    /// Abort the running scan, if any, and go idle.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.phase = ScanPhase::Idle;
    }

    pub fn subscribe_facts(&self) -> Subscription<AudioFormatFact> {
        self.inner.facts.subscribe()
    }

    /// Hub of merged facts, for read-only consumers such as the status server.
    pub fn facts_hub(&self) -> BroadcastHub<AudioFormatFact> {
        self.inner.facts.clone()
    }

    /// Latest merged fact of the current epoch.
    pub fn latest_fact(&self) -> Option<AudioFormatFact> {
        self.inner.facts.latest()
    }

    pub fn phase(&self) -> ScanPhase {
        self.lock().phase
    }

    pub fn current_epoch(&self) -> Option<TrackEpoch> {
        self.lock().epoch
    }

    /// Source kinds folded so far in the current epoch.
    pub fn seen_sources(&self) -> Vec<SourceKind> {
        let mut seen: Vec<SourceKind> = self.lock().seen.iter().copied().collect();
        seen.sort_by_key(|kind| kind.to_string());
        seen
    }

    async fn scan(self, epoch: TrackEpoch) {
        let settings = self.inner.settings;
        let deadline = Instant::now() + settings.timeout;
        let lookback = chrono::Duration::from_std(settings.lookback)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let first_since = epoch.started_at - lookback;

        loop {
            let since = {
                let state = self.lock();
                if !state.is_current(&epoch) {
                    return;
                }
                state.cursor.unwrap_or(first_since)
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.finish(&epoch, StopReason::TimedOut);
                return;
            }

            let entries =
                match tokio::time::timeout(remaining, self.inner.source.query(since)).await {
                    Err(_) => {
                        self.finish(&epoch, StopReason::TimedOut);
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            epoch = %epoch.token,
                            error = %e,
                            "event source query failed, scan aborted"
                        );
                        self.finish(&epoch, StopReason::SourceFailed);
                        return;
                    }
                    Ok(Ok(entries)) => entries,
                };

            if let Some(reason) = self.apply_batch(&epoch, entries) {
                self.finish(&epoch, reason);
                return;
            }
            if !self.lock().is_current(&epoch) {
                return;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.finish(&epoch, StopReason::TimedOut);
                return;
            }
            tokio::time::sleep(settings.quantum.min(remaining)).await;
        }
    }

    /// Fold one query result into the epoch state and publish if anything changed.
    ///
    /// Returns the stop reason when a stop condition fired.
    fn apply_batch(&self, epoch: &TrackEpoch, mut entries: Vec<LogEntry>) -> Option<StopReason> {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            debug!(epoch = %epoch.token, "discarding stale scan result");
            return None;
        }

        // Stable: equal timestamps keep the source's order
        entries.sort_by_key(|e| e.timestamp);

        // Entries sharing a timestamp within one batch are all folded
        let previous_cursor = state.cursor;
        let mut folded = 0usize;
        let mut stop = None;
        for entry in &entries {
            if previous_cursor.is_some_and(|cursor| entry.timestamp <= cursor) {
                continue;
            }
            state.cursor = Some(entry.timestamp);

            let Some(fact) = self.inner.extractor.extract(entry) else {
                continue;
            };
            let fact = self.inner.merger.normalize(fact);
            let merged = self
                .inner
                .merger
                .merge(state.accumulated.as_ref(), &fact, epoch.started_at);
            debug!(
                epoch = %epoch.token,
                source = %fact.source,
                codec = %merged.codec,
                label = %merged.label(),
                "fact folded"
            );
            state.accumulated = Some(merged);
            state.seen.insert(fact.source);
            folded += 1;

            if fact.source == SourceKind::Decoder {
                stop = Some(StopReason::DecoderSeen);
                break;
            }
            if state.seen.contains(&SourceKind::CompanionApp)
                && state.seen.contains(&SourceKind::MediaPipeline)
            {
                stop = Some(StopReason::Corroborated);
                break;
            }
        }

        if folded > 0 {
            if let Some(fact) = &state.accumulated {
                self.inner.facts.publish(fact.clone());
            }
        }
        stop
    }

    fn finish(&self, epoch: &TrackEpoch, reason: StopReason) {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return;
        }
        state.phase = ScanPhase::Idle;
        state.task = None;

        let label = state
            .accumulated
            .as_ref()
            .map(|f| f.label())
            .unwrap_or_default();
        info!(epoch = %epoch.token, reason = %reason, label = %label, "quality scan settled");
    }
}

impl TrackChangeListener for QualitySession {
    fn on_track_changed(&self, epoch: TrackEpoch) {
        QualitySession::on_track_changed(self, epoch);
    }
}

impl std::fmt::Debug for QualitySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("QualitySession")
            .field("epoch", &state.epoch)
            .field("phase", &state.phase)
            .field("accumulated", &state.accumulated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryEventSource, SourceError};
    use crate::model::{Codec, EpochMinter};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    const DECODER: &str = "com.apple.coreaudio";
    const COMPANION: &str = "com.apple.Music";
    const PIPELINE: &str = "com.apple.coremedia";

    const DECODER_LINE: &str =
        "ACAppleLosslessDecoder Input format: 2ch, 96000 Hz, 'alac' from 24-bit source";

    fn settings() -> ScanSettings {
        ScanSettings {
            timeout: Duration::from_millis(1000),
            quantum: Duration::from_millis(100),
            lookback: Duration::from_millis(3000),
        }
    }

    fn session_over(source: Arc<dyn EventSource>) -> QualitySession {
        QualitySession::new(
            source,
            FactExtractor::default(),
            FactMerger::default(),
            settings(),
        )
    }

    fn at(start: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        start + chrono::Duration::milliseconds(millis)
    }

    async fn wait_idle(session: &QualitySession) {
        while session.phase() == ScanPhase::Scanning {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Holds back the first query until released; later queries return nothing.
    struct GatedSource {
        gate: Arc<Notify>,
        first: std::sync::Mutex<Option<Vec<LogEntry>>>,
    }

    #[async_trait]
    impl EventSource for GatedSource {
        async fn query(&self, _since: DateTime<Utc>) -> Result<Vec<LogEntry>, SourceError> {
            let pending = self.first.lock().unwrap().take();
            match pending {
                Some(entries) => {
                    self.gate.notified().await;
                    Ok(entries)
                }
                None => Ok(Vec::new()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decoder_fact_stops_early() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![
            LogEntry::new(COMPANION, "sdBitRate = 256 kbps", at(epoch.started_at, 50)),
            LogEntry::new(DECODER, DECODER_LINE, at(epoch.started_at, 100)),
        ]));
        let session = session_over(source);
        let mut facts = session.subscribe_facts();

        let started = Instant::now();
        session.on_track_changed(epoch);
        assert_eq!(session.phase(), ScanPhase::Scanning);
        wait_idle(&session).await;
        assert!(started.elapsed() < settings().timeout);

        let fact = facts.recv().await.unwrap();
        assert_eq!(fact.source, SourceKind::Decoder);
        assert_eq!(fact.sample_rate, 96000.0);
        assert_eq!(fact.bit_depth, 24);
        assert_eq!(fact.codec, Codec::Lossless);
        assert_eq!(facts.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_companion_and_pipeline_stop_early() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::new());
        let session = session_over(source.clone());

        let started = Instant::now();
        session.on_track_changed(epoch);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(session.phase(), ScanPhase::Scanning);

        source.extend(vec![
            LogEntry::new(
                PIPELINE,
                "Creating AudioQueue format:'qlac' sampleRate:44100",
                at(epoch.started_at, 200),
            ),
            LogEntry::new(COMPANION, "sdBitDepth = 24 bit", at(epoch.started_at, 250)),
        ]);
        wait_idle(&session).await;
        assert!(started.elapsed() < settings().timeout);

        let fact = session.latest_fact().unwrap();
        assert_eq!(fact.sample_rate, 44100.0);
        assert_eq!(fact.bit_depth, 24);
        assert_eq!(fact.label(), "24-bit / 44.1 kHz");
        assert_eq!(
            session.seen_sources(),
            vec![SourceKind::CompanionApp, SourceKind::MediaPipeline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_timestamp_entries_are_all_folded() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let ts = at(epoch.started_at, 100);
        let source = Arc::new(MemoryEventSource::with_entries(vec![
            LogEntry::new(PIPELINE, "Creating AudioQueue format:'qlac' sampleRate:44100", ts),
            LogEntry::new(COMPANION, "sdBitDepth = 24 bit", ts),
        ]));
        let session = session_over(source);

        let started = Instant::now();
        session.on_track_changed(epoch);
        wait_idle(&session).await;
        assert!(started.elapsed() < settings().timeout);

        let fact = session.latest_fact().unwrap();
        assert_eq!(fact.sample_rate, 44100.0);
        assert_eq!(fact.bit_depth, 24);
        assert_eq!(
            session.seen_sources(),
            vec![SourceKind::CompanionApp, SourceKind::MediaPipeline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out_with_partial_fact() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![LogEntry::new(
            COMPANION,
            "sdBitRate = 256 kbps",
            at(epoch.started_at, 10),
        )]));
        let session = session_over(source);
        let mut facts = session.subscribe_facts();

        let started = Instant::now();
        session.on_track_changed(epoch);
        wait_idle(&session).await;
        assert!(started.elapsed() >= settings().timeout);

        let fact = facts.recv().await.unwrap();
        assert_eq!(fact.label(), "AAC 256 kbps");
        // Later queries see nothing new, so nothing more is published
        assert_eq!(facts.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_nothing_publishes_nothing() {
        let minter = EpochMinter::new();
        let session = session_over(Arc::new(MemoryEventSource::new()));
        let mut facts = session.subscribe_facts();

        session.on_track_changed(minter.mint(Utc::now()));
        wait_idle(&session).await;

        assert_eq!(facts.try_recv(), None);
        assert_eq!(session.latest_fact(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_scan_never_publishes() {
        let minter = EpochMinter::new();
        let e1 = minter.mint(Utc::now());
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            gate: gate.clone(),
            first: std::sync::Mutex::new(Some(vec![LogEntry::new(
                DECODER,
                DECODER_LINE,
                at(e1.started_at, 100),
            )])),
        });
        let session = session_over(source);
        let mut facts = session.subscribe_facts();

        session.on_track_changed(e1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let e2 = minter.mint(at(e1.started_at, 500));
        session.on_track_changed(e2);
        gate.notify_one();

        wait_idle(&session).await;
        assert_eq!(session.current_epoch().map(|e| e.token), Some(e2.token));
        assert_eq!(facts.try_recv(), None);
        assert_eq!(session.latest_fact(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_token_is_ignored() {
        let minter = EpochMinter::new();
        let old = minter.mint(Utc::now());
        let new = minter.mint(Utc::now());
        let session = session_over(Arc::new(MemoryEventSource::new()));

        session.on_track_changed(new);
        session.on_track_changed(old);
        assert_eq!(session.current_epoch().map(|e| e.token), Some(new.token));

        // Re-signalling the current epoch does not restart the scan
        session.on_track_changed(new);
        assert_eq!(session.current_epoch().map(|e| e.token), Some(new.token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_epoch_clears_previous_fact() {
        let minter = EpochMinter::new();
        let e1 = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![LogEntry::new(
            DECODER,
            DECODER_LINE,
            at(e1.started_at, 100),
        )]));
        let session = session_over(source);

        session.on_track_changed(e1);
        wait_idle(&session).await;
        assert!(session.latest_fact().is_some());

        // Far enough in the future that the old entry is outside the lookback
        let e2 = minter.mint(at(e1.started_at, 60_000));
        session.on_track_changed(e2);
        assert_eq!(session.latest_fact(), None);
        assert!(session.seen_sources().is_empty());

        let mut late = session.subscribe_facts();
        wait_idle(&session).await;
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_unavailable_goes_idle() {
        let minter = EpochMinter::new();
        let source = Arc::new(MemoryEventSource::new());
        source.set_unavailable(true);
        let session = session_over(source);

        let started = Instant::now();
        session.on_track_changed(minter.mint(Utc::now()));
        wait_idle(&session).await;

        assert!(started.elapsed() < settings().timeout);
        assert_eq!(session.latest_fact(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atmos_window_through_session() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![
            LogEntry::new(
                PIPELINE,
                "Creating AudioQueue format:'qlac' sampleRate:48000",
                at(epoch.started_at, 100),
            ),
            LogEntry::new(COMPANION, "spatialAudio = enabled", at(epoch.started_at, 300)),
        ]));
        let session = session_over(source);

        session.on_track_changed(epoch);
        wait_idle(&session).await;
        assert_eq!(session.latest_fact().unwrap().codec, Codec::Atmos);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_atmos_marker_is_ignored() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![
            LogEntry::new(
                PIPELINE,
                "Creating AudioQueue format:'qlac' sampleRate:48000",
                at(epoch.started_at, 100),
            ),
            LogEntry::new(COMPANION, "spatialAudio = enabled", at(epoch.started_at, 5000)),
        ]));
        let session = session_over(source);

        session.on_track_changed(epoch);
        wait_idle(&session).await;
        let fact = session.latest_fact().unwrap();
        assert_eq!(fact.codec, Codec::Lossless);
        assert_eq!(fact.label(), "24-bit / 48.0 kHz");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_before_lookback_are_ignored() {
        let minter = EpochMinter::new();
        let epoch = minter.mint(Utc::now());
        let source = Arc::new(MemoryEventSource::with_entries(vec![
            LogEntry::new(DECODER, DECODER_LINE, at(epoch.started_at, -10_000)),
            LogEntry::new(COMPANION, "sdBitRate = 256 kbps", at(epoch.started_at, -1000)),
        ]));
        let session = session_over(source);

        session.on_track_changed(epoch);
        wait_idle(&session).await;
        let fact = session.latest_fact().unwrap();
        assert_eq!(fact.source, SourceKind::CompanionApp);
        assert_eq!(fact.label(), "AAC 256 kbps");
    }

    #[test]
    fn test_signal_without_runtime_stays_idle() {
        let session = session_over(Arc::new(MemoryEventSource::new()));
        let epoch = EpochMinter::new().mint(Utc::now());
        session.on_track_changed(epoch);
        assert_eq!(session.phase(), ScanPhase::Idle);
        assert_eq!(session.current_epoch(), Some(epoch));
    }
}
