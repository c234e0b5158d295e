//! Playback progress state shared with a UI.
//!
//! The poller only holds a weak reference to the sink, so the UI decides how
//! long the progress object lives.

use std::sync::{Mutex, MutexGuard};

/// Receiver of transport position updates from the poller.
pub trait ProgressSink: Send + Sync {
    fn update(&self, position: f64, duration: f64);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ProgressState {
    current: f64,
    duration: f64,
    dragging: bool,
    drag_progress: f64,
}

/// Position, duration and scrub state of the playing track.
#[derive(Debug)]
pub struct PlaybackProgress {
    state: Mutex<ProgressState>,
}

impl Default for PlaybackProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                current: 0.0,
                duration: 1.0,
                dragging: false,
                drag_progress: 0.0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn current_time(&self) -> f64 {
        self.state().current
    }

    pub fn duration(&self) -> f64 {
        self.state().duration
    }

    pub fn is_dragging(&self) -> bool {
        self.state().dragging
    }

    /// Fraction in `0.0..=1.0`; the scrub position while dragging.
    pub fn progress(&self) -> f64 {
        let state = self.state();
        if state.dragging {
            state.drag_progress
        } else {
            (state.current / state.duration).clamp(0.0, 1.0)
        }
    }

    pub fn set_dragging(&self, dragging: bool) {
        let mut state = self.state();
        if dragging && !state.dragging {
            state.drag_progress = (state.current / state.duration).clamp(0.0, 1.0);
        }
        state.dragging = dragging;
    }

    pub fn set_drag_progress(&self, fraction: f64) {
        if fraction.is_finite() {
            self.state().drag_progress = fraction.clamp(0.0, 1.0);
        }
    }

    /// Position in seconds the scrub currently points at.
    pub fn drag_target(&self) -> f64 {
        let state = self.state();
        state.drag_progress * state.duration
    }
}

impl ProgressSink for PlaybackProgress {
    fn update(&self, position: f64, duration: f64) {
        let mut state = self.state();
        if state.dragging {
            return;
        }
        state.current = if position.is_finite() { position.max(0.0) } else { 0.0 };
        state.duration = if duration.is_finite() { duration.max(1.0) } else { 1.0 };
    }
}

/// Render seconds as `m:ss`, or `--:--` when not a finite value.
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--:--".to_string();
    }
    let total = seconds.max(0.0).floor() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

/// Parse `m:ss` (or `h:mm:ss`) into seconds.
pub fn parse_clock_time(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }

    let mut total = 0.0;
    for (i, part) in parts.iter().enumerate() {
        let value: f64 = part.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        // Every component after the first is bounded by 60
        if i > 0 && value >= 60.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}
