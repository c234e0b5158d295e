//! Source-precedence fusion of audio format facts.
//!
//! The decoder is authoritative, the media pipeline overwrites everything but
//! a known companion bit depth, and the companion app only fills gaps. Weak
//! atmos signals are trusted only inside a short window after the track change.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tunewatch_config::QualityConfig;

use crate::model::{AudioFormatFact, Codec, SourceKind, UNKNOWN, UNKNOWN_RATE};

/// Pure fold function `(accumulated, candidate) -> accumulated`.
#[derive(Debug, Clone, Copy)]
pub struct FactMerger {
    atmos_window: chrono::Duration,
    atmos_bitrate_floor: i32,
}

impl Default for FactMerger {
    fn default() -> Self {
        Self::from_config(&QualityConfig::default())
    }
}

impl FactMerger {
    pub fn new(atmos_window: Duration, atmos_bitrate_floor: i32) -> Self {
        let millis = i64::try_from(atmos_window.as_millis()).unwrap_or(i64::MAX);
        Self {
            atmos_window: chrono::Duration::milliseconds(millis),
            atmos_bitrate_floor,
        }
    }

    pub fn from_config(config: &QualityConfig) -> Self {
        Self::new(config.atmos_window(), config.atmos_bitrate_floor_kbps)
    }

    /// Coerce a freshly extracted fact into canonical form.
    pub fn normalize(&self, fact: AudioFormatFact) -> AudioFormatFact {
        let mut fact = fact;
        if !(fact.sample_rate.is_finite() && fact.sample_rate > 0.0) {
            fact.sample_rate = UNKNOWN_RATE;
        }
        if fact.bit_depth <= 0 {
            fact.bit_depth = UNKNOWN;
        }
        if fact.bit_rate <= 0 {
            fact.bit_rate = UNKNOWN;
        }

        if fact.has_bit_rate() && fact.codec != Codec::Atmos {
            fact.codec = Codec::Aac;
        }
        if fact.codec == Codec::Atmos && fact.bit_rate < self.atmos_bitrate_floor {
            fact.bit_rate = self.atmos_bitrate_floor;
        }
        fact
    }

    /// Whether `fact` was observed close enough to the epoch start to trust an atmos hint.
    ///
    /// Entries from the lookback (before the start) count as inside.
    pub fn within_atmos_window(&self, fact: &AudioFormatFact, epoch_start: DateTime<Utc>) -> bool {
        fact.observed_at.signed_duration_since(epoch_start) < self.atmos_window
    }

    /// Fold `candidate` into `current`.
    ///
    /// `candidate` must already be normalized. With no accumulated fact the
    /// candidate is folded onto an all-unknown seed, so the same precedence
    /// and window rules apply to the first fact of an epoch.
    pub fn merge(
        &self,
        current: Option<&AudioFormatFact>,
        candidate: &AudioFormatFact,
        epoch_start: DateTime<Utc>,
    ) -> AudioFormatFact {
        let mut merged = match current {
            Some(acc) => acc.clone(),
            None => AudioFormatFact::unknown(candidate.source, candidate.observed_at),
        };

        let atmos_accepted =
            candidate.codec == Codec::Atmos && self.within_atmos_window(candidate, epoch_start);

        match candidate.source {
            SourceKind::Decoder => {
                merged.sample_rate = candidate.sample_rate;
                merged.bit_depth = candidate.bit_depth;
                merged.bit_rate = candidate.bit_rate;
                merged.codec = if atmos_accepted {
                    Codec::Atmos
                } else {
                    Codec::Lossless
                };
                merged.source = SourceKind::Decoder;
            }
            SourceKind::MediaPipeline => {
                let keep_depth =
                    merged.source == SourceKind::CompanionApp && merged.has_bit_depth();
                if !keep_depth {
                    merged.bit_depth = candidate.bit_depth;
                }
                merged.sample_rate = candidate.sample_rate;
                merged.bit_rate = candidate.bit_rate;
                // A late atmos claim leaves the previous classification alone
                if candidate.codec != Codec::Atmos || atmos_accepted {
                    merged.codec = candidate.codec;
                }
                merged.source = SourceKind::MediaPipeline;
            }
            SourceKind::CompanionApp => {
                if candidate.has_sample_rate() {
                    merged.sample_rate = candidate.sample_rate;
                }
                if candidate.has_bit_depth() {
                    merged.bit_depth = candidate.bit_depth;
                }
                // A rejected atmos hint also drops the bit rate floor it implied
                let takes_bit_rate = candidate.has_bit_rate()
                    && (candidate.codec != Codec::Atmos || atmos_accepted);
                if takes_bit_rate {
                    merged.bit_rate = candidate.bit_rate;
                }

                merged.codec = if atmos_accepted {
                    Codec::Atmos
                } else if takes_bit_rate {
                    Codec::Aac
                } else if merged.codec == Codec::Unknown && candidate.codec != Codec::Atmos {
                    candidate.codec
                } else {
                    merged.codec
                };
                // Gap-filling never takes over the accumulated source
            }
        }

        merged.observed_at = candidate.observed_at;
        merged
    }
}
