//! Per-source pattern rules turning free-text log entries into audio facts.
//!
//! Extraction is tolerant: a missing marker or a numeric payload that fails
//! to parse yields `None` for that entry, never an error.

use tunewatch_config::SourcesConfig;

use crate::events::LogEntry;
use crate::model::{AudioFormatFact, Codec, SourceKind, UNKNOWN, UNKNOWN_RATE};

/// Markers that must all be present in a decoder line.
const DECODER_MARKERS: &[&str] = &["ACAppleLosslessDecoder", "Input format:"];

/// Marker of a media pipeline line announcing a new output queue.
const PIPELINE_MARKER: &str = "Creating AudioQueue";

/// Four-char format id of spatial (atmos) streams.
const ATMOS_FORMAT_ID: &str = "qc+3";

/// Phrases in companion app lines that indicate a spatial/atmos rendition.
const ATMOS_MARKERS: &[&str] = &[
    "Dolby Atmos",
    "is Atmos",
    "is binaural",
    "original is Atmos",
    "play> select> select CMPlayer for spatial",
    "spatialAudio = enabled",
];

/// Text strictly between the first `start` and the next `end` after it.
pub fn between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let rest = &haystack[from..];
    let to = rest.find(end)?;
    Some(&rest[..to])
}

/// Text after the first `start`, up to the end of the string.
pub fn after<'a>(haystack: &'a str, start: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    Some(&haystack[from..])
}

fn parse_f64(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_i32(s: &str) -> Option<i32> {
    s.trim().parse::<i32>().ok()
}

/// Maps subsystem identifiers to source kinds and applies the matching rule.
#[derive(Debug, Clone)]
pub struct FactExtractor {
    decoder: String,
    companion_app: String,
    media_pipeline: String,
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new(&SourcesConfig::default())
    }
}

impl FactExtractor {
    pub fn new(sources: &SourcesConfig) -> Self {
        Self {
            decoder: sources.decoder.clone(),
            companion_app: sources.companion_app.clone(),
            media_pipeline: sources.media_pipeline.clone(),
        }
    }

    /// Subsystem identifiers this extractor understands.
    pub fn subsystems(&self) -> Vec<String> {
        vec![
            self.decoder.clone(),
            self.companion_app.clone(),
            self.media_pipeline.clone(),
        ]
    }

    pub fn source_kind(&self, subsystem: &str) -> Option<SourceKind> {
        if subsystem == self.decoder {
            Some(SourceKind::Decoder)
        } else if subsystem == self.companion_app {
            Some(SourceKind::CompanionApp)
        } else if subsystem == self.media_pipeline {
            Some(SourceKind::MediaPipeline)
        } else {
            None
        }
    }

    /// Extract a fact from one entry, or `None` on a miss.
    ///
    /// The result is not normalized yet; see [`crate::merge::FactMerger::normalize`].
    pub fn extract(&self, entry: &LogEntry) -> Option<AudioFormatFact> {
        match self.source_kind(&entry.subsystem)? {
            SourceKind::Decoder => extract_decoder(entry),
            SourceKind::CompanionApp => extract_companion_app(entry),
            SourceKind::MediaPipeline => extract_media_pipeline(entry),
        }
    }
}

/// `... Input format: 2ch, 96000 Hz, 'alac' ... from 24-bit source`
fn extract_decoder(entry: &LogEntry) -> Option<AudioFormatFact> {
    let msg = entry.message.as_str();
    if !DECODER_MARKERS.iter().all(|m| msg.contains(m)) {
        return None;
    }

    let sample_rate = between(msg, "ch, ", " Hz").and_then(parse_f64)?;
    let bit_depth = between(msg, "from ", "-bit source").and_then(parse_i32)?;

    Some(AudioFormatFact {
        sample_rate,
        bit_depth,
        bit_rate: UNKNOWN,
        codec: Codec::Lossless,
        source: SourceKind::Decoder,
        observed_at: entry.timestamp,
    })
}

/// Companion app lines carry any subset of rate, depth, bit rate and an atmos hint.
fn extract_companion_app(entry: &LogEntry) -> Option<AudioFormatFact> {
    let msg = entry.message.as_str();

    let sample_rate = between(msg, "asbdSampleRate = ", " kHz")
        .and_then(parse_f64)
        .map(|khz| khz * 1000.0);
    let bit_depth = between(msg, "sdBitDepth = ", " bit").and_then(parse_i32);
    let bit_rate = between(msg, "sdBitRate = ", " kbps").and_then(parse_i32);

    let atmos = between(msg, "asbdFormatID = ", ", sdFormatID")
        .map(|id| id.trim() == ATMOS_FORMAT_ID)
        .unwrap_or(false)
        || ATMOS_MARKERS.iter().any(|m| msg.contains(m));

    if sample_rate.is_none() && bit_depth.is_none() && bit_rate.is_none() && !atmos {
        return None;
    }

    let codec = if atmos {
        Codec::Atmos
    } else if bit_rate.is_some() {
        Codec::Aac
    } else if bit_depth.is_some() {
        Codec::Lossless
    } else {
        Codec::Unknown
    };

    Some(AudioFormatFact {
        sample_rate: sample_rate.unwrap_or(UNKNOWN_RATE),
        bit_depth: bit_depth.unwrap_or(UNKNOWN),
        bit_rate: bit_rate.unwrap_or(UNKNOWN),
        codec,
        source: SourceKind::CompanionApp,
        observed_at: entry.timestamp,
    })
}

/// `Creating AudioQueue ... format:'qlac' ... sampleRate:44100`
fn extract_media_pipeline(entry: &LogEntry) -> Option<AudioFormatFact> {
    let msg = entry.message.as_str();
    if !msg.contains(PIPELINE_MARKER) {
        return None;
    }

    let raw_rate = after(msg, "sampleRate:")?
        .split(|c: char| c.is_whitespace() || c == ',')
        .find(|s| !s.is_empty())?;
    let sample_rate = parse_f64(raw_rate)?;

    // The pipeline does not log the depth; CD rate streams are 16-bit
    let bit_depth = if sample_rate == 44100.0 { 16 } else { 24 };

    let (codec, bit_rate) = match between(msg, "format:'", "'") {
        Some(ATMOS_FORMAT_ID) => (Codec::Atmos, 768),
        Some("qaac") => (Codec::Aac, 256),
        _ => (Codec::Lossless, UNKNOWN),
    };

    Some(AudioFormatFact {
        sample_rate,
        bit_depth,
        bit_rate,
        codec,
        source: SourceKind::MediaPipeline,
        observed_at: entry.timestamp,
    })
}
