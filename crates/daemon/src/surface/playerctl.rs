//! MPRIS control surface driven through the `playerctl` client.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{ControlSurface, RawFields, SurfaceError};
use crate::model::RepeatMode;
use crate::progress::parse_clock_time;

/// Tab separated metadata template, parsed by [`parse_metadata_line`].
pub const METADATA_FORMAT: &str = concat!(
    "{{status}}\t{{title}}\t{{artist}}\t{{album}}\t{{position}}\t",
    "{{mpris:length}}\t{{shuffle}}\t{{loop}}\t{{volume}}\t{{mpris:artUrl}}"
);

const FIELD_COUNT: usize = 10;

/// Control surface backed by the `playerctl` binary.
#[derive(Debug, Clone)]
pub struct PlayerctlSurface {
    player: Option<String>,
    timeout: Duration,
}

impl PlayerctlSurface {
    /// `player` selects one MPRIS player by name; `None` lets playerctl pick.
    pub fn new(player: Option<String>, timeout: Duration) -> Self {
        Self { player, timeout }
    }

    /// Full argument list for a playerctl subcommand.
    pub fn build_args(&self, subcommand: &[&str]) -> Vec<String> {
        let mut args = Vec::with_capacity(subcommand.len() + 2);
        if let Some(player) = &self.player {
            args.push("-p".to_string());
            args.push(player.clone());
        }
        args.extend(subcommand.iter().map(|s| s.to_string()));
        args
    }

    /// Run playerctl and return its stdout without the line terminator.
    async fn run(&self, subcommand: &[&str]) -> Result<String, SurfaceError> {
        let args = self.build_args(subcommand);
        let mut cmd = Command::new("playerctl");
        cmd.args(&args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SurfaceError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SurfaceError::PlayerUnavailable("playerctl not found in PATH".to_string())
                } else {
                    SurfaceError::Io(e)
                }
            })?;

        let stdout = stdout_text(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(&stderr));
        }

        debug!(args = ?args, "playerctl call succeeded");
        Ok(stdout)
    }
}

/// Strip trailing line terminators only: an empty last field is still a field.
fn stdout_text(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Map playerctl's stderr to an error kind.
fn classify_failure(stderr: &str) -> SurfaceError {
    if stderr.is_empty()
        || stderr.contains("No players found")
        || stderr.contains("No player could handle")
    {
        SurfaceError::PlayerUnavailable(if stderr.is_empty() {
            "no player answered".to_string()
        } else {
            stderr.to_string()
        })
    } else {
        SurfaceError::CommandFailed(stderr.to_string())
    }
}

/// MPRIS loop status to repeat mode.
pub fn parse_loop_status(s: &str) -> RepeatMode {
    match s.trim() {
        "Track" => RepeatMode::One,
        "Playlist" => RepeatMode::All,
        _ => RepeatMode::Off,
    }
}

pub fn loop_status(mode: RepeatMode) -> &'static str {
    match mode {
        RepeatMode::Off => "None",
        RepeatMode::All => "Playlist",
        RepeatMode::One => "Track",
    }
}

/// Microseconds (MPRIS) or `m:ss` text into seconds. Anything else is 0.
fn parse_seconds(s: &str) -> f64 {
    let s = s.trim();
    if s.contains(':') {
        return parse_clock_time(s).unwrap_or(0.0);
    }
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|micros| micros / 1_000_000.0)
        .unwrap_or(0.0)
}

/// Volume 0.0..=1.0 into 0..=100.
fn parse_volume(s: &str) -> u8 {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| (v * 100.0).round().clamp(0.0, 100.0) as u8)
        .unwrap_or(0)
}

/// Parse one line produced with [`METADATA_FORMAT`].
pub fn parse_metadata_line(line: &str) -> Option<RawFields> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != FIELD_COUNT {
        return None;
    }

    let art_url = Some(fields[9].trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(RawFields {
        is_playing: fields[0].trim() == "Playing",
        title: fields[1].trim().to_string(),
        artist: fields[2].trim().to_string(),
        album: fields[3].trim().to_string(),
        position: parse_seconds(fields[4]),
        duration: parse_seconds(fields[5]),
        shuffle: matches!(fields[6].trim(), "true" | "On" | "on"),
        repeat: parse_loop_status(fields[7]),
        volume: parse_volume(fields[8]),
        art_url,
    })
}

/// First metadata line of a `playerctl metadata` call.
fn fields_from_output(out: &str) -> Result<RawFields, SurfaceError> {
    let line = out.lines().next().unwrap_or_default();
    parse_metadata_line(line).ok_or_else(|| {
        SurfaceError::CommandFailed(format!("unexpected metadata line: {:?}", line))
    })
}

#[async_trait]
impl ControlSurface for PlayerctlSurface {
    async fn read_fields(&self) -> Result<RawFields, SurfaceError> {
        let out = self.run(&["metadata", "--format", METADATA_FORMAT]).await?;
        fields_from_output(&out)
    }

    async fn next(&self) -> Result<(), SurfaceError> {
        self.run(&["next"]).await.map(|_| ())
    }

    async fn previous(&self) -> Result<(), SurfaceError> {
        self.run(&["previous"]).await.map(|_| ())
    }

    async fn toggle_play_pause(&self) -> Result<(), SurfaceError> {
        self.run(&["play-pause"]).await.map(|_| ())
    }

    async fn set_shuffle(&self, enabled: bool) -> Result<(), SurfaceError> {
        let value = if enabled { "On" } else { "Off" };
        self.run(&["shuffle", value]).await.map(|_| ())
    }

    async fn cycle_repeat(&self) -> Result<(), SurfaceError> {
        let current = parse_loop_status(&self.run(&["loop"]).await?);
        self.run(&["loop", loop_status(current.next())])
            .await
            .map(|_| ())
    }

    async fn seek(&self, seconds: f64) -> Result<(), SurfaceError> {
        if !seconds.is_finite() {
            return Err(SurfaceError::CommandFailed(format!(
                "invalid seek target: {}",
                seconds
            )));
        }
        let target = format!("{:.3}", seconds.max(0.0));
        self.run(&["position", &target]).await.map(|_| ())
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SurfaceError> {
        let level = format!("{:.2}", f64::from(volume.min(100)) / 100.0);
        self.run(&["volume", &level]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_line() {
        let line = "Playing\tSong X\tArtist Y\tAlbum Z\t61500000\t245000000\ttrue\tPlaylist\t0.65\thttps://art/x.jpg";
        let fields = parse_metadata_line(line).expect("line should parse");

        assert!(fields.is_playing);
        assert_eq!(fields.title, "Song X");
        assert_eq!(fields.artist, "Artist Y");
        assert_eq!(fields.album, "Album Z");
        assert_eq!(fields.position, 61.5);
        assert_eq!(fields.duration, 245.0);
        assert!(fields.shuffle);
        assert_eq!(fields.repeat, RepeatMode::All);
        assert_eq!(fields.volume, 65);
        assert_eq!(fields.art_url.as_deref(), Some("https://art/x.jpg"));
    }

    #[test]
    fn test_parse_metadata_line_blank_fields() {
        let line = "Paused\t\t\t\t\t3:45\tfalse\tNone\t\t";
        let fields = parse_metadata_line(line).expect("line should parse");

        assert!(!fields.is_playing);
        assert!(fields.title.is_empty());
        assert_eq!(fields.position, 0.0);
        assert_eq!(fields.duration, 225.0);
        assert!(!fields.shuffle);
        assert_eq!(fields.repeat, RepeatMode::Off);
        assert_eq!(fields.volume, 0);
        assert_eq!(fields.art_url, None);
    }

    #[test]
    fn test_output_without_artwork_keeps_last_field() {
        let out = stdout_text(
            b"Playing\tSong X\tArtist Y\tAlbum Z\t1000000\t200000000\tfalse\tNone\t0.5\t\n",
        );
        let fields = fields_from_output(&out).expect("output should parse");

        assert!(fields.is_playing);
        assert_eq!(fields.title, "Song X");
        assert_eq!(fields.position, 1.0);
        assert_eq!(fields.duration, 200.0);
        assert_eq!(fields.volume, 50);
        assert_eq!(fields.art_url, None);

        let crlf = stdout_text(b"Paused\tSong X\t\t\t\t\tfalse\tTrack\t1.0\t\r\n");
        assert_eq!(fields_from_output(&crlf).unwrap().repeat, RepeatMode::One);
    }

    #[test]
    fn test_unparseable_output_is_command_failure() {
        assert!(matches!(
            fields_from_output(""),
            Err(SurfaceError::CommandFailed(_))
        ));
        assert!(matches!(
            fields_from_output(&stdout_text(b"Playing\tSong X\n")),
            Err(SurfaceError::CommandFailed(_))
        ));
    }

    #[test]
    fn test_parse_metadata_line_wrong_arity() {
        assert!(parse_metadata_line("Playing\tonly\tthree").is_none());
        assert!(parse_metadata_line("").is_none());
    }

    #[test]
    fn test_volume_is_clamped() {
        assert_eq!(parse_volume("1.7"), 100);
        assert_eq!(parse_volume("-0.2"), 0);
        assert_eq!(parse_volume("0.333"), 33);
    }

    #[test]
    fn test_loop_status_roundtrip() {
        for mode in [RepeatMode::Off, RepeatMode::All, RepeatMode::One] {
            assert_eq!(parse_loop_status(loop_status(mode)), mode);
        }
    }

    #[test]
    fn test_build_args_with_player() {
        let surface = PlayerctlSurface::new(Some("spotify".to_string()), Duration::from_secs(1));
        assert_eq!(surface.build_args(&["next"]), vec!["-p", "spotify", "next"]);

        let any = PlayerctlSurface::new(None, Duration::from_secs(1));
        assert_eq!(any.build_args(&["loop", "None"]), vec!["loop", "None"]);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("No players found"),
            SurfaceError::PlayerUnavailable(_)
        ));
        assert!(matches!(classify_failure(""), SurfaceError::PlayerUnavailable(_)));
        assert!(matches!(
            classify_failure("Could not execute command: Seek is not supported"),
            SurfaceError::CommandFailed(_)
        ));
    }
}
