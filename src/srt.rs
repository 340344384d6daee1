use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// One subtitle entry. Timestamps use the SRT `HH:MM:SS,mmm` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCue {
    pub id: u32,
    #[serde(rename = "start_time")]
    pub start: String,
    #[serde(rename = "end_time")]
    pub end: String,
    pub text: String,
}

/// Parses `HH:MM:SS,mmm` into milliseconds.
pub fn timestamp_to_millis(ts: &str) -> Option<u64> {
    let (clock, ms) = ts.trim().split_once(',')?;
    let mut parts = clock.split(':');
    let hh: u64 = parts.next()?.parse().ok()?;
    let mm: u64 = parts.next()?.parse().ok()?;
    let ss: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || mm >= 60 || ss >= 60 || ms.len() != 3 {
        return None;
    }
    let ms: u64 = ms.parse().ok()?;
    Some(((hh * 3600 + mm * 60 + ss) * 1000) + ms)
}

pub fn millis_to_timestamp(total_ms: u64) -> String {
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_s / 3600,
        (total_s / 60) % 60,
        total_s % 60,
        ms
    )
}

impl SubtitleCue {
    pub fn start_millis(&self) -> Option<u64> {
        timestamp_to_millis(&self.start)
    }

    pub fn end_millis(&self) -> Option<u64> {
        timestamp_to_millis(&self.end)
    }
}

/// Serializes cues into an SRT document. An empty list yields an empty
/// document.
pub fn render_srt(cues: &[SubtitleCue]) -> String {
    cues.iter()
        .map(|cue| format!("{}\n{} --> {}\n{}\n", cue.id, cue.start, cue.end, cue.text))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn write_srt(cues: &[SubtitleCue], out_srt: &Path) -> Result<()> {
    let mut out = fs::File::create(out_srt)
        .await
        .with_context(|| format!("create srt output: {}", out_srt.display()))?;
    out.write_all(render_srt(cues).as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
