use crate::srt::SubtitleCue;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// One content unit. `ordinal` is fixed upstream and drives ordering in
/// every later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub ordinal: usize,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub hook: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub call_to_action: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Target clip length in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Planner output: segments in final order plus the subtitle cues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub cues: Vec<SubtitleCue>,
}

impl Timeline {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut timeline: Timeline =
            serde_json::from_str(text).with_context(|| "Failed to parse timeline JSON")?;

        let mut seen = HashSet::new();
        for segment in &timeline.segments {
            if !seen.insert(segment.ordinal) {
                anyhow::bail!("timeline: duplicate segment ordinal {}", segment.ordinal);
            }
        }

        for cue in &timeline.cues {
            let (Some(start), Some(end)) = (cue.start_millis(), cue.end_millis()) else {
                anyhow::bail!("timeline: cue {} has a malformed timestamp", cue.id);
            };
            if end < start {
                anyhow::bail!("timeline: cue {} ends before it starts", cue.id);
            }
        }

        timeline.segments.sort_by_key(|s| s.ordinal);
        Ok(timeline)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read timeline: {}", path.as_ref().display()))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_segments_by_ordinal() {
        let timeline = Timeline::from_json(
            r#"{"segments":[
                {"ordinal":2,"id":"c","title":"C"},
                {"ordinal":0,"id":"a","title":"A","key_points":["x"],"image_url":"https://img/a.png"},
                {"ordinal":1,"id":"b","title":"B","duration":6.5}
            ]}"#,
        )
        .unwrap();

        let ids: Vec<_> = timeline.segments.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(timeline.segments[0].image_url.as_deref(), Some("https://img/a.png"));
        assert_eq!(timeline.segments[1].duration, Some(6.5));
        assert!(timeline.cues.is_empty());
    }

    #[test]
    fn rejects_duplicate_ordinals() {
        let err = Timeline::from_json(
            r#"{"segments":[{"ordinal":0,"id":"a","title":"A"},{"ordinal":0,"id":"b","title":"B"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_malformed_cue_timestamps() {
        let err = Timeline::from_json(
            r#"{"segments":[],"cues":[{"id":1,"start_time":"0:00","end_time":"00:00:01,000","text":"t"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn rejects_reversed_cue() {
        assert!(Timeline::from_json(
            r#"{"segments":[],"cues":[{"id":1,"start_time":"00:00:02,000","end_time":"00:00:01,000","text":"t"}]}"#,
        )
        .is_err());
    }
}
