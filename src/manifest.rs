use crate::job::GenerationResult;
use crate::overlay::{CardKind, RenderedCard};
use crate::srt::SubtitleCue;
use serde::Serialize;
use std::path::PathBuf;

/// Half-open display interval `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayWindow {
    pub start: f64,
    pub end: f64,
}

impl DisplayWindow {
    /// Slot `k` occupies `[k*W, (k+1)*W)`.
    pub fn for_slot(slot: usize, window_seconds: f64) -> Self {
        Self {
            start: slot as f64 * window_seconds,
            end: (slot + 1) as f64 * window_seconds,
        }
    }

    pub fn overlaps(&self, other: &DisplayWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipEntry {
    pub segment_ordinal: usize,
    pub segment_id: String,
    pub path: PathBuf,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayAsset {
    pub segment_ordinal: usize,
    pub segment_id: String,
    pub kind: CardKind,
    pub card_id: String,
    pub image_path: PathBuf,
    pub window: DisplayWindow,
}

/// Final artifact description. `path` is empty unless `success`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDescriptor {
    pub id: String,
    pub path: PathBuf,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl OutputDescriptor {
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            path: PathBuf::new(),
            duration: 0.0,
            width: 0,
            height: 0,
            success: false,
            error: None,
        }
    }

    pub fn failed(id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::pending(id)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositionManifest {
    pub run_id: String,
    pub clips: Vec<ClipEntry>,
    pub overlays: Vec<OverlayAsset>,
    pub cues: Vec<SubtitleCue>,
    pub background_music: Option<PathBuf>,
    pub output: OutputDescriptor,
}

impl CompositionManifest {
    /// Keeps successful clips only, in ordinal order, and places every
    /// rendered card on consecutive fixed-length slots.
    pub fn assemble(
        run_id: &str,
        results: &[GenerationResult],
        mut cards: Vec<RenderedCard>,
        cues: Vec<SubtitleCue>,
        window_seconds: f64,
    ) -> Self {
        let mut clips: Vec<ClipEntry> = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| {
                r.video_path.as_ref().map(|path| ClipEntry {
                    segment_ordinal: r.segment_ordinal,
                    segment_id: r.segment_id.clone(),
                    path: path.clone(),
                    duration: r.duration,
                })
            })
            .collect();
        clips.sort_by_key(|c| c.segment_ordinal);

        // stable: card order within a segment is kept
        cards.sort_by_key(|c| c.segment_ordinal);
        let overlays = cards
            .into_iter()
            .enumerate()
            .map(|(slot, card)| OverlayAsset {
                segment_ordinal: card.segment_ordinal,
                segment_id: card.segment_id,
                kind: card.kind,
                card_id: card.card_id,
                image_path: card.image_path,
                window: DisplayWindow::for_slot(slot, window_seconds),
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            clips,
            overlays,
            cues,
            background_music: None,
            output: OutputDescriptor::pending(run_id),
        }
    }

    pub fn has_clips(&self) -> bool {
        !self.clips.is_empty()
    }

    pub fn total_duration(&self) -> f64 {
        self.clips.iter().map(|c| c.duration).sum()
    }

    pub fn clip_order(&self) -> Vec<usize> {
        self.clips.iter().map(|c| c.segment_ordinal).collect()
    }
}
