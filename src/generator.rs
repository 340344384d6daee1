use crate::api::fal::FalQueueClient;
use crate::api::fetch::HttpMediaFetcher;
use crate::api::{GenerationService, MediaFetcher};
use crate::compositor::{self, Compositor, RunScratch};
use crate::config::Config;
use crate::ffmpeg::{FfmpegTranscoder, Transcoder};
use crate::job::{self, GenerationResult, SegmentJobRunner};
use crate::manifest::{CompositionManifest, OutputDescriptor};
use crate::overlay::{CardLayout, ChromiumRasterizer, MarkupRasterizer, OverlayRenderer};
use crate::timeline::Timeline;
use crate::{init, logi, logok, logw};
use anyhow::{Context, Result};
use chrono::Local;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use walkdir::WalkDir;

/// `<YYYYMMDDTHHMMSS>_<6 hex digits>`
pub fn new_run_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}_{:06x}", Local::now().format("%Y%m%dT%H%M%S"), suffix)
}

async fn clear_directory(dir_path: &Path) -> Result<()> {
    if !fs::try_exists(dir_path).await.unwrap_or(false) {
        return Ok(());
    }

    for entry in WalkDir::new(dir_path).contents_first(true) {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            fs::remove_dir(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
    }

    Ok(())
}

/// Outcome of one run. Carries the manifest even when nothing was built.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub manifest: CompositionManifest,
    pub jobs: Vec<GenerationResult>,
}

impl RunReport {
    pub fn output(&self) -> &OutputDescriptor {
        &self.manifest.output
    }

    pub fn success(&self) -> bool {
        self.manifest.output.success
    }
}

pub struct Pipeline {
    cfg: Config,
    service: Arc<dyn GenerationService>,
    fetcher: Arc<dyn MediaFetcher>,
    rasterizer: Arc<dyn MarkupRasterizer>,
    transcoder: Arc<dyn Transcoder>,
}

impl Pipeline {
    pub fn new(
        cfg: Config,
        service: Arc<dyn GenerationService>,
        fetcher: Arc<dyn MediaFetcher>,
        rasterizer: Arc<dyn MarkupRasterizer>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            cfg,
            service,
            fetcher,
            rasterizer,
            transcoder,
        }
    }

    /// Production bindings: fal.ai queue, reqwest downloads, headless
    /// Chromium and the ffmpeg binary.
    pub fn from_config(cfg: Config) -> Self {
        let client = reqwest::Client::new();
        let service = Arc::new(FalQueueClient::new(
            client.clone(),
            cfg.fal_key.clone(),
            cfg.fal_queue_base.clone(),
        ));
        let fetcher = Arc::new(HttpMediaFetcher::new(client));
        let rasterizer = Arc::new(ChromiumRasterizer::new(cfg.overlay.chromium_binary.clone()));
        let transcoder = Arc::new(FfmpegTranscoder::default());
        Self::new(cfg, service, fetcher, rasterizer, transcoder)
    }

    fn failed(manifest: CompositionManifest, jobs: Vec<GenerationResult>, error: String) -> RunReport {
        logw(&error);
        let output = OutputDescriptor::failed(&manifest.run_id, error);
        RunReport {
            manifest: CompositionManifest { output, ..manifest },
            jobs,
        }
    }

    /// Generates, renders and composes one video. Never returns an error:
    /// every failure ends up in the report's output descriptor.
    pub async fn run(&self, timeline: &Timeline) -> RunReport {
        let run_id = new_run_id();
        let scratch = RunScratch::new(&self.cfg.paths.scratch_dir, &run_id);
        logi(format!(
            "Run {}: {} segments, {} cues",
            run_id,
            timeline.segments.len(),
            timeline.cues.len()
        ));

        if let Err(e) = scratch.create().await {
            let empty = CompositionManifest::assemble(&run_id, &[], vec![], vec![], self.cfg.overlay.window_seconds);
            return Self::failed(empty, vec![], format!("creating scratch {}: {}", scratch.root().display(), e));
        }

        let runner = Arc::new(SegmentJobRunner::new(
            self.service.clone(),
            self.fetcher.clone(),
            &self.cfg,
            scratch.clips_dir(),
        ));
        let jobs = runner.run_all(&timeline.segments).await;
        let summary = job::summarize(&jobs);
        logi(format!(
            "Clips: {}/{} succeeded, {} failed, {:.1}s total",
            summary.succeeded, summary.total, summary.failed, summary.total_duration
        ));

        if !jobs.iter().any(|j| j.success) {
            let manifest = CompositionManifest::assemble(
                &run_id,
                &jobs,
                vec![],
                timeline.cues.clone(),
                self.cfg.overlay.window_seconds,
            );
            return Self::failed(manifest, jobs, "no segment produced a clip".to_string());
        }

        let renderer = OverlayRenderer::new(
            self.rasterizer.clone(),
            CardLayout::from_config(&self.cfg),
            scratch.overlays_dir(),
        );
        let mut cards = Vec::new();
        for segment in &timeline.segments {
            cards.extend(renderer.render_all(segment).await);
        }
        logi(format!("Rendered {} overlay cards", cards.len()));

        let mut manifest = CompositionManifest::assemble(
            &run_id,
            &jobs,
            cards,
            timeline.cues.clone(),
            self.cfg.overlay.window_seconds,
        );

        manifest.background_music =
            compositor::resolve_background_music(self.cfg.audio.background_music.as_deref()).await;

        let compositor = Compositor::new(self.transcoder.clone(), &self.cfg);
        match compositor.compose(&manifest, &scratch).await {
            Ok(path) => {
                manifest.output = OutputDescriptor {
                    id: run_id.clone(),
                    path,
                    duration: manifest.total_duration(),
                    width: self.cfg.video.width,
                    height: self.cfg.video.height,
                    success: true,
                    error: None,
                };
                if let Err(e) = clear_directory(scratch.root()).await {
                    logw(format!("Could not clean scratch {}: {:#}", scratch.root().display(), e));
                }
                logok(format!(
                    "Run {} complete: {} ({:.1}s)",
                    run_id,
                    manifest.output.path.display(),
                    manifest.output.duration
                ));
                RunReport { manifest, jobs }
            }
            Err(e) => {
                logw(format!("Scratch kept for inspection: {}", scratch.root().display()));
                Self::failed(manifest, jobs, e.to_string())
            }
        }
    }
}

/// Loads configuration and timeline, runs the pipeline and returns the
/// process exit code.
pub async fn run_generation(config_path: &Path, timeline_path: &Path) -> Result<i32> {
    let cfg = Config::load(config_path).await?;
    init::ensure_directories(&cfg).await?;
    if !init::check_ffmpeg().await {
        logw("ffmpeg not found on PATH; composition will fail");
    }

    let timeline = Timeline::load(timeline_path)
        .await
        .with_context(|| format!("loading timeline {}", timeline_path.display()))?;

    let report = Pipeline::from_config(cfg).run(&timeline).await;
    match serde_json::to_string_pretty(report.output()) {
        Ok(json) => println!("{}", json),
        Err(e) => logw(format!("Could not serialize output descriptor: {}", e)),
    }

    Ok(if report.success() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_stamped_and_distinct() {
        let a = new_run_id();
        let b = new_run_id();
        let (stamp, hex) = a.split_once('_').unwrap();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "T");
        assert_eq!(hex.len(), 6);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn clear_directory_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        fs::create_dir_all(root.join("clips/nested")).await.unwrap();
        fs::write(root.join("clips/nested/a.mp4"), b"x").await.unwrap();
        fs::write(root.join("b.srt"), b"x").await.unwrap();

        clear_directory(&root).await.unwrap();
        assert!(!root.exists());
        clear_directory(&root).await.unwrap();
    }
}
