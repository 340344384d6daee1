use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "fal_api_key")]
    #[serde(default)]
    pub fal_key: String,
    #[serde(default = "default_queue_base")]
    pub fal_queue_base: String,
    #[serde(default = "default_text_model")]
    pub text_to_video_model: String,
    #[serde(default = "default_image_model")]
    pub image_to_video_model: String,
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub overlay: OverlaySettings,
    #[serde(default)]
    pub subtitle: SubtitleStyle,
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub paths: PathSettings,
}

/// Canonical output format shared by generation requests, card canvases
/// and every compositor pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: String,
    /// Seconds requested per clip when a segment carries no target duration.
    pub default_clip_seconds: f64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 24,
            bitrate: "8M".to_string(),
            default_clip_seconds: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub concurrency: usize,
    pub prompt_max_chars: usize,
    /// Prepended to every prompt, e.g. a subject-area hint for the model.
    pub prompt_context: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 5_000,
            poll_interval_ms: 2_000,
            max_poll_attempts: 60,
            concurrency: 1,
            prompt_max_chars: 500,
            prompt_context: String::new(),
        }
    }
}

impl JobSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub window_seconds: f64,
    pub margin_top: u32,
    pub margin_bottom: u32,
    pub margin_left: u32,
    pub margin_right: u32,
    pub font_family: String,
    pub title_tagline: String,
    pub cta_button: String,
    pub chromium_binary: String,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            window_seconds: 8.0,
            margin_top: 100,
            margin_bottom: 150,
            margin_left: 60,
            margin_right: 60,
            font_family: "Noto Sans KR, Arial, sans-serif".to_string(),
            title_tagline: "Industry briefing".to_string(),
            cta_button: "Subscribe".to_string(),
            chromium_binary: "chromium".to_string(),
        }
    }
}

/// Burn-in style. Colours are ASS `&HAABBGGRR` hex without the prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleStyle {
    pub font_size: u32,
    pub primary_colour: String,
    pub back_colour: String,
    pub margin_v: u32,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_size: 32,
            primary_colour: "00FFFFFF".to_string(),
            back_colour: "4D000000".to_string(),
            margin_v: 192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// A single track, or a directory from which one `.mp3`/`.m4a` is picked.
    pub background_music: Option<PathBuf>,
    pub music_gain_db: f64,
    pub audio_bitrate: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            background_music: Some(PathBuf::from("assets/bgm.mp3")),
            music_gain_db: -15.0,
            audio_bitrate: "128k".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("out"),
        }
    }
}

fn default_queue_base() -> String {
    "https://queue.fal.run".to_string()
}

fn default_text_model() -> String {
    "fal-ai/hunyuan-video".to_string()
}

fn default_image_model() -> String {
    "fal-ai/veo3/fast/image-to-video".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fal_key: String::new(),
            fal_queue_base: default_queue_base(),
            text_to_video_model: default_text_model(),
            image_to_video_model: default_image_model(),
            video: VideoSettings::default(),
            jobs: JobSettings::default(),
            overlay: OverlaySettings::default(),
            subtitle: SubtitleStyle::default(),
            audio: AudioSettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let mut config = Self::from_json(&content)?;

        if config.fal_key.is_empty() {
            config.fal_key = std::env::var("FAL_KEY").unwrap_or_default();
        }
        if config.fal_key.is_empty() {
            anyhow::bail!("config.json: fal_api_key missing (and FAL_KEY not set)");
        }

        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.width == 0 || self.video.height == 0 {
            anyhow::bail!("config.json: video width/height must be non-zero");
        }
        if self.video.fps == 0 {
            anyhow::bail!("config.json: video fps must be non-zero");
        }
        if self.overlay.window_seconds <= 0.0 {
            anyhow::bail!("config.json: overlay.window_seconds must be positive");
        }
        if self.jobs.max_poll_attempts == 0 {
            anyhow::bail!("config.json: jobs.max_poll_attempts must be at least 1");
        }
        if self.jobs.concurrency == 0 {
            anyhow::bail!("config.json: jobs.concurrency must be at least 1");
        }
        let o = &self.overlay;
        match o.margin_left.checked_add(o.margin_right) {
            Some(m) if m < self.video.width => {}
            _ => anyhow::bail!("config.json: overlay left/right margins exceed canvas width"),
        }
        match o.margin_top.checked_add(o.margin_bottom) {
            Some(m) if m < self.video.height => {}
            _ => anyhow::bail!("config.json: overlay top/bottom margins exceed canvas height"),
        }
        Ok(())
    }
}
