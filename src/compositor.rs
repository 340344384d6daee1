use crate::config::{AudioSettings, Config, SubtitleStyle, VideoSettings};
use crate::error::{CompositionError, Pass};
use crate::ffmpeg::{self, OutputParams, TranscodeInput, TranscodeJob, Transcoder};
use crate::manifest::{ClipEntry, CompositionManifest, OverlayAsset};
use crate::srt;
use crate::{logi, logok, logw};
use chrono::{DateTime, Local};
use rand::seq::SliceRandom;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

const SILENT_BED: &str = "anullsrc=channel_layout=stereo:sample_rate=44100";

/// Per-run scratch storage. Every path handed out lives under `root`.
#[derive(Debug, Clone)]
pub struct RunScratch {
    run_id: String,
    root: PathBuf,
}

impl RunScratch {
    pub fn new(scratch_dir: &Path, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            root: scratch_dir.join(run_id),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.root.join("clips")
    }

    pub fn overlays_dir(&self) -> PathBuf {
        self.root.join("overlays")
    }

    pub fn pass_output(&self, pass: Pass) -> PathBuf {
        self.root.join(format!("{}_{}.mp4", self.run_id, pass))
    }

    pub fn subtitle_path(&self) -> PathBuf {
        self.root.join(format!("{}_subtitles.srt", self.run_id))
    }

    /// Fails if the run root already exists, so two runs never share it.
    pub async fn create(&self) -> std::io::Result<()> {
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir(&self.root).await?;
        fs::create_dir(self.clips_dir()).await?;
        fs::create_dir(self.overlays_dir()).await
    }
}

fn video_output(video: &VideoSettings, audio_codec: Option<&str>, audio_bitrate: Option<&str>) -> OutputParams {
    OutputParams {
        video_codec: Some("libx264".to_string()),
        audio_codec: audio_codec.map(str::to_string),
        size: Some((video.width, video.height)),
        fps: Some(video.fps),
        video_bitrate: Some(video.bitrate.clone()),
        audio_bitrate: audio_bitrate.map(str::to_string),
        pix_fmt: Some("yuv420p".to_string()),
        faststart: true,
        extra: Vec::new(),
    }
}

/// Per-input normalization followed by a video-only concat into `[outv]`.
pub fn concat_filter(clip_count: usize, video: &VideoSettings) -> String {
    let (w, h, fps) = (video.width, video.height, video.fps);
    let mut chains: Vec<String> = (0..clip_count)
        .map(|i| {
            format!(
                "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
                 pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1,fps={fps}[v{i}]"
            )
        })
        .collect();
    let pads: String = (0..clip_count).map(|i| format!("[v{}]", i)).collect();
    chains.push(format!("{}concat=n={}:v=1:a=0[outv]", pads, clip_count));
    chains.join(";")
}

pub fn concat_job(clips: &[ClipEntry], video: &VideoSettings, output: PathBuf) -> TranscodeJob {
    let mut inputs: Vec<TranscodeInput> = clips.iter().map(|c| TranscodeInput::file(&c.path)).collect();
    inputs.push(TranscodeInput::lavfi(SILENT_BED));

    let mut params = video_output(video, Some("aac"), None);
    params.extra.push("-shortest".to_string());

    TranscodeJob {
        inputs,
        filter_complex: Some(concat_filter(clips.len(), video)),
        maps: vec!["[outv]".to_string(), format!("{}:a", clips.len())],
        output: params,
        output_path: output,
    }
}

/// Full-frame overlays, each enabled only inside its half-open window.
pub fn overlay_filter(overlays: &[OverlayAsset], video: &VideoSettings) -> String {
    let last = overlays.len().saturating_sub(1);
    overlays
        .iter()
        .enumerate()
        .map(|(i, asset)| {
            let source = if i == 0 {
                "[0:v]".to_string()
            } else {
                format!("[tmp{}]", i - 1)
            };
            let sink = if i == last {
                "[outv]".to_string()
            } else {
                format!("[tmp{}]", i)
            };
            format!(
                "[{input}:v]scale={w}:{h}[ov{i}];{source}[ov{i}]overlay=0:0:enable='gte(t,{start})*lt(t,{end})'{sink}",
                input = i + 1,
                w = video.width,
                h = video.height,
                start = asset.window.start,
                end = asset.window.end,
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn overlay_job(input: &Path, overlays: &[OverlayAsset], video: &VideoSettings, output: PathBuf) -> TranscodeJob {
    let mut inputs = vec![TranscodeInput::file(input)];
    inputs.extend(overlays.iter().map(|o| TranscodeInput::file(&o.image_path)));

    TranscodeJob {
        inputs,
        filter_complex: Some(overlay_filter(overlays, video)),
        maps: vec!["[outv]".to_string(), "0:a".to_string()],
        output: OutputParams {
            audio_codec: Some("copy".to_string()),
            ..video_output(video, None, None)
        },
        output_path: output,
    }
}

pub fn subtitle_filter(srt_path: &Path, style: &SubtitleStyle) -> String {
    format!(
        "[0:v]subtitles=filename={}:force_style='FontSize={},PrimaryColour=&H{},BackColour=&H{},BorderStyle=4,MarginV={}'[outv]",
        ffmpeg::escape_filter_value(&srt_path.display().to_string()),
        style.font_size,
        style.primary_colour,
        style.back_colour,
        style.margin_v,
    )
}

pub fn subtitle_job(input: &Path, srt_path: &Path, style: &SubtitleStyle, video: &VideoSettings, output: PathBuf) -> TranscodeJob {
    TranscodeJob {
        inputs: vec![TranscodeInput::file(input)],
        filter_complex: Some(subtitle_filter(srt_path, style)),
        maps: vec!["[outv]".to_string(), "0:a".to_string()],
        output: OutputParams {
            audio_codec: Some("copy".to_string()),
            ..video_output(video, None, None)
        },
        output_path: output,
    }
}

/// Music under the existing track; the video's audio decides the length.
pub fn music_mix_filter(gain_db: f64) -> String {
    format!(
        "[1:a]volume={}dB[bgm];[0:a][bgm]amix=inputs=2:duration=first:dropout_transition=2[aout]",
        gain_db
    )
}

pub fn finalize_job(
    input: &Path,
    music: Option<&Path>,
    video: &VideoSettings,
    audio: &AudioSettings,
    output: PathBuf,
) -> TranscodeJob {
    let mut params = video_output(video, Some("aac"), Some(&audio.audio_bitrate));
    params.extra.extend(["-preset".to_string(), "fast".to_string()]);

    match music {
        Some(track) => TranscodeJob {
            inputs: vec![TranscodeInput::file(input), TranscodeInput::file(track)],
            filter_complex: Some(music_mix_filter(audio.music_gain_db)),
            maps: vec!["0:v".to_string(), "[aout]".to_string()],
            output: params,
            output_path: output,
        },
        None => TranscodeJob {
            inputs: vec![TranscodeInput::file(input)],
            filter_complex: None,
            maps: vec!["0:v".to_string(), "0:a".to_string()],
            output: params,
            output_path: output,
        },
    }
}

pub fn output_file_name(now: DateTime<Local>, suffix: u32) -> String {
    let stamp = now.format("%Y%m%dT%H%M%S");
    if suffix == 0 {
        format!("shorts_{}.mp4", stamp)
    } else {
        format!("shorts_{}_{}.mp4", stamp, suffix)
    }
}

/// Claims the first free `shorts_<stamp>[_n].mp4` in `dir` by creating it
/// exclusively. The returned path is an empty placeholder owned by the caller.
pub async fn reserve_output_path(dir: &Path, now: DateTime<Local>) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let mut suffix = 0;
    loop {
        let candidate = dir.join(output_file_name(now, suffix));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}

async fn list_files_with_ext(dir: &Path, exts: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(ext) = path.extension().and_then(OsStr::to_str) {
            if exts.contains(&ext.to_ascii_lowercase().as_str()) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// A configured file is used as is; a directory yields one random
/// `.mp3`/`.m4a` track. Anything else means no music.
pub async fn resolve_background_music(configured: Option<&Path>) -> Option<PathBuf> {
    let path = configured?;
    let meta = fs::metadata(path).await.ok()?;
    if meta.is_file() {
        return Some(path.to_path_buf());
    }
    if !meta.is_dir() {
        return None;
    }

    match list_files_with_ext(path, &["mp3", "m4a"]).await {
        Ok(tracks) => tracks.choose(&mut rand::thread_rng()).cloned(),
        Err(e) => {
            logw(format!("Could not list music directory {}: {}", path.display(), e));
            None
        }
    }
}

/// Replaces the reserved placeholder at `to` with `from`.
async fn move_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

pub struct Compositor {
    transcoder: Arc<dyn Transcoder>,
    video: VideoSettings,
    subtitle: SubtitleStyle,
    audio: AudioSettings,
    output_dir: PathBuf,
}

impl Compositor {
    pub fn new(transcoder: Arc<dyn Transcoder>, cfg: &Config) -> Self {
        Self {
            transcoder,
            video: cfg.video.clone(),
            subtitle: cfg.subtitle.clone(),
            audio: cfg.audio.clone(),
            output_dir: cfg.paths.output_dir.clone(),
        }
    }

    async fn run_pass(&self, pass: Pass, job: TranscodeJob) -> Result<PathBuf, CompositionError> {
        logi(format!("Pass {} -> {}", pass, job.output_path.display()));
        self.transcoder
            .execute(&job)
            .await
            .map_err(|e| CompositionError::new(pass, format!("{:#}", e)))?;
        Ok(job.output_path)
    }

    pub async fn concatenate(&self, clips: &[ClipEntry], scratch: &RunScratch) -> Result<PathBuf, CompositionError> {
        if clips.is_empty() {
            return Err(CompositionError::new(Pass::Concatenate, "no clips to concatenate"));
        }
        let job = concat_job(clips, &self.video, scratch.pass_output(Pass::Concatenate));
        self.run_pass(Pass::Concatenate, job).await
    }

    pub async fn overlay(&self, input: &Path, overlays: &[OverlayAsset], scratch: &RunScratch) -> Result<PathBuf, CompositionError> {
        if overlays.is_empty() {
            logi("No overlays, skipping overlay pass");
            return Ok(input.to_path_buf());
        }
        let job = overlay_job(input, overlays, &self.video, scratch.pass_output(Pass::Overlay));
        self.run_pass(Pass::Overlay, job).await
    }

    pub async fn burn_subtitles(
        &self,
        input: &Path,
        cues: &[srt::SubtitleCue],
        scratch: &RunScratch,
    ) -> Result<PathBuf, CompositionError> {
        let srt_path = scratch.subtitle_path();
        srt::write_srt(cues, &srt_path)
            .await
            .map_err(|e| CompositionError::new(Pass::Subtitles, format!("{:#}", e)))?;

        let job = subtitle_job(input, &srt_path, &self.subtitle, &self.video, scratch.pass_output(Pass::Subtitles));
        self.run_pass(Pass::Subtitles, job).await
    }

    pub async fn finalize(&self, input: &Path, music: Option<&Path>, scratch: &RunScratch) -> Result<PathBuf, CompositionError> {
        match music {
            Some(track) => logi(format!("Mixing background music {}", track.display())),
            None => logi("No background music, re-encoding only"),
        }
        let job = finalize_job(input, music, &self.video, &self.audio, scratch.pass_output(Pass::Finalize));
        let staged = self.run_pass(Pass::Finalize, job).await?;

        let dest = reserve_output_path(&self.output_dir, Local::now())
            .await
            .map_err(|e| CompositionError::new(Pass::Finalize, format!("reserving output name: {}", e)))?;
        if let Err(e) = move_into_place(&staged, &dest).await {
            fs::remove_file(&dest).await.ok();
            return Err(CompositionError::new(Pass::Finalize, format!("moving output into place: {}", e)));
        }
        Ok(dest)
    }

    /// Runs all four passes in order and returns the final artifact path.
    pub async fn compose(&self, manifest: &CompositionManifest, scratch: &RunScratch) -> Result<PathBuf, CompositionError> {
        let joined = self.concatenate(&manifest.clips, scratch).await?;
        let overlaid = self.overlay(&joined, &manifest.overlays, scratch).await?;
        let subtitled = self.burn_subtitles(&overlaid, &manifest.cues, scratch).await?;
        let out = self
            .finalize(&subtitled, manifest.background_music.as_deref(), scratch)
            .await?;
        logok(format!("Final video: {}", out.display()));
        Ok(out)
    }
}
