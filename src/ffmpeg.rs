use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// One input file plus the options that must precede its `-i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeInput {
    pub options: Vec<String>,
    pub source: String,
}

impl TranscodeInput {
    pub fn file(path: &std::path::Path) -> Self {
        Self {
            options: Vec::new(),
            source: path.display().to_string(),
        }
    }

    pub fn lavfi(graph: impl Into<String>) -> Self {
        Self {
            options: vec!["-f".to_string(), "lavfi".to_string()],
            source: graph.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputParams {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub size: Option<(u32, u32)>,
    pub fps: Option<u32>,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub pix_fmt: Option<String>,
    pub faststart: bool,
    pub extra: Vec<String>,
}

/// A single transcoder invocation: inputs, a filter graph with named pads,
/// stream maps and output parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub inputs: Vec<TranscodeInput>,
    pub filter_complex: Option<String>,
    pub maps: Vec<String>,
    pub output: OutputParams,
    pub output_path: PathBuf,
}

impl TranscodeJob {
    /// ffmpeg argument vector, without the binary and global flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for input in &self.inputs {
            args.extend(input.options.iter().cloned());
            args.push("-i".to_string());
            args.push(input.source.clone());
        }
        if let Some(graph) = &self.filter_complex {
            args.push("-filter_complex".to_string());
            args.push(graph.clone());
        }
        for map in &self.maps {
            args.push("-map".to_string());
            args.push(map.clone());
        }

        let out = &self.output;
        let mut push_opt = |flag: &str, value: &Option<String>| {
            if let Some(v) = value {
                args.push(flag.to_string());
                args.push(v.clone());
            }
        };
        push_opt("-c:v", &out.video_codec);
        push_opt("-c:a", &out.audio_codec);
        push_opt("-s", &out.size.map(|(w, h)| format!("{}x{}", w, h)));
        push_opt("-r", &out.fps.map(|f| f.to_string()));
        push_opt("-b:v", &out.video_bitrate);
        push_opt("-b:a", &out.audio_bitrate);
        push_opt("-pix_fmt", &out.pix_fmt);
        if out.faststart {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }
        args.extend(out.extra.iter().cloned());
        args.push(self.output_path.display().to_string());
        args
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn execute(&self, job: &TranscodeJob) -> Result<()>;
}

pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

async fn run_cmd(binary: &str, args: &[String]) -> Result<()> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .with_context(|| format!("{} execution failed", binary))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(anyhow::anyhow!("{} exited with {}: {}", binary, output.status, tail));
    }

    Ok(())
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn execute(&self, job: &TranscodeJob) -> Result<()> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(job.to_args());
        tracing::debug!(binary = %self.binary, ?args, "transcode");

        run_cmd(&self.binary, &args).await?;
        if !job.output_path.exists() {
            anyhow::bail!("{} produced no output at {}", self.binary, job.output_path.display());
        }
        Ok(())
    }
}

fn escape_chars(value: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if specials.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Escapes a filter option value placed inside a filtergraph. The value is
/// unescaped twice, first by the graph parser and then by the option parser,
/// so it is escaped once per level.
pub fn escape_filter_value(value: &str) -> String {
    let option_level = escape_chars(value, &['\\', ':', '\'']);
    escape_chars(&option_level, &['\\', '\'', '[', ']', ',', ';'])
}
