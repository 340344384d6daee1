use crate::config::Config;
use crate::logi;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// Creates the scratch and output roots.
pub async fn ensure_directories(cfg: &Config) -> Result<()> {
    let dirs = [cfg.paths.scratch_dir.as_path(), cfg.paths.output_dir.as_path()];
    for dir in dirs {
        create_if_missing(dir).await?;
    }
    Ok(())
}

async fn create_if_missing(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        logi(format!("Created directory: {}", dir.display()));
    }
    Ok(())
}

pub async fn check_ffmpeg() -> bool {
    match tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
