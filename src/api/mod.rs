//! Capabilities the pipeline needs from the outside world: a generative
//! video service and a media fetcher. Job logic only sees these traits.

pub mod fal;
pub mod fetch;

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to submit one generation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    #[serde(skip)]
    pub model: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration: f64,
    #[serde(rename = "image_url", skip_serializing_if = "Option::is_none")]
    pub seed_image_url: Option<String>,
}

/// Opaque reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub request_id: String,
    pub status_url: String,
    pub response_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Completed { result_url: String },
    Failed { error: String },
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ServiceError>;
    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, ServiceError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads `url` into `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ServiceError>;
}
