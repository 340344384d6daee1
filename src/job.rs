//! Per-segment generation jobs: submit, poll, download, retry.

use crate::api::{GenerationRequest, GenerationService, JobHandle, MediaFetcher, PollStatus};
use crate::config::{Config, JobSettings, VideoSettings};
use crate::error::ServiceError;
use crate::timeline::Segment;
use crate::{logi, logok, logw};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Polling,
    Succeeded,
    Failed,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Polling => 1,
            JobState::Succeeded | JobState::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// One attempt at generating a segment's clip. State only moves forward;
/// a retry is a new `GenerationJob` for the same segment.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub segment_ordinal: usize,
    pub attempt: u32,
    handle: Option<JobHandle>,
    state: JobState,
    output: Option<PathBuf>,
    error: Option<String>,
}

impl GenerationJob {
    pub fn new(segment_ordinal: usize, attempt: u32) -> Self {
        Self {
            segment_ordinal,
            attempt,
            handle: None,
            state: JobState::Pending,
            output: None,
            error: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn output(&self) -> Option<&PathBuf> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn advance(&mut self, next: JobState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }

    pub fn start_polling(&mut self, handle: JobHandle) -> bool {
        if self.state != JobState::Pending || !self.advance(JobState::Polling) {
            return false;
        }
        self.handle = Some(handle);
        true
    }

    pub fn succeed(&mut self, output: PathBuf) -> bool {
        if self.state != JobState::Polling || !self.advance(JobState::Succeeded) {
            return false;
        }
        self.output = Some(output);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.advance(JobState::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }
}

/// Final outcome for one segment after all attempts.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub segment_ordinal: usize,
    pub segment_id: String,
    pub success: bool,
    pub attempts: u32,
    pub video_path: Option<PathBuf>,
    pub duration: f64,
    pub prompt: String,
    pub model: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_duration: f64,
}

pub fn summarize(results: &[GenerationResult]) -> ClipSummary {
    results.iter().fold(ClipSummary::default(), |mut acc, r| {
        acc.total += 1;
        if r.success {
            acc.succeeded += 1;
            acc.total_duration += r.duration;
        } else {
            acc.failed += 1;
        }
        acc
    })
}

/// Builds the generation prompt from segment content. Symbols become
/// spaces, whitespace collapses and the result is cut to `max_chars`.
pub fn build_prompt(segment: &Segment, context: &str, max_chars: usize) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(segment.key_points.len() + 3);
    parts.push(context);
    parts.push(&segment.hook);
    parts.extend(segment.key_points.iter().map(String::as_str));
    parts.push(&segment.call_to_action);

    let raw = parts.join(" ");
    let stripped = NON_WORD.replace_all(&raw, " ");
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, " ");
    collapsed.trim().chars().take(max_chars).collect()
}

pub struct SegmentJobRunner {
    service: Arc<dyn GenerationService>,
    fetcher: Arc<dyn MediaFetcher>,
    jobs: JobSettings,
    video: VideoSettings,
    text_model: String,
    image_model: String,
    clip_dir: PathBuf,
}

impl SegmentJobRunner {
    pub fn new(
        service: Arc<dyn GenerationService>,
        fetcher: Arc<dyn MediaFetcher>,
        cfg: &Config,
        clip_dir: PathBuf,
    ) -> Self {
        Self {
            service,
            fetcher,
            jobs: cfg.jobs.clone(),
            video: cfg.video.clone(),
            text_model: cfg.text_to_video_model.clone(),
            image_model: cfg.image_to_video_model.clone(),
            clip_dir,
        }
    }

    /// Image-conditioned model when a seed image exists, text-only otherwise.
    pub fn model_for(&self, segment: &Segment) -> &str {
        match segment.image_url.as_deref() {
            Some(url) if !url.trim().is_empty() => &self.image_model,
            _ => &self.text_model,
        }
    }

    pub fn request_for(&self, segment: &Segment) -> GenerationRequest {
        GenerationRequest {
            model: self.model_for(segment).to_string(),
            prompt: build_prompt(segment, &self.jobs.prompt_context, self.jobs.prompt_max_chars),
            width: self.video.width,
            height: self.video.height,
            fps: self.video.fps,
            duration: segment
                .duration
                .filter(|d| *d > 0.0)
                .unwrap_or(self.video.default_clip_seconds),
            seed_image_url: segment
                .image_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn clip_path(&self, ordinal: usize, attempt: u32) -> PathBuf {
        self.clip_dir
            .join(format!("segment_{:02}_attempt_{}.mp4", ordinal, attempt))
    }

    /// Drives the segment to a terminal outcome. Never returns an error:
    /// exhausted retries come back as `success == false`.
    pub async fn submit_and_await(&self, segment: &Segment) -> GenerationResult {
        let request = self.request_for(segment);
        let max_attempts = self.jobs.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let mut job = GenerationJob::new(segment.ordinal, attempt);
            logi(format!(
                "Segment {} ({}) attempt {}/{} via {}",
                segment.ordinal, segment.id, attempt, max_attempts, request.model
            ));

            match self.run_attempt(&mut job, &request).await {
                Ok(path) => {
                    job.succeed(path.clone());
                    logok(format!(
                        "Segment {} clip ready: {}",
                        segment.ordinal,
                        path.display()
                    ));
                    return GenerationResult {
                        segment_ordinal: segment.ordinal,
                        segment_id: segment.id.clone(),
                        success: true,
                        attempts: attempt,
                        video_path: Some(path),
                        duration: request.duration,
                        prompt: request.prompt,
                        model: request.model,
                        error: None,
                    };
                }
                Err(err) => {
                    job.fail(err.to_string());
                    logw(format!(
                        "Segment {} attempt {}/{} failed: {}",
                        segment.ordinal, attempt, max_attempts, err
                    ));
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        sleep(self.jobs.retry_backoff()).await;
                    }
                }
            }
        }

        GenerationResult {
            segment_ordinal: segment.ordinal,
            segment_id: segment.id.clone(),
            success: false,
            attempts: max_attempts,
            video_path: None,
            duration: 0.0,
            prompt: request.prompt,
            model: request.model,
            error: Some(format!(
                "retries exhausted after {} attempts: {}",
                max_attempts, last_error
            )),
        }
    }

    async fn run_attempt(
        &self,
        job: &mut GenerationJob,
        request: &GenerationRequest,
    ) -> Result<PathBuf, ServiceError> {
        let handle = self.service.submit(request).await?;
        job.start_polling(handle.clone());

        let result_url = self.await_completion(&handle).await?;
        let dest = self.clip_path(job.segment_ordinal, job.attempt);
        let bytes = self.fetcher.fetch(&result_url, &dest).await?;
        logi(format!("Downloaded {} bytes -> {}", bytes, dest.display()));
        Ok(dest)
    }

    async fn await_completion(&self, handle: &JobHandle) -> Result<String, ServiceError> {
        let max = self.jobs.max_poll_attempts;
        for attempt in 1..=max {
            match self.service.poll(handle).await {
                Ok(PollStatus::Completed { result_url }) => return Ok(result_url),
                Ok(PollStatus::Failed { error }) => return Err(ServiceError::JobFailed(error)),
                Ok(PollStatus::Running) => {}
                Err(err) => logw(format!(
                    "Poll {} for {} errored: {}",
                    attempt, handle.request_id, err
                )),
            }

            if attempt % 10 == 0 {
                logi(format!(
                    "Waiting on {} ({}/{})",
                    handle.request_id, attempt, max
                ));
            }
            if attempt < max {
                sleep(self.jobs.poll_interval()).await;
            }
        }
        Err(ServiceError::Timeout { attempts: max })
    }

    /// Runs every segment with at most `jobs.concurrency` in flight.
    /// Results come back in ordinal order regardless of completion order.
    pub async fn run_all(self: Arc<Self>, segments: &[Segment]) -> Vec<GenerationResult> {
        let permits = Arc::new(Semaphore::new(self.jobs.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for segment in segments.iter().cloned() {
            let runner = Arc::clone(&self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                runner.submit_and_await(&segment).await
            });
        }

        let mut results = Vec::with_capacity(segments.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => logw(format!("Segment task aborted: {}", err)),
            }
        }
        results.sort_by_key(|r| r.segment_ordinal);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn segment(ordinal: usize) -> Segment {
        Segment {
            ordinal,
            id: format!("seg{}", ordinal),
            title: format!("Title {}", ordinal),
            hook: "Spectrum auction!".to_string(),
            key_points: vec!["6G trials begin.".to_string(), "Prices drop (again)".to_string()],
            call_to_action: "Follow for more...".to_string(),
            keywords: vec![],
            image_url: None,
            duration: Some(6.0),
        }
    }

    fn fast_config(max_retries: u32, max_polls: u32) -> Config {
        let mut cfg = Config::default();
        cfg.jobs.max_retries = max_retries;
        cfg.jobs.retry_backoff_ms = 0;
        cfg.jobs.poll_interval_ms = 0;
        cfg.jobs.max_poll_attempts = max_polls;
        cfg
    }

    /// Fails the first `fail_first` submissions per segment (by prompt),
    /// then completes after `polls_until_done` polls.
    struct ScriptedService {
        fail_first: u32,
        polls_until_done: u32,
        submits: AtomicU32,
        per_prompt: Mutex<HashMap<String, u32>>,
        polls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedService {
        fn new(fail_first: u32, polls_until_done: u32) -> Self {
            Self {
                fail_first,
                polls_until_done,
                submits: AtomicU32::new(0),
                per_prompt: Mutex::new(HashMap::new()),
                polls: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ServiceError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            let seen = {
                let mut map = self.per_prompt.lock().unwrap();
                let entry = map.entry(request.prompt.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if seen <= self.fail_first {
                return Err(ServiceError::Submit(format!("HTTP 503 on try {}", seen)));
            }
            Ok(JobHandle {
                request_id: format!("req-{}", n),
                status_url: format!("mem://status/{}", n),
                response_url: format!("mem://result/{}", n),
            })
        }

        async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, ServiceError> {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(handle.request_id.clone()).or_insert(0);
            *count += 1;
            if *count > self.polls_until_done {
                Ok(PollStatus::Completed {
                    result_url: format!("mem://video/{}", handle.request_id),
                })
            } else {
                Ok(PollStatus::Running)
            }
        }
    }

    struct DiskFetcher;

    #[async_trait]
    impl MediaFetcher for DiskFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ServiceError> {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, url.as_bytes()).await?;
            Ok(url.len() as u64)
        }
    }

    struct RejectingFetcher;

    #[async_trait]
    impl MediaFetcher for RejectingFetcher {
        async fn fetch(&self, _url: &str, _dest: &Path) -> Result<u64, ServiceError> {
            Err(ServiceError::Fetch { status: 500 })
        }
    }

    struct FailingService;

    #[async_trait]
    impl GenerationService for FailingService {
        async fn submit(&self, _request: &GenerationRequest) -> Result<JobHandle, ServiceError> {
            Ok(JobHandle {
                request_id: "r".to_string(),
                status_url: "s".to_string(),
                response_url: "r".to_string(),
            })
        }

        async fn poll(&self, _handle: &JobHandle) -> Result<PollStatus, ServiceError> {
            Ok(PollStatus::Failed {
                error: "content policy".to_string(),
            })
        }
    }

    /// Poll transport errors for the first `errors` polls, then completes.
    struct FlakyPollService {
        errors: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl GenerationService for FlakyPollService {
        async fn submit(&self, _request: &GenerationRequest) -> Result<JobHandle, ServiceError> {
            Ok(JobHandle {
                request_id: "flaky".to_string(),
                status_url: "mem://status/flaky".to_string(),
                response_url: "mem://result/flaky".to_string(),
            })
        }

        async fn poll(&self, _handle: &JobHandle) -> Result<PollStatus, ServiceError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.errors {
                return Err(ServiceError::Poll(format!("connection reset on poll {}", n)));
            }
            Ok(PollStatus::Completed {
                result_url: "mem://video/flaky".to_string(),
            })
        }
    }

    fn runner(
        service: Arc<dyn GenerationService>,
        fetcher: Arc<dyn MediaFetcher>,
        cfg: &Config,
        dir: &Path,
    ) -> SegmentJobRunner {
        SegmentJobRunner::new(service, fetcher, cfg, dir.join("clips"))
    }

    #[test]
    fn prompt_is_normalized_and_stable() {
        let seg = segment(0);
        let a = build_prompt(&seg, "", 500);
        let b = build_prompt(&seg, "", 500);
        assert_eq!(a, b);
        assert_eq!(
            a,
            "Spectrum auction 6G trials begin Prices drop again Follow for more"
        );
    }

    #[test]
    fn prompt_keeps_unicode_words_and_context() {
        let mut seg = segment(0);
        seg.hook = "전파 산업, 5G!".to_string();
        seg.key_points.clear();
        seg.call_to_action.clear();
        assert_eq!(build_prompt(&seg, "news:", 500), "news 전파 산업 5G");
    }

    #[test]
    fn prompt_is_truncated_on_char_boundary() {
        let mut seg = segment(0);
        seg.hook = "가나다라마바사".to_string();
        seg.key_points.clear();
        seg.call_to_action.clear();
        assert_eq!(build_prompt(&seg, "", 3), "가나다");
    }

    #[test]
    fn seed_image_selects_image_model() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(0, 1);
        let r = runner(Arc::new(FailingService), Arc::new(DiskFetcher), &cfg, dir.path());

        let mut seg = segment(0);
        assert_eq!(r.model_for(&seg), cfg.text_to_video_model);
        assert!(r.request_for(&seg).seed_image_url.is_none());

        seg.image_url = Some("https://img/0.png".to_string());
        assert_eq!(r.model_for(&seg), cfg.image_to_video_model);
        let req = r.request_for(&seg);
        assert_eq!(req.seed_image_url.as_deref(), Some("https://img/0.png"));
        assert_eq!(req.duration, 6.0);
        assert_eq!((req.width, req.height, req.fps), (1080, 1920, 24));
    }

    #[test]
    fn missing_duration_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(0, 1);
        let r = runner(Arc::new(FailingService), Arc::new(DiskFetcher), &cfg, dir.path());
        let mut seg = segment(0);
        seg.duration = None;
        assert_eq!(r.request_for(&seg).duration, 8.0);
    }

    #[test]
    fn job_state_only_moves_forward() {
        let mut job = GenerationJob::new(3, 1);
        assert_eq!(job.state(), JobState::Pending);
        assert!(!job.succeed(PathBuf::from("x.mp4")));

        let handle = JobHandle {
            request_id: "r".to_string(),
            status_url: "s".to_string(),
            response_url: "o".to_string(),
        };
        assert!(job.start_polling(handle.clone()));
        assert!(!job.start_polling(handle));
        assert!(job.succeed(PathBuf::from("x.mp4")));
        assert_eq!(job.state(), JobState::Succeeded);
        assert!(!job.fail("late"));
        assert_eq!(job.output(), Some(&PathBuf::from("x.mp4")));
        assert!(job.error().is_none());
    }

    #[test]
    fn pending_job_can_fail() {
        let mut job = GenerationJob::new(0, 2);
        assert!(job.fail("submit rejected"));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error(), Some("submit rejected"));
        assert!(job.handle().is_none());
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(2, 5);
        let r = runner(Arc::new(ScriptedService::new(0, 2)), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(1)).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.duration, 6.0);
        let path = result.video_path.unwrap();
        assert!(path.ends_with("clips/segment_01_attempt_1.mp4"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn recovers_after_failures_below_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(2, 5);
        let service = Arc::new(ScriptedService::new(2, 0));
        let r = runner(service.clone(), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(service.submits.load(Ordering::SeqCst), 3);
        assert!(result.video_path.unwrap().ends_with("segment_00_attempt_3.mp4"));
    }

    #[tokio::test]
    async fn exhausting_retries_marks_segment_failed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(2, 5);
        let r = runner(Arc::new(ScriptedService::new(3, 0)), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.video_path.is_none());
        let error = result.error.unwrap();
        assert!(error.contains("retries exhausted"));
        assert!(error.contains("try 3"));
    }

    #[tokio::test]
    async fn poll_ceiling_is_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(0, 3);
        let r = runner(Arc::new(ScriptedService::new(0, 10)), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out after 3 polls"));
    }

    #[tokio::test]
    async fn poll_errors_consume_attempts_but_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(0, 5);
        let service = Arc::new(FlakyPollService {
            errors: 4,
            polls: AtomicU32::new(0),
        });
        let r = runner(service.clone(), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(service.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn poll_errors_on_every_attempt_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(0, 5);
        let service = Arc::new(FlakyPollService {
            errors: u32::MAX,
            polls: AtomicU32::new(0),
        });
        let r = runner(service.clone(), Arc::new(DiskFetcher), &cfg, dir.path());

        let handle = service.submit(&r.request_for(&segment(0))).await.unwrap();
        let err = r.await_completion(&handle).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { attempts: 5 }));
        assert_eq!(service.polls.load(Ordering::SeqCst), 5);

        let result = r.submit_and_await(&segment(0)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out after 5 polls"));
    }

    #[tokio::test]
    async fn service_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(1, 3);
        let r = runner(Arc::new(FailingService), Arc::new(DiskFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.error.unwrap().contains("content policy"));
    }

    #[tokio::test]
    async fn download_failure_triggers_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(1, 3);
        let service = Arc::new(ScriptedService::new(0, 0));
        let r = runner(service.clone(), Arc::new(RejectingFetcher), &cfg, dir.path());

        let result = r.submit_and_await(&segment(0)).await;
        assert!(!result.success);
        assert_eq!(service.submits.load(Ordering::SeqCst), 2);
        assert!(result.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn run_all_returns_ordinal_order_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = fast_config(0, 5);
        cfg.jobs.concurrency = 3;
        let r = Arc::new(runner(
            Arc::new(ScriptedService::new(0, 1)),
            Arc::new(DiskFetcher),
            &cfg,
            dir.path(),
        ));

        let mut segments: Vec<Segment> = (0..4).map(segment).collect();
        for (i, seg) in segments.iter_mut().enumerate() {
            seg.hook = format!("hook {}", i);
        }
        segments.reverse();

        let results = r.run_all(&segments).await;
        let order: Vec<usize> = results.iter().map(|r| r.segment_ordinal).collect();
        assert_eq!(order, [0, 1, 2, 3]);
        assert!(results.iter().all(|r| r.success));

        let summary = summarize(&results);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.total_duration, 24.0);
    }
}
