use super::{GenerationRequest, GenerationService, JobHandle, PollStatus};
use crate::error::ServiceError;
use crate::logw;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// fal.ai queue API binding.
pub struct FalQueueClient {
    client: Client,
    api_key: String,
    queue_base: String,
}

impl FalQueueClient {
    pub fn new(client: Client, api_key: impl Into<String>, queue_base: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            queue_base: queue_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }

    async fn get_json(&self, url: &str) -> Result<(reqwest::StatusCode, Value), ServiceError> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&raw).unwrap_or(Value::Null);
        Ok((status, body))
    }
}

fn snippet(raw: &str) -> String {
    raw.chars().take(400).collect()
}

/// Reads the handle out of a queue submit response. Missing URLs are
/// rebuilt from the request id.
pub(crate) fn parse_submit_response(
    body: &Value,
    queue_base: &str,
    model: &str,
) -> Option<JobHandle> {
    let request_id = body.get("request_id")?.as_str()?.to_string();
    let base = format!("{}/{}/requests/{}", queue_base, model, request_id);
    let status_url = body
        .get("status_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/status", base));
    let response_url = body
        .get("response_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(base);
    Some(JobHandle {
        request_id,
        status_url,
        response_url,
    })
}

pub(crate) fn extract_error(body: &Value) -> Option<String> {
    for key in ["error", "detail", "message"] {
        match body.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Null) | None => continue,
            Some(other) => {
                if let Some(msg) = other.get("message").and_then(Value::as_str) {
                    return Some(msg.to_string());
                }
                return Some(other.to_string());
            }
        }
    }
    None
}

/// The result URL lives under `video.url`, `video_url` or `url`
/// depending on the model.
pub(crate) fn extract_result_url(body: &Value) -> Option<String> {
    body.get("video")
        .and_then(|v| v.get("url"))
        .or_else(|| body.get("video_url"))
        .or_else(|| body.get("url"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QueueState {
    Pending,
    Completed,
    Failed(String),
}

pub(crate) fn parse_status(body: &Value) -> QueueState {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    match status.as_str() {
        "COMPLETED" | "OK" => match extract_error(body) {
            Some(err) => QueueState::Failed(err),
            None => QueueState::Completed,
        },
        "FAILED" | "ERROR" | "CANCELLED" => QueueState::Failed(
            extract_error(body).unwrap_or_else(|| format!("job ended with status {}", status)),
        ),
        _ => QueueState::Pending,
    }
}

#[async_trait]
impl GenerationService for FalQueueClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle, ServiceError> {
        let url = format!("{}/{}", self.queue_base, request.model);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            logw(format!("fal submit HTTP {} body: {}", status.as_u16(), snippet(&raw)));
            return Err(ServiceError::Submit(format!("HTTP {}", status.as_u16())));
        }

        let body: Value = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Submit(format!("unreadable response: {}", e)))?;
        parse_submit_response(&body, &self.queue_base, &request.model)
            .ok_or_else(|| ServiceError::Submit("response carried no request_id".to_string()))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, ServiceError> {
        let (status, body) = self.get_json(&handle.status_url).await?;
        if !status.is_success() {
            return Err(ServiceError::Poll(format!("status HTTP {}", status.as_u16())));
        }

        match parse_status(&body) {
            QueueState::Pending => Ok(PollStatus::Running),
            QueueState::Failed(error) => Ok(PollStatus::Failed { error }),
            QueueState::Completed => {
                let (status, result) = self.get_json(&handle.response_url).await?;
                if !status.is_success() {
                    let error = extract_error(&result)
                        .unwrap_or_else(|| format!("result HTTP {}", status.as_u16()));
                    return Ok(PollStatus::Failed { error });
                }
                match extract_result_url(&result) {
                    Some(result_url) => Ok(PollStatus::Completed { result_url }),
                    None => Ok(PollStatus::Failed {
                        error: "completed job carried no video url".to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_response_uses_provided_urls() {
        let body = json!({
            "request_id": "abc",
            "status_url": "https://q/s",
            "response_url": "https://q/r",
        });
        let handle = parse_submit_response(&body, "https://queue.fal.run", "fal-ai/m").unwrap();
        assert_eq!(handle.request_id, "abc");
        assert_eq!(handle.status_url, "https://q/s");
        assert_eq!(handle.response_url, "https://q/r");
    }

    #[test]
    fn submit_response_rebuilds_missing_urls() {
        let body = json!({ "request_id": "abc" });
        let handle = parse_submit_response(&body, "https://queue.fal.run", "fal-ai/m").unwrap();
        assert_eq!(handle.status_url, "https://queue.fal.run/fal-ai/m/requests/abc/status");
        assert_eq!(handle.response_url, "https://queue.fal.run/fal-ai/m/requests/abc");
    }

    #[test]
    fn submit_response_without_id_is_rejected() {
        assert!(parse_submit_response(&json!({}), "b", "m").is_none());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(parse_status(&json!({"status":"IN_QUEUE"})), QueueState::Pending);
        assert_eq!(parse_status(&json!({"status":"IN_PROGRESS"})), QueueState::Pending);
        assert_eq!(parse_status(&json!({"status":"COMPLETED"})), QueueState::Completed);
        assert_eq!(
            parse_status(&json!({"status":"FAILED","error":"nsfw"})),
            QueueState::Failed("nsfw".to_string())
        );
        assert_eq!(
            parse_status(&json!({"status":"COMPLETED","error":{"message":"oom"}})),
            QueueState::Failed("oom".to_string())
        );
    }

    #[test]
    fn result_url_locations() {
        assert_eq!(
            extract_result_url(&json!({"video":{"url":"https://v/1.mp4"}})).as_deref(),
            Some("https://v/1.mp4")
        );
        assert_eq!(
            extract_result_url(&json!({"video_url":"https://v/2.mp4"})).as_deref(),
            Some("https://v/2.mp4")
        );
        assert_eq!(
            extract_result_url(&json!({"url":"https://v/3.mp4"})).as_deref(),
            Some("https://v/3.mp4")
        );
        assert_eq!(extract_result_url(&json!({"video":{}})), None);
    }

    #[test]
    fn request_body_omits_missing_seed_image() {
        let req = GenerationRequest {
            model: "fal-ai/m".to_string(),
            prompt: "p".to_string(),
            width: 1080,
            height: 1920,
            fps: 24,
            duration: 8.0,
            seed_image_url: None,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("image_url").is_none());
        assert!(body.get("model").is_none());
        assert_eq!(body["width"], 1080);

        let with_image = GenerationRequest {
            seed_image_url: Some("https://img".to_string()),
            ..req
        };
        assert_eq!(serde_json::to_value(&with_image).unwrap()["image_url"], "https://img");
    }
}
