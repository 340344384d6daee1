use super::MediaFetcher;
use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub struct HttpMediaFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpMediaFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(300),
        }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, ServiceError> {
        let resp = self.client.get(url).timeout(self.timeout).send().await?;

        if !resp.status().is_success() {
            return Err(ServiceError::Fetch {
                status: resp.status().as_u16(),
            });
        }

        let bytes = resp.bytes().await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(dest, &bytes).await?;

        Ok(bytes.len() as u64)
    }
}
