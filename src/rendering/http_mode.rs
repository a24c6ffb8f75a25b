use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{RenderError, RenderParams};

/// Remote renderer reached over HTTP.
pub struct HttpRenderer {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(url: &str) -> Result<Self, RenderError> {
        let url = reqwest::Url::parse(url).map_err(|e| RenderError::InvalidUrl(format!("{url}: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { url, client })
    }

    pub async fn render(
        &self,
        params: &RenderParams,
        timeout: Duration,
        file_path: &Path,
    ) -> Result<(), RenderError> {
        fetch_to_file(&self.client, self.url.clone(), params, timeout, file_path).await
    }
}

/// GET the renderer with `params` and stream the image into `file_path`.
/// The whole exchange gets `timeout` plus two seconds of slack.
pub(crate) async fn fetch_to_file(
    client: &reqwest::Client,
    url: reqwest::Url,
    params: &RenderParams,
    timeout: Duration,
    file_path: &Path,
) -> Result<(), RenderError> {
    let exchange = async {
        let mut resp = client.get(url).query(&params.query()).send().await.map_err(|e| {
            tracing::error!(error = %e, "failed to send request to remote rendering service");
            RenderError::Request(e)
        })?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            tracing::error!(status = status.as_u16(), "remote rendering request failed");
            return Err(RenderError::Status(status.as_u16()));
        }

        let mut out = tokio::fs::File::create(file_path).await?;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    };

    match tokio::time::timeout(timeout + Duration::from_secs(2), exchange).await {
        Ok(result) => {
            if result.is_err() {
                let _ = tokio::fs::remove_file(file_path).await;
            }
            result
        }
        Err(_) => {
            tracing::info!("rendering timed out");
            let _ = tokio::fs::remove_file(file_path).await;
            Err(RenderError::Timeout)
        }
    }
}
