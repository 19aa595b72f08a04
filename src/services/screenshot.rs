//! Screenshot Capture
//!
//! Renders the preview URL through the external browser-render API, uploads
//! the image to the image store, and returns the public URL. The caller
//! persists the URL onto the app's registry row.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::utils::error::{AppError, AppResult};

/// Capture viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Browser-render + image-store client.
pub struct ScreenshotService {
    client: reqwest::Client,
    render_base_url: String,
    image_store_url: String,
}

impl ScreenshotService {
    pub fn new(render_base_url: impl Into<String>, image_store_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            render_base_url: render_base_url.into(),
            image_store_url: image_store_url.into(),
        }
    }

    /// Render `url` at `viewport` and upload the result. Returns the public
    /// image URL.
    pub async fn capture(&self, url: &str, viewport: Viewport) -> AppResult<String> {
        let render_url = format!(
            "{}/screenshot",
            self.render_base_url.trim_end_matches('/')
        );
        debug!(%url, width = viewport.width, height = viewport.height, "capturing screenshot");
        let resp = self
            .client
            .post(&render_url)
            .json(&json!({"url": url, "viewport": viewport}))
            .send()
            .await
            .map_err(|e| AppError::internal(format!("browser render: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::internal(format!(
                "browser render: HTTP {}",
                resp.status()
            )));
        }
        let image = resp
            .bytes()
            .await
            .map_err(|e| AppError::internal(format!("browser render: {e}")))?;

        let upload_url = format!("{}/upload", self.image_store_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&upload_url)
            .header("content-type", "image/png")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| AppError::internal(format!("image upload: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::internal(format!(
                "image upload: HTTP {}",
                resp.status()
            )));
        }

        #[derive(Deserialize)]
        struct Uploaded {
            url: String,
        }
        let uploaded: Uploaded = resp
            .json()
            .await
            .map_err(|e| AppError::internal(format!("image upload: bad response: {e}")))?;
        Ok(uploaded.url)
    }
}
