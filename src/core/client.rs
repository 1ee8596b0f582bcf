use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;

use super::error::Result;
use super::models::{Device, Title, TransferSession};

/// Body of `POST /api/extract`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub title_id: String,
    pub format: String,
    pub include_updates: bool,
    #[serde(rename = "includeDLC")]
    pub include_dlc: bool,
}

impl ExtractionRequest {
    pub fn new(title_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            title_id: title_id.into(),
            format: format.into(),
            include_updates: true,
            include_dlc: false,
        }
    }
}

/// An extracted payload being streamed from a device.
///
/// Dropping `reader` releases the underlying connection.
pub struct Download {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// `Content-Length` when the device declared one
    pub content_length: Option<u64>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Stateless request layer against one device.
///
/// Every method is a single remote call. Nothing is retried here; retry policy
/// belongs to the caller.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// `GET /api/info`
    async fn get_info(&self, device: &Device) -> Result<HashMap<String, String>>;

    /// `GET /api/titles`
    async fn list_titles(&self, device: &Device) -> Result<Vec<Title>>;

    /// `POST /api/extract`, returning the device-assigned operation id.
    async fn request_extraction(&self, device: &Device, request: &ExtractionRequest)
    -> Result<String>;

    /// `GET /api/status/{operation_id}`
    async fn get_status(&self, device: &Device, operation_id: &str) -> Result<TransferSession>;

    /// `GET /api/download/{operation_id}`
    async fn download(&self, device: &Device, operation_id: &str) -> Result<Download>;
}
