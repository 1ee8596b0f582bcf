//! reqwest-backed device client.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::core::client::{DeviceClient, Download, ExtractionRequest};
use crate::core::error::{Error, Result};
use crate::core::models::{Device, Title, TransferSession};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a device's HTTP surface.
///
/// JSON calls are bounded by `request_timeout` end to end. Downloads bound
/// only the wait for response headers; the body may stream for as long as the
/// payload takes.
#[derive(Clone)]
pub struct HttpDeviceClient {
    client: Client,
    request_timeout: Duration,
}

impl HttpDeviceClient {
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let response = expect_success(response, Error::Protocol)?;
        decode_json(response).await
    }
}

/// `{base_url}/api/{segments...}`, with each segment percent-encoded so a
/// device-assigned id can never change the path.
fn endpoint(device: &Device, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(&device.base_url())
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", device.addr, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::InvalidAddress(format!("{} cannot carry a path", device.addr)))?
        .pop_if_empty()
        .push("api")
        .extend(segments);
    Ok(url)
}

/// Turn a non-success status into the error the call site picks.
fn expect_success(response: Response, to_error: fn(String) -> Error) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(to_error(format!(
        "{} returned {}",
        response.url().path(),
        status_text(status)
    )))
}

fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| Error::Protocol(format!("invalid response body: {}", e)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractResponse {
    operation_id: Option<String>,
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn get_info(&self, device: &Device) -> Result<HashMap<String, String>> {
        self.get_json(endpoint(device, &["info"])?).await
    }

    async fn list_titles(&self, device: &Device) -> Result<Vec<Title>> {
        self.get_json(endpoint(device, &["titles"])?).await
    }

    async fn request_extraction(
        &self,
        device: &Device,
        request: &ExtractionRequest,
    ) -> Result<String> {
        let url = endpoint(device, &["extract"])?;
        debug!(url = %url, title_id = %request.title_id, "POST");

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let response = expect_success(response, Error::RequestRejected)?;
        let body: ExtractResponse = decode_json(response).await?;

        match body.operation_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(Error::Protocol(
                "extract response is missing operationId".to_string(),
            )),
        }
    }

    async fn get_status(&self, device: &Device, operation_id: &str) -> Result<TransferSession> {
        self.get_json(endpoint(device, &["status", operation_id])?)
            .await
    }

    async fn download(&self, device: &Device, operation_id: &str) -> Result<Download> {
        let url = endpoint(device, &["download", operation_id])?;
        debug!(url = %url, "GET (stream)");

        let request = self.client.get(url.clone()).send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| Error::Unreachable(format!("no response from {} within timeout", url)))??;

        let response = expect_success(response, Error::Protocol)?;
        let content_length = response.content_length();

        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(Download {
            reader: Box::new(StreamReader::new(stream)),
            content_length,
        })
    }
}
