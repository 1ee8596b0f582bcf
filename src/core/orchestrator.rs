//! End-to-end extraction workflow for one connected device.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Requesting -> Polling -> Downloading -> Succeeded
//!                                        \____________\______________\____-> Failed
//! ```
//!
//! The orchestrator owns its session for the duration of a workflow. Only the
//! task running `extract_and_fetch` writes workflow state; `disconnect` may
//! cancel it and bump the generation so late writes from the cancelled run are
//! discarded.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::client::{DeviceClient, ExtractionRequest};
use super::codec::{PayloadCodec, Platform};
use super::error::{Error, FailureKind, Result};
use super::events::{EventSink, TransferEvent};
use super::models::{Device, SessionStatus, Title, TransferSession};
use super::progress::ProgressReader;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Delay before each status poll
    pub poll_interval: Duration,
    /// Where downloaded payloads are spooled before processing
    pub temp_dir: PathBuf,
    /// Output format requested from the device, e.g. `nsp`
    pub format: String,
    pub include_updates: bool,
    pub include_dlc: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            temp_dir: std::env::temp_dir(),
            format: "nsp".to_string(),
            include_updates: true,
            include_dlc: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorState {
    Idle,
    Connecting,
    Connected { title_count: usize },
    Requesting,
    Polling { operation_id: String },
    Downloading { operation_id: String },
    Succeeded,
    Failed { kind: FailureKind, message: String },
}

impl OrchestratorState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Requesting => "requesting",
            Self::Polling { .. } => "polling",
            Self::Downloading { .. } => "downloading",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Where the extracted content goes and what it is for.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub output: PathBuf,
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub operation_id: String,
    pub output: PathBuf,
    /// Bytes downloaded from the device
    pub payload_bytes: u64,
    /// Bytes written to `output` after the codec ran
    pub content_bytes: u64,
    /// BLAKE3 hex digest of the written content
    pub digest: String,
}

struct Shared {
    state: OrchestratorState,
    device: Option<Device>,
    /// Bumped on connect/disconnect; stale workflow writes are dropped
    generation: u64,
    active: Option<CancellationToken>,
}

pub struct TransferOrchestrator {
    client: Arc<dyn DeviceClient>,
    codec: Arc<dyn PayloadCodec>,
    sink: Arc<dyn EventSink>,
    config: TransferConfig,
    shared: Mutex<Shared>,
    busy: AtomicBool,
}

/// Holds the single-workflow flag; released on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TransferOrchestrator {
    pub fn new(
        client: Arc<dyn DeviceClient>,
        codec: Arc<dyn PayloadCodec>,
        sink: Arc<dyn EventSink>,
        config: TransferConfig,
    ) -> Self {
        Self {
            client,
            codec,
            sink,
            config,
            shared: Mutex::new(Shared {
                state: OrchestratorState::Idle,
                device: None,
                generation: 0,
                active: None,
            }),
            busy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.lock().state.clone()
    }

    pub fn connected_device(&self) -> Option<Device> {
        self.lock().device.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Probe `device` by listing its titles. On success the device becomes the
    /// connected one and the title count is returned.
    pub async fn connect(&self, device: Device) -> Result<usize> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(Error::Busy)?;

        let generation = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.device = None;
            shared.generation
        };
        self.transition(generation, OrchestratorState::Connecting);
        self.status(format!("Connecting to {}...", device.addr));

        match self.client.list_titles(&device).await {
            Ok(titles) => {
                let title_count = titles.len();
                {
                    let mut shared = self.lock();
                    if shared.generation == generation {
                        shared.device = Some(device.clone());
                    }
                }
                self.transition(generation, OrchestratorState::Connected { title_count });
                self.status(format!(
                    "Connected to {} at {} ({} titles available)",
                    device.name, device.addr, title_count
                ));
                Ok(title_count)
            }
            Err(e) => {
                let err = Error::Connection(e.to_string());
                self.fail(generation, &err);
                Err(err)
            }
        }
    }

    /// Forget the connected device and return to `Idle`. Cancels an in-flight
    /// workflow, whose later state updates are then ignored.
    pub fn disconnect(&self) {
        let active = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.device = None;
            shared.state = OrchestratorState::Idle;
            shared.active.take()
        };
        if let Some(token) = active {
            token.cancel();
        }
        self.sink.emit(TransferEvent::State(OrchestratorState::Idle));
        self.status("Disconnected from device".to_string());
    }

    /// Run request -> poll -> download -> codec for `title` on the connected
    /// device. Only one call may be active at a time; a concurrent call fails
    /// with [`Error::Busy`].
    pub async fn extract_and_fetch(
        &self,
        title: &Title,
        target: &FetchTarget,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(Error::Busy)?;

        let cancel = cancel.child_token();
        let (device, generation) = {
            let mut shared = self.lock();
            let Some(device) = shared.device.clone() else {
                return Err(Error::NotConnected);
            };
            shared.active = Some(cancel.clone());
            (device, shared.generation)
        };

        let span = info_span!("extract", title_id = %title.title_id, device = %device.addr);
        let result = self
            .run_workflow(&device, title, target, &cancel, generation)
            .instrument(span)
            .await;

        {
            let mut shared = self.lock();
            if shared.generation == generation {
                shared.active = None;
            }
        }

        match &result {
            Ok(outcome) => {
                info!(
                    output = %outcome.output.display(),
                    bytes = outcome.content_bytes,
                    digest = %outcome.digest,
                    "Extraction complete"
                );
                self.transition(generation, OrchestratorState::Succeeded);
                self.status(format!("Saved {} to {}", title.name, outcome.output.display()));
            }
            Err(e) => self.fail(generation, e),
        }

        result
    }

    async fn run_workflow(
        &self,
        device: &Device,
        title: &Title,
        target: &FetchTarget,
        cancel: &CancellationToken,
        generation: u64,
    ) -> Result<FetchOutcome> {
        self.transition(generation, OrchestratorState::Requesting);
        self.status(format!("Requesting extraction of {}...", title.name));

        let request = ExtractionRequest {
            title_id: title.title_id.clone(),
            format: self.config.format.clone(),
            include_updates: self.config.include_updates,
            include_dlc: self.config.include_dlc,
        };
        let operation_id = cancellable(cancel, self.client.request_extraction(device, &request))
            .await?
            .map_err(|e| Error::Request(e.to_string()))?;
        info!(operation_id = %operation_id, "Extraction accepted");

        self.transition(
            generation,
            OrchestratorState::Polling {
                operation_id: operation_id.clone(),
            },
        );
        self.status("Extraction started, waiting for completion...".to_string());
        let session = self.poll_until_done(device, &operation_id, cancel).await?;

        self.transition(
            generation,
            OrchestratorState::Downloading {
                operation_id: operation_id.clone(),
            },
        );
        self.status("Extraction completed, downloading file...".to_string());
        self.download_and_process(device, &session, target, cancel)
            .await
    }

    /// Poll status until the session is terminal. Polls are strictly
    /// sequential and there is no deadline; only cancellation ends a long run.
    async fn poll_until_done(
        &self,
        device: &Device,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferSession> {
        let mut last = SessionStatus::Pending;

        loop {
            cancellable(cancel, tokio::time::sleep(self.config.poll_interval)).await?;

            let session = cancellable(cancel, self.client.get_status(device, operation_id))
                .await?
                .map_err(|e| Error::Request(format!("status poll failed: {}", e)))?;

            if !last.can_advance_to(session.status) {
                return Err(Error::Protocol(format!(
                    "status regressed from {} to {}",
                    last.as_str(),
                    session.status.as_str()
                )));
            }
            last = session.status;
            debug!(status = session.status.as_str(), "Polled extraction status");

            match session.status {
                SessionStatus::Pending => {}
                SessionStatus::InProgress => {
                    let percentage = session.percentage();
                    self.sink.emit(TransferEvent::ExtractProgress {
                        percentage,
                        bytes_transferred: session.bytes_transferred,
                        total_bytes: session.total_bytes,
                    });
                    self.status(format!("Extracting... {:.1}%", percentage));
                }
                SessionStatus::Completed => return Ok(session),
                SessionStatus::Failed => {
                    let message = session
                        .error_message
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "device reported failure without a message".to_string());
                    return Err(Error::RemoteExtraction(message));
                }
            }
        }
    }

    async fn download_and_process(
        &self,
        device: &Device,
        session: &TransferSession,
        target: &FetchTarget,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let download = cancellable(cancel, self.client.download(device, &session.operation_id))
            .await?
            .map_err(|e| Error::Processing(format!("download failed: {}", e)))?;

        let total_bytes = match (session.total_bytes, download.content_length) {
            (0, Some(len)) => len,
            (total, _) => total,
        };

        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| processing("failed to create temp directory", e))?;
        let spool = tempfile::Builder::new()
            .prefix("nxlink-")
            .suffix(".nsp")
            .tempfile_in(&self.config.temp_dir)
            .map_err(|e| processing("failed to create spool file", e))?;

        let sink = self.sink.clone();
        let mut reader = ProgressReader::new(download.reader, move |bytes_read| {
            sink.emit(TransferEvent::DownloadProgress {
                bytes_read,
                total_bytes,
            })
        });
        let payload_bytes = cancellable(cancel, fill(&spool, &mut reader))
            .await?
            .map_err(|e| processing("failed to download payload", e))?;
        // Releases the device connection before the codec runs
        drop(reader);
        debug!(path = %spool.path().display(), bytes = payload_bytes, "Payload spooled");

        if total_bytes > 0 && payload_bytes != total_bytes {
            warn!(expected = total_bytes, received = payload_bytes, "Payload size differs from declared total");
        }

        self.status("Processing extracted payload...".to_string());
        let mut payload = spool
            .reopen()
            .map(File::from_std)
            .map_err(|e| processing("failed to reopen payload", e))?;
        let content = cancellable(cancel, self.codec.extract(&mut payload, target.platform))
            .await?
            .map_err(|e| Error::Processing(e.to_string()))?;
        drop(payload);

        let digest = blake3::hash(&content).to_hex().to_string();
        cancellable(cancel, write_output(&target.output, &content))
            .await?
            .map_err(|e| processing("failed to write output", e))?;

        Ok(FetchOutcome {
            operation_id: session.operation_id.clone(),
            output: target.output.clone(),
            payload_bytes,
            content_bytes: content.len() as u64,
            digest,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `state` if `generation` is still current, then notify.
    fn transition(&self, generation: u64, state: OrchestratorState) {
        {
            let mut shared = self.lock();
            if shared.generation != generation {
                debug!(state = state.name(), "Dropping state change from stale workflow");
                return;
            }
            shared.state = state.clone();
        }
        self.sink.emit(TransferEvent::State(state));
    }

    fn fail(&self, generation: u64, err: &Error) {
        let kind = err.failure_kind();
        let message = err.message();
        self.transition(
            generation,
            OrchestratorState::Failed {
                kind,
                message: message.clone(),
            },
        );
        self.status(format!("Error: {}", message));
    }

    fn status(&self, message: String) {
        self.sink.emit(TransferEvent::Status(message));
    }
}

/// Race `fut` against `cancel`. Cancellation wins ties.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        value = fut => Ok(value),
    }
}

fn processing(context: &str, e: io::Error) -> Error {
    Error::Processing(format!("{}: {}", context, e))
}

/// Copy `reader` into the spool file, leaving it closed but on disk.
async fn fill<R>(spool: &NamedTempFile, reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::from_std(spool.reopen()?);
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(written)
}

/// Write `content` to a temp file beside `output` and rename it into place.
async fn write_output(output: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent).await?;

    let part = tempfile::Builder::new()
        .prefix(".nxlink-")
        .suffix(".part")
        .tempfile_in(&parent)?;

    let mut file = File::from_std(part.reopen()?);
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    part.persist(output).map_err(|e| e.error)?;
    Ok(())
}
