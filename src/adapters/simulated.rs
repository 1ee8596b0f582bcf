use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::core::client::{DeviceClient, Download, ExtractionRequest};
use crate::core::discovery::{DiscoveryAdapter, DiscoveryStatus};
use crate::core::error::{Error, Result};
use crate::core::models::{Device, SessionStatus, Title, TitleKind, TransferSession};
use crate::core::registry::DeviceRegistry;

enum SimulatedCommand {
    Announce(Device),
    Vanish(SocketAddr),
}

/// Handle used to inject sightings into a [`SimulatedDiscovery`].
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
}

impl Simulator {
    pub fn announce(&self, addr: SocketAddr, name: &str, version: &str) {
        let _ = self
            .tx
            .send(SimulatedCommand::Announce(Device::new(addr, name, version)));
    }

    pub fn vanish(&self, addr: SocketAddr) {
        let _ = self.tx.send(SimulatedCommand::Vanish(addr));
    }
}

/// Discovery adapter fed by a [`Simulator`] instead of the network.
pub struct SimulatedDiscovery {
    // Taken by `start()`, which only runs once
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>,
    cancel: CancellationToken,
}

impl SimulatedDiscovery {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                cmd_rx: Mutex::new(Some(rx)),
                cancel: CancellationToken::new(),
            },
            Simulator { tx },
        )
    }
}

impl DiscoveryAdapter for SimulatedDiscovery {
    fn start(&self, registry: DeviceRegistry) -> DiscoveryStatus {
        let Some(mut rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return DiscoveryStatus::AlreadyRunning;
        };

        info!("Simulated discovery started");
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };

                match cmd {
                    SimulatedCommand::Announce(device) => {
                        registry.record_sighting(device).await;
                    }
                    SimulatedCommand::Vanish(addr) => {
                        registry.remove(&addr).await;
                    }
                }
            }
        });

        DiscoveryStatus::Active
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// One scripted answer to `get_status`.
#[derive(Debug, Clone)]
pub struct ScriptedStatus {
    pub status: SessionStatus,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub error_message: Option<String>,
}

impl ScriptedStatus {
    pub fn pending() -> Self {
        Self::new(SessionStatus::Pending, 0, 0)
    }

    pub fn in_progress(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self::new(SessionStatus::InProgress, bytes_transferred, total_bytes)
    }

    pub fn completed(total_bytes: u64) -> Self {
        Self::new(SessionStatus::Completed, total_bytes, total_bytes)
    }

    pub fn failed(message: &str) -> Self {
        Self {
            error_message: Some(message.to_string()),
            ..Self::new(SessionStatus::Failed, 0, 0)
        }
    }

    fn new(status: SessionStatus, bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            status,
            bytes_transferred,
            total_bytes,
            error_message: None,
        }
    }
}

#[derive(Clone)]
enum PayloadScript {
    Bytes(Arc<Vec<u8>>),
    /// Yields this many bytes, then a read error
    BreakAfter(usize),
}

/// In-process device for `--simulation` runs and tests.
///
/// Status polls walk through a script; once the script runs out the last entry
/// repeats. Every call is counted so tests can assert nothing hit the device.
pub struct SimulatedDevice {
    info: HashMap<String, String>,
    titles: Vec<Title>,
    script: Mutex<VecDeque<ScriptedStatus>>,
    last: Mutex<Option<ScriptedStatus>>,
    payload: PayloadScript,
    reject_extraction: bool,
    unreachable: bool,
    latency: Duration,
    calls: AtomicUsize,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// A device with demo titles that completes every extraction after a few
    /// progress updates and serves fabricated payload bytes.
    pub fn new() -> Self {
        let payload = fabricate_payload(512 * 1024);
        let total = payload.len() as u64;

        Self {
            info: HashMap::from([
                ("name".to_string(), "Simulated NXDump".to_string()),
                ("version".to_string(), "0.0.0-sim".to_string()),
            ]),
            titles: demo_titles(),
            script: Mutex::new(VecDeque::from([
                ScriptedStatus::pending(),
                ScriptedStatus::in_progress(total / 4, total),
                ScriptedStatus::in_progress(total / 2, total),
                ScriptedStatus::in_progress(total * 3 / 4, total),
                ScriptedStatus::completed(total),
            ])),
            last: Mutex::new(None),
            payload: PayloadScript::Bytes(Arc::new(payload)),
            reject_extraction: false,
            unreachable: false,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_titles(mut self, titles: Vec<Title>) -> Self {
        self.titles = titles;
        self
    }

    pub fn with_info(mut self, name: &str, version: &str) -> Self {
        self.info = HashMap::from([
            ("name".to_string(), name.to_string()),
            ("version".to_string(), version.to_string()),
        ]);
        self
    }

    pub fn with_status_script(mut self, script: Vec<ScriptedStatus>) -> Self {
        self.script = Mutex::new(script.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = PayloadScript::Bytes(Arc::new(payload));
        self
    }

    /// The download breaks with an I/O error after `bytes` bytes.
    pub fn with_broken_download(mut self, bytes: usize) -> Self {
        self.payload = PayloadScript::BreakAfter(bytes);
        self
    }

    pub fn rejecting_extraction(mut self) -> Self {
        self.reject_extraction = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Delay applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, device: &Device) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unreachable {
            return Err(Error::Unreachable(format!(
                "no response from {}",
                device.base_url()
            )));
        }
        Ok(())
    }

    fn next_status(&self) -> ScriptedStatus {
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match next {
            Some(status) => {
                *last = Some(status.clone());
                status
            }
            None => last
                .clone()
                .unwrap_or_else(|| ScriptedStatus::completed(0)),
        }
    }
}

#[async_trait]
impl DeviceClient for SimulatedDevice {
    async fn get_info(&self, device: &Device) -> Result<HashMap<String, String>> {
        self.answer(device).await?;
        Ok(self.info.clone())
    }

    async fn list_titles(&self, device: &Device) -> Result<Vec<Title>> {
        self.answer(device).await?;
        Ok(self.titles.clone())
    }

    async fn request_extraction(
        &self,
        device: &Device,
        request: &ExtractionRequest,
    ) -> Result<String> {
        self.answer(device).await?;
        if self.reject_extraction {
            return Err(Error::RequestRejected(format!(
                "/api/extract returned 400 Bad Request for {}",
                request.title_id
            )));
        }
        if !self.titles.iter().any(|t| t.title_id == request.title_id) {
            return Err(Error::RequestRejected(format!(
                "unknown title {}",
                request.title_id
            )));
        }
        Ok(Uuid::now_v7().to_string())
    }

    async fn get_status(&self, device: &Device, operation_id: &str) -> Result<TransferSession> {
        self.answer(device).await?;
        let scripted = self.next_status();
        Ok(TransferSession {
            operation_id: operation_id.to_string(),
            status: scripted.status,
            bytes_transferred: scripted.bytes_transferred,
            total_bytes: scripted.total_bytes,
            error_message: scripted.error_message,
        })
    }

    async fn download(&self, device: &Device, _operation_id: &str) -> Result<Download> {
        self.answer(device).await?;
        let download = match &self.payload {
            PayloadScript::Bytes(bytes) => Download {
                content_length: Some(bytes.len() as u64),
                reader: Box::new(Cursor::new(bytes.as_ref().clone())),
            },
            PayloadScript::BreakAfter(bytes) => Download {
                content_length: None,
                reader: Box::new(BrokenReader { remaining: *bytes }),
            },
        };
        Ok(download)
    }
}

struct BrokenReader {
    remaining: usize,
}

impl AsyncRead for BrokenReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "device closed the connection",
            )));
        }
        let n = self.remaining.min(buf.remaining());
        buf.put_slice(&vec![0xAB; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

/// Deterministic stand-in for dumped content.
fn fabricate_payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_F491;
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(b"PFS0");
    while payload.len() < len {
        // xorshift32
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        payload.extend_from_slice(&state.to_le_bytes());
    }
    payload.truncate(len);
    payload
}

fn demo_titles() -> Vec<Title> {
    vec![
        Title {
            title_id: "0100000000010000".to_string(),
            name: "Super Mario 64".to_string(),
            version: "1.0.0".to_string(),
            size: 512 * 1024,
            kind: TitleKind::Digital,
            extractable: true,
        },
        Title {
            title_id: "0100000000020000".to_string(),
            name: "F-Zero".to_string(),
            version: "1.1.0".to_string(),
            size: 256 * 1024,
            kind: TitleKind::Cartridge,
            extractable: true,
        },
        Title {
            title_id: "0100000000030000".to_string(),
            name: "System Menu".to_string(),
            version: "15.0.0".to_string(),
            size: 0,
            kind: TitleKind::Other,
            extractable: false,
        },
    ]
}
