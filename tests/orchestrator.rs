use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nxlink::adapters::{ScriptedStatus, SimulatedDevice};
use nxlink::core::{
    Device, Error, FailureKind, FetchTarget, OrchestratorState, Platform, RawCodec, Title,
    TransferConfig, TransferEvent, TransferOrchestrator,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TITLE_ID: &str = "0100000000010000";

struct Harness {
    device: Arc<SimulatedDevice>,
    orchestrator: TransferOrchestrator,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    spool_dir: TempDir,
    out_dir: TempDir,
}

impl Harness {
    fn new(device: SimulatedDevice) -> Self {
        let device = Arc::new(device);
        let spool_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let (tx, events) = mpsc::unbounded_channel();

        let orchestrator = TransferOrchestrator::new(
            device.clone(),
            Arc::new(RawCodec),
            Arc::new(tx),
            TransferConfig {
                poll_interval: Duration::from_millis(10),
                temp_dir: spool_dir.path().to_path_buf(),
                ..TransferConfig::default()
            },
        );

        Self {
            device,
            orchestrator,
            events,
            spool_dir,
            out_dir,
        }
    }

    fn target(&self) -> FetchTarget {
        FetchTarget {
            output: self.output(),
            platform: Platform::N64,
        }
    }

    fn output(&self) -> PathBuf {
        self.out_dir.path().join("roms/mario.z64")
    }

    fn drain(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn device() -> Device {
    Device::new("10.0.0.5:8080".parse().unwrap(), "Living Room", "1.0")
}

fn title() -> Title {
    Title {
        title_id: TITLE_ID.to_string(),
        name: "Super Mario 64".to_string(),
        version: "1.0.0".to_string(),
        size: 9,
        kind: nxlink::core::TitleKind::Digital,
        extractable: true,
    }
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn states(events: &[TransferEvent]) -> Vec<OrchestratorState> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::State(state) => Some(state.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_fetch_reports_progress_then_success() {
    let payload = b"N64 ROM!!".to_vec();
    let mut h = Harness::new(
        SimulatedDevice::new()
            .with_status_script(vec![
                ScriptedStatus::pending(),
                ScriptedStatus::in_progress(25, 100),
                ScriptedStatus::in_progress(60, 100),
                ScriptedStatus::completed(payload.len() as u64),
            ])
            .with_payload(payload.clone()),
    );

    let count = h.orchestrator.connect(device()).await.unwrap();
    assert_eq!(count, 3);

    let outcome = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(h.output()).unwrap(), payload);
    assert_eq!(outcome.payload_bytes, payload.len() as u64);
    assert_eq!(outcome.content_bytes, payload.len() as u64);
    assert_eq!(outcome.digest, blake3::hash(&payload).to_hex().to_string());
    assert!(dir_is_empty(h.spool_dir.path()));
    assert_eq!(h.orchestrator.state(), OrchestratorState::Succeeded);
    assert!(!h.orchestrator.is_busy());

    let events = h.drain();
    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ExtractProgress { percentage, .. } => Some(*percentage),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![25.0, 60.0]);

    let last_progress = events
        .iter()
        .rposition(|e| matches!(e, TransferEvent::ExtractProgress { .. }))
        .unwrap();
    let succeeded: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, TransferEvent::State(OrchestratorState::Succeeded)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert!(succeeded[0] > last_progress);

    let downloaded: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::DownloadProgress { bytes_read, .. } => Some(*bytes_read),
            _ => None,
        })
        .collect();
    assert!(downloaded.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(downloaded.last().copied(), Some(payload.len() as u64));

    assert!(events.contains(&TransferEvent::Status(
        "Extraction started, waiting for completion...".to_string()
    )));
    assert!(events.contains(&TransferEvent::Status("Extracting... 25.0%".to_string())));
    assert!(events.contains(&TransferEvent::Status(
        "Extraction completed, downloading file...".to_string()
    )));
}

#[tokio::test]
async fn test_state_sequence_for_successful_fetch() {
    let mut h = Harness::new(
        SimulatedDevice::new()
            .with_status_script(vec![ScriptedStatus::completed(3)])
            .with_payload(b"rom".to_vec()),
    );

    h.orchestrator.connect(device()).await.unwrap();
    h.orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap();

    let names: Vec<&str> = states(&h.drain()).iter().map(|s| s.name()).collect();
    assert_eq!(
        names,
        vec![
            "connecting",
            "connected",
            "requesting",
            "polling",
            "downloading",
            "succeeded"
        ]
    );
}

#[tokio::test]
async fn test_remote_failure_surfaces_device_message() {
    let mut h = Harness::new(SimulatedDevice::new().with_status_script(vec![
        ScriptedStatus::in_progress(10, 100),
        ScriptedStatus::failed("disk full"),
    ]));

    h.orchestrator.connect(device()).await.unwrap();
    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, Error::RemoteExtraction("disk full".to_string()));
    assert_eq!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::RemoteExtraction,
            message: "disk full".to_string(),
        }
    );
    assert!(dir_is_empty(h.spool_dir.path()));
    assert!(!h.output().exists());

    let events = h.drain();
    assert!(
        !states(&events)
            .iter()
            .any(|s| matches!(s, OrchestratorState::Downloading { .. }))
    );
    assert!(events.contains(&TransferEvent::Status("Error: disk full".to_string())));
}

#[tokio::test]
async fn test_rejected_request_fails_with_request_kind() {
    let h = Harness::new(SimulatedDevice::new().rejecting_extraction());

    h.orchestrator.connect(device()).await.unwrap();
    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Request(_)));
    assert!(matches!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::Request,
            ..
        }
    ));
    // connect, then the extraction request; no polls
    assert_eq!(h.device.calls(), 2);
}

#[tokio::test]
async fn test_broken_download_cleans_up_spool() {
    let h = Harness::new(
        SimulatedDevice::new()
            .with_status_script(vec![ScriptedStatus::completed(0)])
            .with_broken_download(64 * 1024),
    );

    h.orchestrator.connect(device()).await.unwrap();
    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Processing(_)));
    assert!(matches!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::Processing,
            ..
        }
    ));
    assert!(dir_is_empty(h.spool_dir.path()));
    assert!(!h.output().exists());
}

#[tokio::test]
async fn test_empty_payload_fails_in_codec() {
    let h = Harness::new(
        SimulatedDevice::new()
            .with_status_script(vec![ScriptedStatus::completed(0)])
            .with_payload(Vec::new()),
    );

    h.orchestrator.connect(device()).await.unwrap();
    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::Processing(m) if m.contains("empty")));
    assert!(dir_is_empty(h.spool_dir.path()));
    assert!(!h.output().exists());
}

#[tokio::test]
async fn test_cancellation_stops_polling() {
    // Never completes on its own
    let h = Harness::new(
        SimulatedDevice::new().with_status_script(vec![ScriptedStatus::in_progress(1, 100)]),
    );
    h.orchestrator.connect(device()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.orchestrator.extract_and_fetch(&title(), &h.target(), cancel),
    )
    .await
    .expect("cancellation did not end the workflow");

    assert_eq!(result.unwrap_err(), Error::Cancelled);
    assert!(matches!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::Cancelled,
            ..
        }
    ));
    assert!(!h.orchestrator.is_busy());

    // No more calls once cancelled
    let calls = h.device.calls();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.device.calls(), calls);
}

#[tokio::test]
async fn test_second_workflow_is_rejected_while_busy() {
    let h = Harness::new(
        SimulatedDevice::new().with_status_script(vec![ScriptedStatus::in_progress(1, 100)]),
    );
    h.orchestrator.connect(device()).await.unwrap();

    let cancel = CancellationToken::new();
    let first_title = title();
    let first_target = h.target();
    let first = h
        .orchestrator
        .extract_and_fetch(&first_title, &first_target, cancel.clone());
    let second = async {
        while !h.orchestrator.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = h
            .orchestrator
            .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
            .await;
        cancel.cancel();
        result
    };

    let (first, second) = tokio::join!(first, second);
    assert_eq!(second.unwrap_err(), Error::Busy);
    assert_eq!(first.unwrap_err(), Error::Cancelled);
}

#[tokio::test]
async fn test_extract_requires_connection() {
    let h = Harness::new(SimulatedDevice::new());

    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, Error::NotConnected);
    assert_eq!(h.device.calls(), 0);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
}

#[tokio::test]
async fn test_unreachable_device_fails_connect() {
    let mut h = Harness::new(SimulatedDevice::new().unreachable());

    let err = h.orchestrator.connect(device()).await.unwrap_err();

    assert!(matches!(err, Error::Connection(_)));
    assert!(h.orchestrator.connected_device().is_none());
    assert!(matches!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::Connection,
            ..
        }
    ));
    let names: Vec<&str> = states(&h.drain()).iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["connecting", "failed"]);
}

#[tokio::test]
async fn test_connect_reports_title_count() {
    let mut h = Harness::new(SimulatedDevice::new());

    h.orchestrator.connect(device()).await.unwrap();

    assert_eq!(
        h.orchestrator.state(),
        OrchestratorState::Connected { title_count: 3 }
    );
    assert_eq!(
        h.orchestrator.connected_device().map(|d| d.addr),
        Some(device().addr)
    );
    assert!(h.drain().contains(&TransferEvent::Status(
        "Connected to Living Room at 10.0.0.5:8080 (3 titles available)".to_string()
    )));
}

#[tokio::test]
async fn test_disconnect_returns_to_idle() {
    let mut h = Harness::new(SimulatedDevice::new());
    h.orchestrator.connect(device()).await.unwrap();
    h.drain();

    h.orchestrator.disconnect();

    assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    assert!(h.orchestrator.connected_device().is_none());
    assert_eq!(
        h.drain(),
        vec![
            TransferEvent::State(OrchestratorState::Idle),
            TransferEvent::Status("Disconnected from device".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_device_stays_connected_after_a_workflow() {
    let h = Harness::new(
        SimulatedDevice::new()
            .with_status_script(vec![ScriptedStatus::completed(3)])
            .with_payload(b"rom".to_vec()),
    );
    h.orchestrator.connect(device()).await.unwrap();

    for _ in 0..2 {
        h.orchestrator
            .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
            .await
            .unwrap();
    }

    assert!(h.orchestrator.connected_device().is_some());
    assert_eq!(std::fs::read(h.output()).unwrap(), b"rom");
}

#[tokio::test]
async fn test_status_regression_fails_workflow() {
    let h = Harness::new(SimulatedDevice::new().with_status_script(vec![
        ScriptedStatus::in_progress(10, 100),
        ScriptedStatus::pending(),
    ]));
    h.orchestrator.connect(device()).await.unwrap();

    let err = h
        .orchestrator
        .extract_and_fetch(&title(), &h.target(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::Protocol(m) if m.contains("InProgress to Pending")));
    assert!(matches!(
        h.orchestrator.state(),
        OrchestratorState::Failed {
            kind: FailureKind::Request,
            ..
        }
    ));
    assert!(dir_is_empty(h.spool_dir.path()));
}

#[tokio::test]
async fn test_disconnect_cancels_inflight_workflow() {
    let mut h = Harness::new(
        SimulatedDevice::new().with_status_script(vec![ScriptedStatus::in_progress(1, 100)]),
    );
    h.orchestrator.connect(device()).await.unwrap();

    let workflow_title = title();
    let workflow_target = h.target();
    let workflow = h
        .orchestrator
        .extract_and_fetch(&workflow_title, &workflow_target, CancellationToken::new());
    let disconnect = async {
        while !h.orchestrator.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.orchestrator.disconnect();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(workflow, disconnect)
    })
    .await
    .expect("disconnect did not end the workflow");

    assert_eq!(result.unwrap_err(), Error::Cancelled);
    // Late writes from the cancelled run are discarded
    assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    assert!(h.orchestrator.connected_device().is_none());
    assert!(!h.orchestrator.is_busy());
    assert!(dir_is_empty(h.spool_dir.path()));

    let states = states(&h.drain());
    assert_eq!(states.last(), Some(&OrchestratorState::Idle));
    assert!(
        !states
            .iter()
            .any(|s| matches!(s, OrchestratorState::Failed { .. }))
    );
}
