pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod registry;

pub use client::{DeviceClient, Download, ExtractionRequest};
pub use codec::{CodecError, PayloadCodec, Platform, RawCodec};
pub use discovery::{DiscoveryAdapter, DiscoveryStatus, add_device_manually, parse_reply};
pub use error::{Error, FailureKind, Result};
pub use events::{EventSink, FanoutSink, NullSink, TracingSink, TransferEvent};
pub use models::{Device, SessionStatus, Title, TitleKind, TransferSession};
pub use orchestrator::{
    FetchOutcome, FetchTarget, OrchestratorState, TransferConfig, TransferOrchestrator,
};
pub use progress::ProgressReader;
pub use registry::{DeviceRegistry, RegistryEvent};
