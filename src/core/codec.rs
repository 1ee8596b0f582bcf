//! Payload codec boundary.
//!
//! Turning a downloaded dump into console content is not done here. The
//! orchestrator hands the payload stream to a [`PayloadCodec`] together with the
//! target platform and gets back either a content blob or a [`CodecError`].

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Console the extracted content is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Nes,
    Snes,
    N64,
    /// Sega Mega Drive / Genesis
    MegaDrive,
    MasterSystem,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nes => "nes",
            Self::Snes => "snes",
            Self::N64 => "n64",
            Self::MegaDrive => "mega-drive",
            Self::MasterSystem => "master-system",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),
    #[error("payload could not be decoded: {0}")]
    Invalid(String),
    #[error("failed to read payload: {0}")]
    Io(#[from] std::io::Error),
}

/// Collaborator that turns a downloaded payload into content for a platform.
#[async_trait]
pub trait PayloadCodec: Send + Sync {
    async fn extract(
        &self,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        platform: Platform,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Returns the payload unchanged. Useful when the dump itself is the product.
#[derive(Debug, Default)]
pub struct RawCodec;

#[async_trait]
impl PayloadCodec for RawCodec {
    async fn extract(
        &self,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        _platform: Platform,
    ) -> Result<Vec<u8>, CodecError> {
        let mut content = Vec::new();
        payload.read_to_end(&mut content).await?;
        if content.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        Ok(content)
    }
}
