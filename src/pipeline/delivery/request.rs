use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use super::DeliveryError;
use crate::constants::{content_type_for_extension, ASSET_DIR};
use crate::types::{NormalizedEvent, RequestId};

/// Binary content to be stored on the backend
#[derive(Clone)]
pub struct AssetUpload {
    /// Path the backend files the asset under, e.g. `img/capture.jpg`
    pub logical_path: String,
    pub content_type: String,
    pub public: bool,
    pub bytes: Vec<u8>,
    /// Local origin, kept so a failed upload can be resubmitted
    pub source_file: Option<PathBuf>,
}

impl AssetUpload {
    pub fn new(
        logical_path: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            logical_path: logical_path.into(),
            content_type: content_type.into(),
            public: true,
            bytes,
            source_file: None,
        }
    }

    /// Read an image from disk, filing it under the asset directory by its file name
    pub async fn from_file(path: &Path) -> io::Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?;
        let content_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(content_type_for_extension)
            .unwrap_or(crate::constants::FALLBACK_CONTENT_TYPE);
        let bytes = tokio::fs::read(path).await?;

        let mut asset = Self::new(format!("{ASSET_DIR}/{file_name}"), content_type, bytes);
        asset.source_file = Some(path.to_path_buf());
        Ok(asset)
    }

    /// Hex SHA-256 of the content, used to correlate uploads in logs
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

impl fmt::Debug for AssetUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetUpload")
            .field("logical_path", &self.logical_path)
            .field("content_type", &self.content_type)
            .field("public", &self.public)
            .field("len", &self.bytes.len())
            .field("source_file", &self.source_file)
            .finish()
    }
}

/// One unit of delivery work; consumed by the client exactly once
#[derive(Debug, Clone)]
pub enum DeliveryRequest {
    PublishEvent { id: RequestId, event: NormalizedEvent },
    UploadAsset { id: RequestId, asset: AssetUpload },
}

impl DeliveryRequest {
    pub fn id(&self) -> RequestId {
        match self {
            DeliveryRequest::PublishEvent { id, .. } | DeliveryRequest::UploadAsset { id, .. } => {
                *id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryRequest::PublishEvent { .. } => "publish_event",
            DeliveryRequest::UploadAsset { .. } => "upload_asset",
        }
    }
}

/// Terminal result of a delivery request
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered {
        id: RequestId,
        attempts: u32,
        /// Where an uploaded asset can be fetched
        asset_url: Option<String>,
    },
    Failed {
        request: DeliveryRequest,
        attempts: u32,
        error: DeliveryError,
    },
    /// The asset was stored but its metadata event was not published
    AssetStoredMetadataPending {
        id: RequestId,
        asset_url: String,
        metadata: NormalizedEvent,
        error: DeliveryError,
    },
    /// Shutdown grace expired before the request could finish
    Abandoned { request: DeliveryRequest },
}

impl DeliveryOutcome {
    pub fn id(&self) -> RequestId {
        match self {
            DeliveryOutcome::Delivered { id, .. }
            | DeliveryOutcome::AssetStoredMetadataPending { id, .. } => *id,
            DeliveryOutcome::Failed { request, .. } | DeliveryOutcome::Abandoned { request } => {
                request.id()
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered {
                id,
                attempts,
                asset_url: Some(url),
            } => write!(f, "{id} delivered after {attempts} attempt(s), asset at {url}"),
            DeliveryOutcome::Delivered { id, attempts, .. } => {
                write!(f, "{id} delivered after {attempts} attempt(s)")
            }
            DeliveryOutcome::Failed {
                request,
                attempts,
                error,
            } => write!(
                f,
                "{} {} failed after {attempts} attempt(s): {error}",
                request.id(),
                request.kind()
            ),
            DeliveryOutcome::AssetStoredMetadataPending {
                id,
                asset_url,
                error,
                ..
            } => write!(f, "{id} asset stored at {asset_url}, metadata pending: {error}"),
            DeliveryOutcome::Abandoned { request } => {
                write!(f, "{} {} abandoned at shutdown", request.id(), request.kind())
            }
        }
    }
}
