// Chunked media upload: INIT -> APPEND* -> FINALIZE -> (STATUS poll)*.
//
// - `session`: the upload session and its ordering invariants.
// - `pipeline`: drives the phases against the gateway.
// - this file: shared types, media type detection and the error enum.

pub mod pipeline;
pub mod session;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::api::GatewayError;

pub use pipeline::{MediaUploader, UploadOptions, UploadProgress};
pub use session::{Phase, UploadSession};

/// Category hint sent with INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    TweetImage,
    TweetVideo,
    TweetGif,
    DmImage,
    DmVideo,
    DmGif,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::TweetImage => "tweet_image",
            MediaCategory::TweetVideo => "tweet_video",
            MediaCategory::TweetGif => "tweet_gif",
            MediaCategory::DmImage => "dm_image",
            MediaCategory::DmVideo => "dm_video",
            MediaCategory::DmGif => "dm_gif",
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tweet_image" => Ok(MediaCategory::TweetImage),
            "tweet_video" => Ok(MediaCategory::TweetVideo),
            "tweet_gif" => Ok(MediaCategory::TweetGif),
            "dm_image" => Ok(MediaCategory::DmImage),
            "dm_video" => Ok(MediaCategory::DmVideo),
            "dm_gif" => Ok(MediaCategory::DmGif),
            other => Err(format!(
                "unknown media category {other:?} (expected tweet_image, tweet_video, tweet_gif, dm_image, dm_video or dm_gif)"
            )),
        }
    }
}

/// MIME type from the file extension. Unknown extensions map to
/// `application/octet-stream`.
pub fn detect_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Server-side processing state reported by FINALIZE and STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl FromStr for ProcessingState {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingState::Pending),
            "in_progress" => Ok(ProcessingState::InProgress),
            "succeeded" => Ok(ProcessingState::Succeeded),
            "failed" => Ok(ProcessingState::Failed),
            other => Err(UploadError::UnknownProcessingState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// `processing_info` object as sent on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingInfo {
    pub state: String,
    #[serde(default)]
    pub check_after_secs: Option<u64>,
    #[serde(default)]
    pub progress_percent: Option<u8>,
    #[serde(default)]
    pub error: Option<ProcessingErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitResponse {
    pub media_id_string: String,
    #[serde(default)]
    pub expires_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeResponse {
    pub media_id_string: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("read file: {0}")]
    Read(#[source] std::io::Error),
    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: GatewayError,
    },
    #[error("segment {got} appended out of order (expected {expected})")]
    SegmentOrder { expected: u32, got: u32 },
    #[error("cannot {action} while upload is {phase}")]
    WrongPhase { action: &'static str, phase: Phase },
    #[error("appended {sent} bytes but declared {declared}")]
    SizeMismatch { declared: u64, sent: u64 },
    #[error("server reported unknown processing state {0:?}")]
    UnknownProcessingState(String),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("processing timeout after {0} attempts")]
    ProcessingTimeout(u32),
    #[error("upload cancelled")]
    Cancelled,
}
