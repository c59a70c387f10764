// Upload pipeline. Phases run strictly in order and nothing is retried:
// the first failure aborts the whole upload and names the phase. Chunks
// are read and sent one at a time; the server assembles segments by index
// so they must never be reordered or sent in parallel.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::session::{Phase, UploadSession};
use super::{
    detect_media_type, FinalizeResponse, InitResponse, MediaCategory, ProcessingState,
    StatusResponse, UploadError,
};
use crate::api::{ApiResponse, Gateway, GatewayError, Payload, Query};
use crate::cancel::{CancelToken, Wait};
use crate::config::Config;

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_POLLS: u32 = 60;
pub const DEFAULT_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub chunk_size: usize,
    /// STATUS calls allowed before giving up.
    pub max_polls: u32,
    /// Poll interval when the server does not suggest one.
    pub default_recheck: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_polls: DEFAULT_MAX_POLLS,
            default_recheck: DEFAULT_RECHECK,
        }
    }
}

/// Observer for upload progress. Every method has a no-op default.
pub trait UploadProgress {
    fn phase_started(&mut self, _phase: Phase) {}

    fn segment_sent(&mut self, _session: &UploadSession) {}

    fn processing(&mut self, _state: ProcessingState, _percent: Option<u8>) {}
}

/// Progress observer that ignores everything.
pub struct Quiet;

impl UploadProgress for Quiet {}

pub struct MediaUploader<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    upload_url: String,
    options: UploadOptions,
    cancel: CancelToken,
}

impl<'a, G: Gateway + ?Sized> MediaUploader<'a, G> {
    pub fn new(gateway: &'a G, config: &Config, cancel: CancelToken) -> Self {
        MediaUploader {
            gateway,
            upload_url: config.upload_url.clone(),
            options: UploadOptions::default(),
            cancel,
        }
    }

    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }

    /// Upload `path` and return the remote media id.
    pub fn upload_file(
        &self,
        path: &Path,
        category: Option<MediaCategory>,
    ) -> Result<String, UploadError> {
        self.upload_file_with_progress(path, category, &mut Quiet)
    }

    pub fn upload_file_with_progress(
        &self,
        path: &Path,
        category: Option<MediaCategory>,
        progress: &mut dyn UploadProgress,
    ) -> Result<String, UploadError> {
        let mut file = File::open(path).map_err(|source| UploadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let total_bytes = file.metadata().map_err(UploadError::Read)?.len();
        let media_type = detect_media_type(path);
        self.ensure_not_cancelled()?;

        progress.phase_started(Phase::Init);
        let init = self.init(total_bytes, media_type, category)?;
        let mut session = UploadSession::new(init.media_id_string, total_bytes, media_type, category);
        tracing::info!(
            media_id = session.media_id(),
            total_bytes = session.total_bytes(),
            media_type = session.media_type(),
            category = ?session.category(),
            "upload initialized"
        );

        progress.phase_started(Phase::Append);
        self.append_all(&mut file, &mut session, progress)?;

        session.check_complete()?;
        self.ensure_not_cancelled()?;
        progress.phase_started(Phase::Finalize);
        let finalized = self.finalize(session.media_id())?;
        session.finalize()?;

        if let Some(info) = &finalized.processing_info {
            tracing::info!(state = %info.state, "waiting for server-side processing");
            session.start_polling();
            progress.phase_started(Phase::Status);
            self.wait_for_processing(session.media_id(), progress)?;
        }

        Ok(finalized.media_id_string)
    }

    fn ensure_not_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    fn command(&self, phase: Phase, payload: Payload) -> Result<ApiResponse, UploadError> {
        self.gateway
            .post(&self.upload_url, payload, &Query::new())
            .and_then(|res| res.error_for_status())
            .map_err(|source| UploadError::Phase { phase, source })
    }

    fn init(
        &self,
        total_bytes: u64,
        media_type: &str,
        category: Option<MediaCategory>,
    ) -> Result<InitResponse, UploadError> {
        let mut fields = vec![
            ("command".to_string(), "INIT".to_string()),
            ("total_bytes".to_string(), total_bytes.to_string()),
            ("media_type".to_string(), media_type.to_string()),
        ];
        if let Some(category) = category {
            fields.push(("media_category".into(), category.as_str().into()));
        }
        self.command(Phase::Init, Payload::Form(fields))?
            .json()
            .map_err(|source| UploadError::Phase {
                phase: Phase::Init,
                source,
            })
    }

    /// Read the file in `chunk_size` pieces and APPEND each one in order.
    fn append_all(
        &self,
        file: &mut File,
        session: &mut UploadSession,
        progress: &mut dyn UploadProgress,
    ) -> Result<(), UploadError> {
        let chunk_size = self.options.chunk_size.max(1);
        let mut index: u32 = 0;
        loop {
            self.ensure_not_cancelled()?;

            // Fill the chunk completely unless the file ends first, so only
            // the last segment can be short.
            let mut chunk = Vec::with_capacity(chunk_size);
            let read = file
                .by_ref()
                .take(chunk_size as u64)
                .read_to_end(&mut chunk)
                .map_err(UploadError::Read)?;
            if read == 0 {
                return Ok(());
            }

            session.check_append(index)?;
            let payload = Payload::Multipart {
                fields: vec![
                    ("command".into(), "APPEND".into()),
                    ("media_id".into(), session.media_id().to_string()),
                    ("segment_index".into(), index.to_string()),
                ],
                file_field: "media".into(),
                file_name: "chunk".into(),
                bytes: chunk,
            };
            self.command(Phase::Append, payload)?;
            session.record_append(index, read)?;
            tracing::debug!(segment = index, bytes = read, "segment appended");
            index += 1;
            progress.segment_sent(session);
        }
    }

    fn finalize(&self, media_id: &str) -> Result<FinalizeResponse, UploadError> {
        let fields = vec![
            ("command".to_string(), "FINALIZE".to_string()),
            ("media_id".to_string(), media_id.to_string()),
        ];
        self.command(Phase::Finalize, Payload::Form(fields))?
            .json()
            .map_err(|source| UploadError::Phase {
                phase: Phase::Finalize,
                source,
            })
    }

    fn status(&self, media_id: &str) -> Result<StatusResponse, UploadError> {
        let mut query = Query::new();
        query.insert("command".into(), "STATUS".into());
        query.insert("media_id".into(), media_id.into());
        let fetch = || -> Result<StatusResponse, GatewayError> {
            self.gateway
                .get(&self.upload_url, &query)?
                .error_for_status()?
                .json()
        };
        fetch().map_err(|source| UploadError::Phase {
            phase: Phase::Status,
            source,
        })
    }

    /// Poll STATUS until the server reports a terminal state.
    fn wait_for_processing(
        &self,
        media_id: &str,
        progress: &mut dyn UploadProgress,
    ) -> Result<(), UploadError> {
        let max_polls = self.options.max_polls.max(1);
        for attempt in 1..=max_polls {
            let status = self.status(media_id)?;
            // No processing info left means there is nothing to wait for.
            let Some(info) = status.processing_info else {
                return Ok(());
            };
            let state: ProcessingState = info.state.parse()?;
            progress.processing(state, info.progress_percent);
            tracing::debug!(attempt, ?state, percent = ?info.progress_percent, "processing status");

            match state {
                ProcessingState::Succeeded => return Ok(()),
                ProcessingState::Failed => {
                    let message = info
                        .error
                        .map(|e| e.message)
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "no error details".to_string());
                    return Err(UploadError::ProcessingFailed(message));
                }
                ProcessingState::Pending | ProcessingState::InProgress => {}
            }

            if attempt == max_polls {
                break;
            }
            let wait = info
                .check_after_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(self.options.default_recheck);
            if self.cancel.wait(wait) == Wait::Cancelled {
                return Err(UploadError::Cancelled);
            }
        }
        Err(UploadError::ProcessingTimeout(max_polls))
    }
}
