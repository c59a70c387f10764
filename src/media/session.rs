// Upload session bookkeeping. Tracks which segment index comes next and
// how many bytes have gone out, and refuses appends once finalized.

use std::fmt;

use super::{MediaCategory, UploadError};

/// Phase of the upload protocol. Also names the failing step in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Append,
    Finalize,
    Status,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Append => "APPEND",
            Phase::Finalize => "FINALIZE",
            Phase::Status => "STATUS",
        };
        f.write_str(name)
    }
}

/// State of one upload between INIT and FINALIZE.
///
/// Segment indices must go `0, 1, 2, ...` without gaps or repeats; once
/// finalized the session accepts no more appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    media_id: String,
    total_bytes: u64,
    media_type: String,
    category: Option<MediaCategory>,
    next_segment: u32,
    bytes_sent: u64,
    phase: Phase,
}

impl UploadSession {
    /// Start a session from a successful INIT.
    pub fn new(
        media_id: impl Into<String>,
        total_bytes: u64,
        media_type: impl Into<String>,
        category: Option<MediaCategory>,
    ) -> Self {
        UploadSession {
            media_id: media_id.into(),
            total_bytes,
            media_type: media_type.into(),
            category,
            next_segment: 0,
            bytes_sent: 0,
            phase: Phase::Init,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn category(&self) -> Option<MediaCategory> {
        self.category
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index the next APPEND must carry.
    pub fn next_segment(&self) -> u32 {
        self.next_segment
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Check that `index` is the next segment before it is sent.
    pub fn check_append(&self, index: u32) -> Result<(), UploadError> {
        if !matches!(self.phase, Phase::Init | Phase::Append) {
            return Err(UploadError::WrongPhase {
                action: "append",
                phase: self.phase,
            });
        }
        if index != self.next_segment {
            return Err(UploadError::SegmentOrder {
                expected: self.next_segment,
                got: index,
            });
        }
        Ok(())
    }

    /// Record a successful APPEND of `len` bytes at `index`.
    pub fn record_append(&mut self, index: u32, len: usize) -> Result<(), UploadError> {
        self.check_append(index)?;
        self.phase = Phase::Append;
        self.next_segment += 1;
        self.bytes_sent += len as u64;
        Ok(())
    }

    /// Verify every declared byte was sent before FINALIZE is issued.
    pub fn check_complete(&self) -> Result<(), UploadError> {
        if self.bytes_sent != self.total_bytes {
            return Err(UploadError::SizeMismatch {
                declared: self.total_bytes,
                sent: self.bytes_sent,
            });
        }
        Ok(())
    }

    /// Mark the session finalized. No further appends are accepted.
    pub fn finalize(&mut self) -> Result<(), UploadError> {
        if self.phase == Phase::Finalize || self.phase == Phase::Status {
            return Err(UploadError::WrongPhase {
                action: "finalize",
                phase: self.phase,
            });
        }
        self.check_complete()?;
        self.phase = Phase::Finalize;
        Ok(())
    }

    pub fn start_polling(&mut self) {
        self.phase = Phase::Status;
    }
}
