// Error-code labels recorded on failure counters.
//
// The variants are stable label values on the `error_code` dimension of the
// upload/transcode failure series; renaming one breaks dashboards.

use std::fmt;

/// Failure classes for getting a source segment into object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentUploadError {
    Unknown,
    GenCreds,
    ObjectStorage,
    SessionEnded,
    Timeout,
}

impl SegmentUploadError {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::GenCreds => "GenCreds",
            Self::ObjectStorage => "ObjectStorage",
            Self::SessionEnded => "SessionEnded",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for SegmentUploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes for turning a source segment into transcoded renditions.
///
/// `LostSegment` is synthesised by the watchdog when a segment ages out of
/// the grace window without any recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTranscodeError {
    Unknown,
    UnknownResponse,
    Transcode,
    OrchestratorBusy,
    OrchestratorCapped,
    ParseResponse,
    ReadBody,
    NoOrchestrators,
    Download,
    SaveData,
    SessionEnded,
    Playlist,
    LostSegment,
}

impl SegmentTranscodeError {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::UnknownResponse => "UnknownResponse",
            Self::Transcode => "Transcode",
            Self::OrchestratorBusy => "OrchestratorBusy",
            Self::OrchestratorCapped => "OrchestratorCapped",
            Self::ParseResponse => "ParseResponse",
            Self::ReadBody => "ReadBody",
            Self::NoOrchestrators => "NoOrchestrators",
            Self::Download => "Download",
            Self::SaveData => "SaveData",
            Self::SessionEnded => "SessionEnded",
            Self::Playlist => "Playlist",
            Self::LostSegment => "LostSegment",
        }
    }
}

impl fmt::Display for SegmentTranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_tokens_are_stable() {
        assert_eq!(SegmentUploadError::ObjectStorage.as_str(), "ObjectStorage");
        assert_eq!(SegmentUploadError::SessionEnded.as_str(), "SessionEnded");
        assert_eq!(
            SegmentTranscodeError::NoOrchestrators.as_str(),
            "NoOrchestrators"
        );
        assert_eq!(SegmentTranscodeError::LostSegment.as_str(), "LostSegment");
        assert_eq!(
            SegmentTranscodeError::OrchestratorCapped.to_string(),
            "OrchestratorCapped"
        );
    }
}
