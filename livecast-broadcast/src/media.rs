use bytes::Bytes;

/// One rendition to produce per source segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub bitrate: u32,
    pub fps: u32,
    pub resolution: String,
}

impl Profile {
    #[must_use]
    pub fn new(name: &str, bitrate: u32, fps: u32, resolution: &str) -> Self {
        Self {
            name: name.to_string(),
            bitrate,
            fps,
            resolution: resolution.to_string(),
        }
    }

    /// Comma-joined profile names, used as the `profiles` metric label.
    #[must_use]
    pub fn names(profiles: &[Profile]) -> String {
        profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A short slice of source media identified by its sequence number.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub seq_no: u64,
    pub data: Bytes,
    pub duration_secs: f64,
}

impl MediaSegment {
    #[must_use]
    pub fn new(seq_no: u64, data: Bytes, duration_secs: f64) -> Self {
        Self {
            seq_no,
            data,
            duration_secs,
        }
    }
}
