use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// The library error taxonomy. A single malformed packet never takes the
/// pipeline down: stages record the error to their sink and proceed.
#[derive(Debug, Error)]
pub enum FisbError {
    #[error("line format: {0}")]
    LineFormat(String),
    #[error("FEC failure, rs={0}")]
    Fec(i32),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("decode: {0}")]
    Decode(String),
    #[error("unknown product id {0}")]
    UnknownProduct(u16),
    #[error("reserved bits set in frame type {0}")]
    ReservedBits(u8),
    #[error("dlac: {0}")]
    Dlac(String),
    #[error("no time candidate within window for {product}: {detail}")]
    TimeReconstruction { product: &'static str, detail: String },
    #[error("segment timeout for report {0}")]
    SegmentTimeout(u16),
    #[error("orphan graphics record {0}")]
    TwgoOrphan(String),
    #[error("image block: {0}")]
    ImageBlock(String),
    #[error("malformed report text: {0}")]
    ReportText(String),
}

impl From<deku::DekuError> for FisbError {
    fn from(e: deku::DekuError) -> Self {
        FisbError::Decode(e.to_string())
    }
}

impl FisbError {
    /// The counter this error bumps in its stage's sink
    pub fn counter(&self) -> &'static str {
        match self {
            Self::LineFormat(_) => "line_format",
            Self::Fec(_) => "fec",
            Self::Truncated(_) => "truncated",
            Self::Decode(_) => "decode",
            Self::UnknownProduct(_) => "unknown_product",
            Self::ReservedBits(_) => "reserved_bits",
            Self::Dlac(_) => "dlac",
            Self::TimeReconstruction { .. } => "time_reconstruction",
            Self::SegmentTimeout(_) => "segment_timeout",
            Self::TwgoOrphan(_) => "twgo_orphan",
            Self::ImageBlock(_) => "image_block",
            Self::ReportText(_) => "report_text",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorRecord<'a> {
    time: DateTime<Utc>,
    error: String,
    counter: &'static str,
    context: &'a str,
}

/// Append-only per-stage error file, truncated at stage start. A non-empty
/// error file is the sole failure signal a stage surfaces.
#[derive(Debug)]
pub struct ErrorSink {
    file: Option<std::fs::File>,
    counters: BTreeMap<&'static str, u64>,
}

impl ErrorSink {
    /// Open (and truncate) `<dir>/<stage>.err`
    pub fn open(dir: &Path, stage: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(dir.join(format!("{stage}.err")))?;
        Ok(ErrorSink {
            file: Some(file),
            counters: BTreeMap::new(),
        })
    }

    /// A sink that only counts, for in-process use without a directory
    pub fn memory() -> Self {
        ErrorSink {
            file: None,
            counters: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, error: &FisbError, context: &str) {
        let counter = error.counter();
        *self.counters.entry(counter).or_insert(0) += 1;
        tracing::debug!(%error, context, "packet dropped");
        if let Some(file) = &mut self.file {
            let record = ErrorRecord {
                time: Utc::now(),
                error: error.to_string(),
                counter,
                context,
            };
            if let Ok(json) = serde_json::to_string(&record) {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    /// Bump a counter without writing a record (dropped UAT downlinks)
    pub fn bump(&mut self, counter: &'static str) {
        *self.counters.entry(counter).or_insert(0) += 1;
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_counts_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ErrorSink::open(dir.path(), "l0").unwrap();
        sink.record(&FisbError::UnknownProduct(999), "+abcd...");
        sink.record(&FisbError::UnknownProduct(998), "+abce...");
        sink.bump("uat_downlink");
        assert_eq!(sink.count("unknown_product"), 2);
        assert_eq!(sink.total(), 3);
        let contents = std::fs::read_to_string(dir.path().join("l0.err")).unwrap();
        assert_eq!(contents.lines().count(), 2);

        // Reopening truncates: error files are cleared at stage start
        let _sink = ErrorSink::open(dir.path(), "l0").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("l0.err")).unwrap();
        assert!(contents.is_empty());
    }
}
