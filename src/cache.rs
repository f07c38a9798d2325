//! Segment cache module
//!
//! - `storage`: addressable segment store (`DiskStore`, and `MemoryStore` in tests)
//! - `pipeline`: turns payload bytes into fixed-size, queue-ready segments

pub mod pipeline;
pub mod storage;

pub use pipeline::{
    BufferPipeline, DEFAULT_SEGMENT_BYTES, PayloadSegment, PipelineEvent, PurgeReport,
    SegmentLedger,
};
#[cfg(test)]
pub use storage::{FailingStore, MemoryStore};
pub use storage::{DiskStore, SegmentKey, SegmentStore, StorageError};
