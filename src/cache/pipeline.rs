//! Buffer/cache pipeline
//!
//! Accumulates datagram payloads in memory and spills them to the segment
//! store in fixed-size segments. Each completed segment is registered with
//! the playback queue.
//!
//! The pipeline is owned by exactly one receiver task at a time and moves
//! back to the coordinator between play phases, so its buffer needs no lock.
//! Written keys go to a `SegmentLedger` the coordinator also holds, so
//! teardown can clean up even if a pipeline never comes back.
//!
//! ```text
//! Receiver --append()--> [buffer] --threshold--> SegmentStore
//!                                            \--> PlaybackQueue
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::storage::{SegmentKey, SegmentStore, StorageError};
use crate::audio::PlaybackQueue;
use crate::rtp::ReceiverSignals;

/// Default flush threshold in bytes
pub const DEFAULT_SEGMENT_BYTES: usize = 150_000;

// ============ Types ============

/// A persisted, queue-ready chunk of payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSegment {
    pub index: u32,
    pub key: SegmentKey,
    /// Where the store put the bytes; handed to the playback engine
    pub location: PathBuf,
    pub byte_length: usize,
}

/// Progress notifications from the pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Bytes currently held in memory for the current segment
    Buffered { index: u32, bytes: usize },
    /// A segment was persisted and registered with the queue
    SegmentReady { index: u32, bytes: usize },
    /// A store operation failed; the session continues
    StorageFailed { message: String },
}

/// Outcome of deleting a session's segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

type PipelineCallback = Box<dyn Fn(PipelineEvent) + Send + Sync>;

// ============ Ledger ============

/// Every key one session has written, shared between clones
#[derive(Debug, Clone, Default)]
pub struct SegmentLedger {
    keys: Arc<Mutex<BTreeSet<SegmentKey>>>,
}

impl SegmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: SegmentKey) {
        self.keys.lock().insert(key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Index after the highest one recorded
    pub fn next_index(&self) -> u32 {
        self.keys.lock().last().map_or(0, |key| key.index + 1)
    }

    /// Delete every recorded key from `store` and forget them
    ///
    /// Failures leave orphaned blobs behind and are only reported.
    pub fn purge<F>(&self, store: &dyn SegmentStore, mut on_error: F) -> PurgeReport
    where
        F: FnMut(&StorageError),
    {
        let keys = std::mem::take(&mut *self.keys.lock());
        let mut report = PurgeReport::default();
        for key in keys {
            match store.delete(&key) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!("{}", e);
                    on_error(&e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

// ============ Pipeline ============

pub struct BufferPipeline {
    session_id: u64,
    threshold: usize,
    buffer: Vec<u8>,
    index: u32,
    store: Arc<dyn SegmentStore>,
    queue: Arc<PlaybackQueue>,
    signals: Arc<ReceiverSignals>,
    ledger: SegmentLedger,
    callback: Option<PipelineCallback>,
}

impl std::fmt::Debug for BufferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPipeline")
            .field("session_id", &self.session_id)
            .field("threshold", &self.threshold)
            .field("buffered", &self.buffer.len())
            .field("index", &self.index)
            .field("written", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl BufferPipeline {
    /// Segment numbering continues after whatever `ledger` already holds
    pub fn new(
        session_id: u64,
        threshold: usize,
        store: Arc<dyn SegmentStore>,
        queue: Arc<PlaybackQueue>,
        signals: Arc<ReceiverSignals>,
        ledger: SegmentLedger,
    ) -> Self {
        Self {
            session_id,
            threshold: threshold.max(1),
            buffer: Vec::with_capacity(threshold),
            index: ledger.next_index(),
            store,
            queue,
            signals,
            ledger,
            callback: None,
        }
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    fn notify(&self, event: PipelineEvent) {
        if let Some(callback) = self.callback.as_ref() {
            callback(event);
        }
    }

    /// Bytes held in memory for the current segment
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Index the next completed segment will get
    pub fn segment_index(&self) -> u32 {
        self.index
    }

    /// Add payload bytes
    ///
    /// Crossing the threshold while the receiver is active completes one
    /// segment per full threshold. While the receiver is stopped the
    /// accumulated bytes are only persisted under the current key.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() >= self.threshold {
            if self.signals.is_receiving() {
                while self.buffer.len() >= self.threshold {
                    self.flush_segment();
                }
            } else {
                self.persist_partial();
            }
        }

        self.notify(PipelineEvent::Buffered {
            index: self.index,
            bytes: self.buffer.len(),
        });
    }

    /// Persist whatever is left in memory under the current key
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            self.persist_partial();
        }
    }

    /// Delete every segment this session wrote
    pub fn purge(&self) -> PurgeReport {
        let report = self.ledger.purge(self.store.as_ref(), |e| {
            self.notify(PipelineEvent::StorageFailed {
                message: e.to_string(),
            })
        });
        info!(
            "Purged session {}: {} segments deleted, {} failed",
            self.session_id, report.deleted, report.failed
        );
        report
    }

    fn current_key(&self) -> SegmentKey {
        SegmentKey::new(self.session_id, self.index)
    }

    fn flush_segment(&mut self) {
        let rest = self.buffer.split_off(self.threshold);
        let data = std::mem::replace(&mut self.buffer, rest);
        let key = self.current_key();
        self.ledger.record(key);

        match self.store.write(&key, &data) {
            Ok(location) => {
                info!("Segment {} ready: {} bytes -> {:?}", key.index, data.len(), location);
                let segment = PayloadSegment {
                    index: key.index,
                    key,
                    location,
                    byte_length: data.len(),
                };
                self.notify(PipelineEvent::SegmentReady {
                    index: key.index,
                    bytes: data.len(),
                });
                self.queue.on_segment_ready(segment);
            }
            Err(e) => {
                // The bytes are dropped; the key is not reused
                warn!("{}", e);
                self.notify(PipelineEvent::StorageFailed {
                    message: e.to_string(),
                });
            }
        }
        self.index += 1;
    }

    fn persist_partial(&mut self) {
        let key = self.current_key();
        self.ledger.record(key);
        match self.store.write(&key, &self.buffer) {
            Ok(location) => debug!(
                "Persisted partial segment {}: {} bytes -> {:?}",
                key.index,
                self.buffer.len(),
                location
            ),
            Err(e) => {
                warn!("{}", e);
                self.notify(PipelineEvent::StorageFailed {
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::audio::engine::fake::{EngineCall, RecordingEngine};
    use crate::cache::{FailingStore, MemoryStore};

    const THRESHOLD: usize = 150_000;

    struct Fixture {
        engine: Arc<RecordingEngine>,
        store: Arc<MemoryStore>,
        queue: Arc<PlaybackQueue>,
        signals: Arc<ReceiverSignals>,
        pipeline: BufferPipeline,
    }

    fn fixture(threshold: usize) -> Fixture {
        let engine = Arc::new(RecordingEngine::new());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(PlaybackQueue::new(engine.clone()));
        let signals = Arc::new(ReceiverSignals::default());
        signals.set_receiving(true);
        let pipeline = BufferPipeline::new(
            9987,
            threshold,
            store.clone(),
            queue.clone(),
            signals.clone(),
            SegmentLedger::new(),
        );
        Fixture {
            engine,
            store,
            queue,
            signals,
            pipeline,
        }
    }

    #[test]
    fn test_below_threshold_only_buffers() {
        let mut f = fixture(THRESHOLD);
        f.pipeline.append(&[0; 4096]);

        assert_eq!(f.pipeline.buffered(), 4096);
        assert_eq!(f.pipeline.segment_index(), 0);
        assert!(f.store.is_empty());
        assert_eq!(f.queue.len(), 0);
    }

    #[test]
    fn test_200k_bytes_make_one_segment() {
        let mut f = fixture(THRESHOLD);
        for _ in 0..50 {
            f.pipeline.append(&[7; 4000]);
        }

        assert_eq!(f.pipeline.segment_index(), 1);
        assert_eq!(f.pipeline.buffered(), 50_000);
        assert_eq!(f.queue.len(), 1);
        let stored = f.store.get(&SegmentKey::new(9987, 0)).unwrap();
        assert_eq!(stored.len(), THRESHOLD);
        assert_eq!(
            f.engine.calls(),
            vec![
                EngineCall::Load(PathBuf::from("cache-9987-0.mp3")),
                EngineCall::PlayImmediately,
            ]
        );
    }

    #[test]
    fn test_segment_count_is_floor_of_total() {
        let threshold = 1000;
        let mut f = fixture(threshold);
        let mut total = 0;
        for size in [1, 999, 333, 2500, 17, 4096, 1000, 64] {
            f.pipeline.append(&vec![1; size]);
            total += size;
        }

        assert_eq!(f.pipeline.segment_index() as usize, total / threshold);
        assert_eq!(f.pipeline.buffered(), total % threshold);
        for index in 0..f.pipeline.segment_index() {
            let blob = f.store.get(&SegmentKey::new(9987, index)).unwrap();
            assert_eq!(blob.len(), threshold);
        }
    }

    #[test]
    fn test_segments_keep_byte_order() {
        let mut f = fixture(4);
        f.pipeline.append(&[1, 2, 3]);
        f.pipeline.append(&[4, 5, 6, 7, 8, 9]);

        assert_eq!(f.store.get(&SegmentKey::new(9987, 0)), Some(vec![1, 2, 3, 4]));
        assert_eq!(f.store.get(&SegmentKey::new(9987, 1)), Some(vec![5, 6, 7, 8]));
        assert_eq!(f.pipeline.buffered(), 1);
    }

    #[test]
    fn test_not_receiving_persists_without_enqueue() {
        let mut f = fixture(10);
        f.signals.set_receiving(false);

        f.pipeline.append(&[1; 12]);
        assert_eq!(f.pipeline.segment_index(), 0);
        assert_eq!(f.queue.len(), 0);
        assert_eq!(f.store.get(&SegmentKey::new(9987, 0)).map(|b| b.len()), Some(12));

        // More data overwrites the same key
        f.pipeline.append(&[2; 3]);
        assert_eq!(f.store.get(&SegmentKey::new(9987, 0)).map(|b| b.len()), Some(15));
        assert_eq!(f.queue.len(), 0);

        // Once receiving again the segment is flushed exactly once
        f.signals.set_receiving(true);
        f.pipeline.append(&[3; 1]);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.pipeline.segment_index(), 1);
        assert_eq!(f.pipeline.buffered(), 6);
        assert_eq!(f.store.get(&SegmentKey::new(9987, 0)).map(|b| b.len()), Some(10));
    }

    #[test]
    fn test_finish_and_purge_remove_everything() {
        let mut f = fixture(10);
        f.pipeline.append(&[0; 25]);
        f.pipeline.finish();
        assert_eq!(f.store.len(), 3);

        let report = f.pipeline.purge();
        assert_eq!(report, PurgeReport { deleted: 3, failed: 0 });
        assert!(f.store.is_empty());
    }

    fn recording_callback(pipeline: &mut BufferPipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pipeline.set_callback(move |event| sink.lock().push(event));
        events
    }

    fn failing_pipeline(threshold: usize) -> (Arc<FailingStore>, Arc<PlaybackQueue>, BufferPipeline) {
        let engine = Arc::new(RecordingEngine::new());
        let store = Arc::new(FailingStore::new());
        let queue = Arc::new(PlaybackQueue::new(engine));
        let signals = Arc::new(ReceiverSignals::default());
        signals.set_receiving(true);
        let pipeline = BufferPipeline::new(
            9987,
            threshold,
            store.clone(),
            queue.clone(),
            signals,
            SegmentLedger::new(),
        );
        (store, queue, pipeline)
    }

    #[test]
    fn test_failed_write_skips_segment_and_continues() {
        let (store, queue, mut pipeline) = failing_pipeline(10);
        let events = recording_callback(&mut pipeline);

        store.fail_writes(true);
        pipeline.append(&[1; 10]);
        assert_eq!(pipeline.segment_index(), 1);
        assert_eq!(queue.len(), 0);
        assert!(matches!(
            events.lock().first(),
            Some(PipelineEvent::StorageFailed { message }) if message.contains("cache-9987-0.mp3")
        ));

        store.fail_writes(false);
        pipeline.append(&[2; 10]);
        assert_eq!(pipeline.segment_index(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(store.get(&SegmentKey::new(9987, 0)), None);
        assert_eq!(store.get(&SegmentKey::new(9987, 1)), Some(vec![2; 10]));
    }

    #[test]
    fn test_failed_delete_is_counted() {
        let (store, _queue, mut pipeline) = failing_pipeline(10);
        let events = recording_callback(&mut pipeline);
        pipeline.append(&[0; 20]);
        assert_eq!(store.len(), 2);

        store.fail_deletes(true);
        let report = pipeline.purge();
        assert_eq!(report, PurgeReport { deleted: 0, failed: 2 });
        assert_eq!(store.len(), 2);
        let failures = events
            .lock()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::StorageFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_ledger_purges_after_pipeline_is_lost() {
        let mut f = fixture(10);
        let ledger = SegmentLedger::new();
        let mut pipeline = BufferPipeline::new(
            9987,
            10,
            f.store.clone(),
            f.queue.clone(),
            f.signals.clone(),
            ledger.clone(),
        );
        pipeline.append(&[0; 25]);
        f.signals.set_receiving(false);
        pipeline.append(&[0; 5]);
        drop(pipeline);
        assert_eq!(f.store.len(), 3);

        // A replacement continues numbering after the lost segments
        f.signals.set_receiving(true);
        f.pipeline = BufferPipeline::new(
            9987,
            10,
            f.store.clone(),
            f.queue.clone(),
            f.signals.clone(),
            ledger.clone(),
        );
        assert_eq!(f.pipeline.segment_index(), 3);

        let report = ledger.purge(f.store.as_ref(), |_| {});
        assert_eq!(report, PurgeReport { deleted: 3, failed: 0 });
        assert!(f.store.is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_callback_reports_progress() {
        let mut f = fixture(10);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        f.pipeline
            .set_callback(move |event| sink.lock().push(format!("{:?}", event)));

        f.pipeline.append(&[0; 12]);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("SegmentReady"));
        assert!(events[1].starts_with("Buffered"));
    }
}
