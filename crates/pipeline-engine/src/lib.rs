//! A reader -> processor -> writer chunk loop with chunk-level transactional
//! boundaries, per-item skip/retry policy, and a cooperative stop protocol
//! (spec.md §4.3). Generalizes the checkpoint indexing pipeline: a
//! `Reader` replaces the blockchain `CheckpointReader`, a `Processor`
//! replaces `Worker::process_checkpoint`, and a `Writer` replaces
//! `Reducer::commit`, but the retry/backoff/shutdown machinery is the same
//! shape.

mod retry;

pub use retry::{ErrorClass, RetryPolicy};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// An error that can be routed to the retry policy. Implementors classify
/// their own failures rather than the engine guessing from error content.
pub trait ClassifiedError: std::error::Error + Send + Sync + 'static {
    fn class(&self) -> ErrorClass;
}

#[async_trait]
pub trait Reader<Item>: Send {
    type Error: ClassifiedError;

    /// Returns up to `max` items. An empty return signals end-of-stream;
    /// returning fewer than `max` without ending the stream is allowed (the
    /// engine will call again on the next step).
    async fn read_chunk(&mut self, max: usize) -> Result<Vec<Item>, Self::Error>;
}

#[async_trait]
pub trait Processor<Item, Out>: Send + Sync {
    type Error: ClassifiedError;

    /// `Ok(None)` drops the item silently — it counts toward neither
    /// `written` nor `skipped` (spec.md §4.3 step 2).
    async fn process(&self, item: Item) -> Result<Option<Out>, Self::Error>;
}

#[async_trait]
pub trait Writer<Out>: Send + Sync {
    type Error: ClassifiedError;

    /// Commits a whole chunk atomically. A partial failure must fail the
    /// entire call; the engine does not inspect which elements succeeded.
    async fn write(&self, chunk: Vec<Out>) -> Result<(), Self::Error>;
}

/// Controls how items within a chunk are run through the processor.
/// `Sequential` is what the Embedding Pipeline configures itself with
/// (spec.md §4.6); `Parallel(n)` fans out bounded-concurrency workers over
/// the chunk, one future per item up to the given limit.
#[derive(Debug, Clone, Copy)]
pub enum TaskExecutor {
    Sequential,
    Parallel(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub read: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineReport {
    pub status: EngineStatus,
    pub counters: EngineCounters,
}

/// Ready-made `ClassifiedError` for callers that don't need a bespoke error
/// type — most `Reader`/`Writer` adapters over an external system (Postgres,
/// Redis, an HTTP collaborator) just need a message and a class.
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct EngineError {
    pub class: ErrorClass,
    pub message: String,
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Validation,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
        }
    }
}

impl ClassifiedError for EngineError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

pub struct JobSpec<R, P, W> {
    pub reader: R,
    pub processor: P,
    pub writer: W,
    pub chunk_size: usize,
    pub skip_limit: u64,
    pub retry_policy: RetryPolicy,
    pub task_executor: TaskExecutor,
    pub stop_token: CancellationToken,
}

/// Aggregated result of running one chunk through the processor:
/// `succeeded` feeds the writer, `skipped` folds into both the
/// `skipped`/`failed` counters (spec.md §4.3), and `fatal` — set only
/// when a processor error classifies as `ErrorClass::Fatal` — tells `run`
/// to terminate the whole step FAILED without writing anything from this
/// chunk (spec.md §7 "Fatal ... Terminates the engine").
struct ProcessedChunk<Item, Out> {
    succeeded: Vec<(Item, Out)>,
    skipped: u64,
    fatal: Option<String>,
}

enum ItemOutcome<Out> {
    Success(Out),
    Skipped,
    Fatal(String),
}

pub struct ChunkEngine;

impl ChunkEngine {
    /// Runs the six-step algorithm of spec.md §4.3 to completion.
    pub async fn run<Item, Out, R, P, W>(mut spec: JobSpec<R, P, W>) -> EngineReport
    where
        Item: Clone + Send + 'static,
        Out: Clone + Send + 'static,
        R: Reader<Item>,
        P: Processor<Item, Out>,
        W: Writer<Out>,
    {
        let mut counters = EngineCounters::default();
        let mut backoff = spec.retry_policy.fresh_backoff();

        loop {
            let chunk = match spec.reader.read_chunk(spec.chunk_size).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    if err.class() == ErrorClass::Fatal {
                        warn!(error = %err, "reader failed fatally, terminating FAILED");
                        return EngineReport {
                            status: EngineStatus::Failed,
                            counters,
                        };
                    }
                    warn!(error = %err, "reader error, backing off and retrying chunk");
                    if Self::wait_or_stop(&mut backoff, &spec.stop_token).await {
                        return EngineReport {
                            status: EngineStatus::Stopped,
                            counters,
                        };
                    }
                    continue;
                }
            };

            if chunk.is_empty() {
                info!(?counters, "reader exhausted, step COMPLETED");
                return EngineReport {
                    status: EngineStatus::Completed,
                    counters,
                };
            }
            counters.read += chunk.len() as u64;

            let processed =
                Self::process_chunk(&spec.processor, chunk, spec.task_executor, &spec.retry_policy).await;
            counters.skipped += processed.skipped;
            counters.failed += processed.skipped;

            if let Some(message) = processed.fatal {
                warn!(error = %message, "processor failed fatally, terminating FAILED");
                return EngineReport {
                    status: EngineStatus::Failed,
                    counters,
                };
            }

            if counters.skipped > spec.skip_limit {
                warn!(
                    skip_limit = spec.skip_limit,
                    skipped = counters.skipped,
                    "skip_limit exceeded, terminating FAILED"
                );
                return EngineReport {
                    status: EngineStatus::Failed,
                    counters,
                };
            }

            let outs: Vec<Out> = processed.succeeded.iter().map(|(_, out)| out.clone()).collect();

            let write_result = spec.writer.write(outs).await;
            match write_result {
                Ok(()) => {
                    counters.written += processed.succeeded.len() as u64;
                    backoff.reset();
                }
                Err(err) => {
                    warn!(error = %err, "chunk write failed, falling back to item-level retry");
                    let (written, skipped) = Self::retry_items(
                        &spec.processor,
                        &spec.writer,
                        processed.succeeded,
                        &spec.retry_policy,
                    )
                    .await;
                    counters.written += written;
                    counters.skipped += skipped;
                    counters.failed += skipped;

                    if counters.skipped > spec.skip_limit {
                        warn!(
                            skip_limit = spec.skip_limit,
                            skipped = counters.skipped,
                            "skip_limit exceeded, terminating FAILED"
                        );
                        return EngineReport {
                            status: EngineStatus::Failed,
                            counters,
                        };
                    }
                }
            }

            if spec.stop_token.is_cancelled() {
                info!(?counters, "cooperative stop observed at chunk boundary");
                return EngineReport {
                    status: EngineStatus::Stopped,
                    counters,
                };
            }
        }
    }

    async fn process_chunk<Item, Out, P>(
        processor: &P,
        chunk: Vec<Item>,
        executor: TaskExecutor,
        policy: &RetryPolicy,
    ) -> ProcessedChunk<Item, Out>
    where
        Item: Clone + Send + 'static,
        Out: Clone + Send + 'static,
        P: Processor<Item, Out>,
    {
        let results: Vec<(Item, ItemOutcome<Out>)> = match executor {
            TaskExecutor::Sequential => {
                let mut results = Vec::with_capacity(chunk.len());
                for item in chunk {
                    let outcome = Self::process_one(processor, &item, policy).await;
                    results.push((item, outcome));
                }
                results
            }
            TaskExecutor::Parallel(concurrency) => {
                use futures::stream::{self, StreamExt};
                stream::iter(chunk)
                    .map(|item| async move {
                        let outcome = Self::process_one(processor, &item, policy).await;
                        (item, outcome)
                    })
                    .buffer_unordered(concurrency.max(1))
                    .collect()
                    .await
            }
        };

        let mut succeeded = Vec::new();
        let mut skipped = 0u64;
        let mut fatal = None;
        for (item, outcome) in results {
            match outcome {
                ItemOutcome::Success(out) => succeeded.push((item, out)),
                ItemOutcome::Skipped => skipped += 1,
                ItemOutcome::Fatal(message) => {
                    if fatal.is_none() {
                        fatal = Some(message);
                    }
                }
            }
        }

        ProcessedChunk {
            succeeded,
            skipped,
            fatal,
        }
    }

    /// Runs one item through the processor, retrying `Transient` failures
    /// with the item backoff schedule, skipping `Validation` failures
    /// immediately, and reporting `Fatal` failures up to the caller
    /// (spec.md §7's error taxonomy, same policy `retry_items` applies on
    /// the writer side).
    async fn process_one<Item, Out, P>(
        processor: &P,
        item: &Item,
        policy: &RetryPolicy,
    ) -> ItemOutcome<Out>
    where
        Item: Clone + Send + 'static,
        Out: Clone + Send + 'static,
        P: Processor<Item, Out>,
    {
        let mut attempts = 0u32;
        loop {
            match processor.process(item.clone()).await {
                Ok(Some(out)) => return ItemOutcome::Success(out),
                Ok(None) => return ItemOutcome::Skipped,
                Err(err) => match err.class() {
                    ErrorClass::Validation => {
                        warn!(error = %err, "item failed validation, skipping");
                        return ItemOutcome::Skipped;
                    }
                    ErrorClass::Fatal => {
                        warn!(error = %err, "item processing failed fatally");
                        return ItemOutcome::Fatal(err.to_string());
                    }
                    ErrorClass::Transient => {
                        attempts += 1;
                        if attempts > policy.max_retries {
                            warn!(error = %err, attempts, "item retries exhausted, skipping");
                            return ItemOutcome::Skipped;
                        }
                        tokio::time::sleep(policy.item_backoff(attempts)).await;
                    }
                },
            }
        }
    }

    /// Items that survived processing but whose chunk write failed. Retries
    /// each item's process+write individually; exhausted retries count as
    /// skipped (spec.md §4.3 steps 4-5).
    async fn retry_items<Item, Out, P, W>(
        processor: &P,
        writer: &W,
        items: Vec<(Item, Out)>,
        policy: &RetryPolicy,
    ) -> (u64, u64)
    where
        Item: Clone + Send + 'static,
        Out: Clone + Send + 'static,
        P: Processor<Item, Out>,
        W: Writer<Out>,
    {
        let mut written = 0u64;
        let mut skipped = 0u64;

        for (item, out) in items {
            let mut attempt_out = out;
            let mut attempts = 0u32;
            let mut succeeded = false;

            loop {
                match writer.write(vec![attempt_out.clone()]).await {
                    Ok(()) => {
                        written += 1;
                        succeeded = true;
                        break;
                    }
                    Err(err) if err.class() == ErrorClass::Validation => {
                        warn!(error = %err, "item failed validation, skipping");
                        break;
                    }
                    Err(err) => {
                        attempts += 1;
                        if attempts > policy.max_retries {
                            warn!(error = %err, attempts, "item retries exhausted, skipping");
                            break;
                        }
                        tokio::time::sleep(policy.item_backoff(attempts)).await;
                        match processor.process(item.clone()).await {
                            Ok(Some(reprocessed)) => attempt_out = reprocessed,
                            Ok(None) => break,
                            Err(_) => continue,
                        }
                    }
                }
            }

            if !succeeded {
                skipped += 1;
            }
        }

        (written, skipped)
    }

    /// Waits out one backoff interval, returning `true` if cancellation won
    /// the race (caller should terminate STOPPED instead of retrying).
    async fn wait_or_stop(
        backoff: &mut backoff::ExponentialBackoff,
        token: &CancellationToken,
    ) -> bool {
        let duration = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
        tokio::time::timeout(duration, token.cancelled())
            .await
            .is_ok()
    }
}

impl fmt::Debug for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineStatus::Completed => "COMPLETED",
            EngineStatus::Failed => "FAILED",
            EngineStatus::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct TestError {
        message: String,
        class: ErrorClass,
    }

    impl ClassifiedError for TestError {
        fn class(&self) -> ErrorClass {
            self.class
        }
    }

    struct VecReader {
        items: std::vec::IntoIter<i32>,
    }

    #[async_trait]
    impl Reader<i32> for VecReader {
        type Error = TestError;
        async fn read_chunk(&mut self, max: usize) -> Result<Vec<i32>, TestError> {
            Ok((&mut self.items).take(max).collect())
        }
    }

    struct IdentityProcessor;

    #[async_trait]
    impl Processor<i32, i32> for IdentityProcessor {
        type Error = TestError;
        async fn process(&self, item: i32) -> Result<Option<i32>, TestError> {
            Ok(Some(item))
        }
    }

    /// Fails writes for any chunk containing `bad_value`, always with a
    /// Validation-class error (so retries are exhausted immediately).
    struct RejectingWriter {
        bad_value: i32,
        written: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Writer<i32> for RejectingWriter {
        type Error = TestError;
        async fn write(&self, chunk: Vec<i32>) -> Result<(), TestError> {
            if chunk.contains(&self.bad_value) {
                return Err(TestError {
                    message: "bad value".into(),
                    class: ErrorClass::Validation,
                });
            }
            self.written.lock().unwrap().extend(chunk);
            Ok(())
        }
    }

    fn spec_with(
        items: Vec<i32>,
        writer: RejectingWriter,
        chunk_size: usize,
        skip_limit: u64,
    ) -> JobSpec<VecReader, IdentityProcessor, RejectingWriter> {
        JobSpec {
            reader: VecReader {
                items: items.into_iter(),
            },
            processor: IdentityProcessor,
            writer,
            chunk_size,
            skip_limit,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn completes_when_reader_is_exhausted() {
        let spec = spec_with(
            vec![1, 2, 3],
            RejectingWriter {
                bad_value: i32::MIN,
                written: Mutex::new(Vec::new()),
            },
            10,
            0,
        );
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters.read, 3);
        assert_eq!(report.counters.written, 3);
        assert_eq!(report.counters.skipped, 0);
    }

    #[tokio::test]
    async fn skip_limit_trip_terminates_failed() {
        // Three chunks of size 1, two of which are the bad value. skip_limit
        // = 1 tolerates the first skip but fails on the second.
        let spec = spec_with(
            vec![1, 99, 2, 99, 3],
            RejectingWriter {
                bad_value: 99,
                written: Mutex::new(Vec::new()),
            },
            1,
            1,
        );
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Failed);
        assert_eq!(report.counters.written, 2);
        assert_eq!(report.counters.skipped, 2);
    }

    #[tokio::test]
    async fn zero_skip_limit_fails_on_first_bad_item() {
        let spec = spec_with(
            vec![99],
            RejectingWriter {
                bad_value: 99,
                written: Mutex::new(Vec::new()),
            },
            10,
            0,
        );
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Failed);
        assert_eq!(report.counters.skipped, 1);
    }

    #[tokio::test]
    async fn cooperative_stop_finishes_current_chunk_then_stops() {
        let token = CancellationToken::new();
        let mut spec = spec_with(
            vec![1, 2, 3, 4],
            RejectingWriter {
                bad_value: i32::MIN,
                written: Mutex::new(Vec::new()),
            },
            2,
            0,
        );
        spec.stop_token = token.clone();
        token.cancel();

        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Stopped);
        // the first chunk (size 2) still completes before the stop is
        // observed.
        assert_eq!(report.counters.written, 2);
    }

    /// Writer that cancels the stop token itself once it has committed a
    /// given number of chunks, modeling an operator calling `stop_all` while
    /// a 100-item job (chunk_size=10) is mid-flight: the chunk that was
    /// already in flight when the stop lands must still commit, but no
    /// chunk after it may.
    struct StoppingAfterNChunks {
        token: CancellationToken,
        stop_after: usize,
        chunks_written: Mutex<usize>,
        written: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Writer<i32> for StoppingAfterNChunks {
        type Error = TestError;
        async fn write(&self, chunk: Vec<i32>) -> Result<(), TestError> {
            self.written.lock().unwrap().extend(chunk);
            let mut count = self.chunks_written.lock().unwrap();
            *count += 1;
            if *count == self.stop_after {
                self.token.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_mid_crawl_commits_the_in_flight_chunk_then_halts() {
        let token = CancellationToken::new();
        let spec = JobSpec {
            reader: VecReader {
                items: (1..=100).collect::<Vec<i32>>().into_iter(),
            },
            processor: IdentityProcessor,
            writer: StoppingAfterNChunks {
                token: token.clone(),
                stop_after: 3,
                chunks_written: Mutex::new(0),
                written: Mutex::new(Vec::new()),
            },
            chunk_size: 10,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: token,
        };

        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Stopped);
        // chunks 1-3 commit (30 items); the stop is observed right after
        // chunk 3's write, before chunk 4 is ever read off the stream.
        assert_eq!(report.counters.written, 30);
        assert_eq!(report.counters.read, 30);
    }

    #[tokio::test]
    async fn empty_reader_completes_with_zero_counters() {
        let spec = spec_with(
            vec![],
            RejectingWriter {
                bad_value: i32::MIN,
                written: Mutex::new(Vec::new()),
            },
            10,
            0,
        );
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters, EngineCounters::default());
    }

    #[tokio::test]
    async fn parallel_executor_processes_every_item() {
        let calls = AtomicUsize::new(0);
        struct CountingProcessor<'a>(&'a AtomicUsize);

        #[async_trait]
        impl Processor<i32, i32> for CountingProcessor<'static> {
            type Error = TestError;
            async fn process(&self, item: i32) -> Result<Option<i32>, TestError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Some(item))
            }
        }

        // leak to obtain a 'static reference for the test-only processor.
        let calls_ref: &'static AtomicUsize = Box::leak(Box::new(calls));
        let mut spec = spec_with(
            vec![1, 2, 3, 4, 5],
            RejectingWriter {
                bad_value: i32::MIN,
                written: Mutex::new(Vec::new()),
            },
            10,
            0,
        );
        spec.task_executor = TaskExecutor::Parallel(3);
        let processed = ChunkEngine::process_chunk(
            &CountingProcessor(calls_ref),
            vec![1, 2, 3, 4, 5],
            spec.task_executor,
            &spec.retry_policy,
        )
        .await;
        assert_eq!(processed.succeeded.len(), 5);
        assert_eq!(calls_ref.load(Ordering::SeqCst), 5);
    }
}
