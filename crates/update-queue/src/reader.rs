use crate::backend::QueueBackend;
use crate::queue::UpdateQueue;
use crate::task::UpdateTask;
use async_trait::async_trait;
use pipeline_engine::{ClassifiedError, EngineError, Reader};
use tokio_util::sync::CancellationToken;

/// Adapts the queue's consumer protocol (steps 1-3: pop + claim + mark
/// active) into a `pipeline_engine::Reader<UpdateTask>`, so a worker's drain
/// loop can run inside the same `ChunkEngine` used by the other two reader
/// kinds (spec.md §2 "Control flow").
///
/// An idle queue is not "end of stream" in the usual sense — unlike a
/// bounded table scan, there is always more work that *might* arrive. This
/// reader only reports end-of-stream when the cooperative-stop token has
/// fired, so the chunked engine's ordinary `read empty -> COMPLETED` path
/// doubles as its graceful-shutdown path.
pub struct QueueReader<B: QueueBackend> {
    queue: UpdateQueue<B>,
    worker_id: String,
    stop_token: CancellationToken,
}

impl<B: QueueBackend> QueueReader<B> {
    pub fn new(queue: UpdateQueue<B>, worker_id: impl Into<String>, stop_token: CancellationToken) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            stop_token,
        }
    }
}

#[async_trait]
impl<B: QueueBackend> Reader<UpdateTask> for QueueReader<B> {
    type Error = EngineError;

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<UpdateTask>, EngineError> {
        let mut chunk = Vec::with_capacity(max);
        while chunk.len() < max {
            if self.stop_token.is_cancelled() {
                break;
            }
            match self.queue.dequeue_and_claim(&self.worker_id).await {
                Ok(Some(task)) => chunk.push(task),
                Ok(None) => {
                    if !chunk.is_empty() {
                        break;
                    }
                    // nothing claimed this round; loop again (or exit on
                    // stop, checked at the top of the loop).
                }
                Err(err) => return Err(EngineError::transient(err.to_string())),
            }
        }
        Ok(chunk)
    }
}

#[allow(dead_code)]
fn _assert_classified(e: &EngineError) -> pipeline_engine::ErrorClass {
    e.class()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemQueueBackend;
    use crate::queue::QueueConfig;
    use crate::task::{OperationFlags, Priority};

    #[tokio::test]
    async fn read_chunk_drains_up_to_max_available() {
        let queue = UpdateQueue::new(MemQueueBackend::new(), QueueConfig::default());
        queue.push(1, OperationFlags::all(), Priority::Normal).await.unwrap();
        queue.push(2, OperationFlags::all(), Priority::Normal).await.unwrap();

        let token = CancellationToken::new();
        let mut reader = QueueReader::new(queue, "worker-1", token.clone());
        // cancel immediately after the two tasks are claimed so the reader
        // doesn't spin forever waiting on an empty queue in this test.
        let chunk = tokio::select! {
            chunk = reader.read_chunk(5) => chunk.unwrap(),
            _ = async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                token.cancel();
            } => unreachable!(),
        };
        assert_eq!(chunk.len(), 2);
    }

    #[tokio::test]
    async fn read_chunk_returns_empty_once_stopped() {
        let queue = UpdateQueue::new(MemQueueBackend::new(), QueueConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let mut reader = QueueReader::new(queue, "worker-1", token);
        let chunk = reader.read_chunk(5).await.unwrap();
        assert!(chunk.is_empty());
    }
}
