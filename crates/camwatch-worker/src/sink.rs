//! Push sink capability.
//!
//! Delivery is fire-and-forget from the pipeline's point of view. Transports
//! (HTTP, TCP, MQTT) implement [`PushSink`]; retries are their own concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::{WorkerError, WorkerResult};

#[async_trait]
pub trait PushSink: Send + Sync {
    async fn push(
        &self,
        payload: &serde_json::Value,
        tags: &[String],
        image: Option<&[u8]>,
    ) -> WorkerResult<()>;
}

/// Sink that writes every push to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl PushSink for LogSink {
    async fn push(
        &self,
        payload: &serde_json::Value,
        tags: &[String],
        image: Option<&[u8]>,
    ) -> WorkerResult<()> {
        info!(
            tags = ?tags,
            image_bytes = image.map(<[u8]>::len).unwrap_or(0),
            payload = %payload,
            "Push"
        );
        Ok(())
    }
}

/// One recorded push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRecord {
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub image_len: Option<usize>,
}

/// Sink that keeps pushes in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pushes: Mutex<Vec<PushRecord>>,
    fail: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl PushSink for MemorySink {
    async fn push(
        &self,
        payload: &serde_json::Value,
        tags: &[String],
        image: Option<&[u8]>,
    ) -> WorkerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::push_failed("sink unavailable"));
        }
        self.pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PushRecord {
                payload: payload.clone(),
                tags: tags.to_vec(),
                image_len: image.map(<[u8]>::len),
            });
        Ok(())
    }
}
