//! Stream source capability.
//!
//! Camera protocol negotiation, authentication and decoding all live behind
//! this boundary. Reads are blocking and are only ever driven from a task's
//! dedicated capture thread.

use std::time::Duration;

use image::RgbImage;

use crate::error::{VisionError, VisionResult};

/// Where and how to connect to a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub url: String,
    /// Requested output size; sources may fall back to their own default.
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// Outcome of a single blocking read.
#[derive(Debug)]
pub enum StreamRead {
    Frame(RgbImage),
    EndOfStream,
    Error(VisionError),
}

/// An open camera connection.
pub trait StreamHandle: Send {
    fn read(&mut self) -> StreamRead;

    /// Release the connection. Must be safe to call more than once.
    fn close(&mut self);
}

/// Factory for camera connections.
pub trait StreamSource: Send + Sync {
    /// Open a connection, giving up after `timeout`.
    fn open(
        &self,
        descriptor: &StreamDescriptor,
        timeout: Duration,
    ) -> VisionResult<Box<dyn StreamHandle>>;
}
