//! The seam to the external media room.
//!
//! The real room is a third-party WebRTC service; its SDK is wrapped
//! behind [`RoomTransport`] so the actor can publish without knowing the
//! wire. Room name equals conversation id. Inbound flows (data, audio
//! frames, participant membership) arrive through the dispatcher's
//! callbacks, not through this trait.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use parlance_audio::AudioFrame;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The room is gone; the actor detaches and starts its idle TTL.
    #[error("transport closed")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Publish an encoded envelope to the room's data channel.
    async fn publish_data(&self, bytes: Bytes, reliable: bool) -> Result<(), TransportError>;

    /// Publish one audio frame to the server participant's track.
    async fn publish_audio_frame(&self, frame: AudioFrame) -> Result<(), TransportError>;
}

/// In-memory transport: records everything published. Used by the test
/// suites and by local loopback wiring.
#[derive(Default)]
pub struct MemoryTransport {
    data: Mutex<Vec<Bytes>>,
    audio: Mutex<Vec<AudioFrame>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every data payload published so far, in publish order.
    pub fn published(&self) -> Vec<Bytes> {
        self.data.lock().unwrap().clone()
    }

    pub fn published_audio(&self) -> Vec<AudioFrame> {
        self.audio.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoomTransport for MemoryTransport {
    async fn publish_data(&self, bytes: Bytes, _reliable: bool) -> Result<(), TransportError> {
        self.data.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn publish_audio_frame(&self, frame: AudioFrame) -> Result<(), TransportError> {
        self.audio.lock().unwrap().push(frame);
        Ok(())
    }
}
