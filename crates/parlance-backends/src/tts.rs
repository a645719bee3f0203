//! Text-to-speech backend: one sentence in, PCM bytes out.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BackendError, Result};

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Synthesize one sentence to 16-bit LE PCM at the internal sample
    /// rate. The byte stream is collected here; cancellation aborts the
    /// transfer between chunks.
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Bytes>;
}

pub struct HttpSpeechBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
}

impl HttpSpeechBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Bytes> {
        use futures_util::StreamExt;

        let url = format!("{}/v1/audio/speech", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "pcm",
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let mut pcm = BytesMut::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => pcm.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(BackendError::Http(e)),
                None => break,
            }
        }

        debug!(bytes = pcm.len(), "sentence synthesized");
        Ok(pcm.freeze())
    }
}
