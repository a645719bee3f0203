//! Speech recognizer backend: PCM16 frames in, transcription texts out.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BackendError, Result};

/// One recognized segment. Partials (`is_final == false`) may be revised by
/// later responses; finals are stable.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Transcribe a PCM16-LE chunk at the given sample rate. `interim`
    /// requests partial hypotheses in addition to finals.
    async fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        interim: bool,
    ) -> Result<Vec<Transcript>>;
}

pub struct HttpTranscriptionBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpTranscriptionBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    segments: Vec<Transcript>,
}

#[async_trait]
impl TranscriptionBackend for HttpTranscriptionBackend {
    async fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        interim: bool,
    ) -> Result<Vec<Transcript>> {
        let url = format!(
            "{}/v1/audio/transcriptions?model={}&rate={}&interim={}",
            self.base_url, self.model, sample_rate, interim
        );
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(pcm.to_vec())
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let parsed: TranscribeResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(parsed.segments)
    }
}
