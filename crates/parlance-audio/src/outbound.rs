//! Outbound TTS framing and pacing.
//!
//! One synthesized sentence arrives as a single PCM byte blob; the pacer
//! splits it into fixed-duration frames and publishes them at real time so
//! the room hears speech, not a burst. The frame sink is a bounded channel:
//! when the transport backpressures, `send` suspends the pacer
//! cooperatively. Cancellation is honoured at every frame boundary — the
//! frame already handed over may still play.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AudioError, Result};
use crate::format::{AudioFormat, AudioFrame};

pub const DEFAULT_FRAME_MS: u32 = 20;

/// Outcome of pacing one sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedStats {
    pub frames_sent: u32,
    pub duration_ms: u32,
    /// True when a cancel cut the stream before the last frame.
    pub cancelled: bool,
}

pub struct FramePacer {
    format: AudioFormat,
    frame_ms: u32,
}

impl FramePacer {
    pub fn new(format: AudioFormat, frame_ms: u32) -> Self {
        Self { format, frame_ms }
    }

    /// Split `pcm` into frames and deliver them to `sink` paced at real
    /// time. The trailing partial frame is zero-padded to full length.
    pub async fn pace(
        &self,
        pcm: Bytes,
        sink: &mpsc::Sender<AudioFrame>,
        cancel: &CancellationToken,
    ) -> Result<PacedStats> {
        let frame_len = self.format.frame_bytes(self.frame_ms);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(u64::from(self.frame_ms)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

        let mut frames_sent = 0u32;
        let mut offset = 0usize;

        while offset < pcm.len() {
            if cancel.is_cancelled() {
                debug!(frames_sent, "outbound pacing cancelled");
                return Ok(PacedStats {
                    frames_sent,
                    duration_ms: frames_sent * self.frame_ms,
                    cancelled: true,
                });
            }

            let end = (offset + frame_len).min(pcm.len());
            let data = if end - offset == frame_len {
                pcm.slice(offset..end)
            } else {
                let mut padded = pcm.slice(offset..end).to_vec();
                padded.resize(frame_len, 0);
                Bytes::from(padded)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(PacedStats {
                        frames_sent,
                        duration_ms: frames_sent * self.frame_ms,
                        cancelled: true,
                    });
                }
                sent = sink.send(AudioFrame::new(data, self.format)) => {
                    if sent.is_err() {
                        return Err(AudioError::SinkClosed);
                    }
                }
            }

            frames_sent += 1;
            offset = end;
            interval.tick().await;
        }

        Ok(PacedStats {
            frames_sent,
            duration_ms: frames_sent * self.frame_ms,
            cancelled: false,
        })
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new(AudioFormat::internal(), DEFAULT_FRAME_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn splits_into_padded_frames() {
        let pacer = FramePacer::default();
        let frame_len = AudioFormat::internal().frame_bytes(DEFAULT_FRAME_MS);
        // Two full frames plus a half frame.
        let pcm = Bytes::from(vec![1u8; frame_len * 2 + frame_len / 2]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let stats = pacer.pace(pcm, &tx, &cancel).await.unwrap();
        assert_eq!(stats.frames_sent, 3);
        assert!(!stats.cancelled);

        let mut lens = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            lens.push(frame.data.len());
        }
        assert_eq!(lens, vec![frame_len; 3]);
        // Padding is silence.
        // (last frame's tail must be zero bytes)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_at_frame_boundary() {
        let pacer = FramePacer::default();
        let frame_len = AudioFormat::internal().frame_bytes(DEFAULT_FRAME_MS);
        let pcm = Bytes::from(vec![0u8; frame_len * 10]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = pacer.pace(pcm, &tx, &cancel).await.unwrap();
        assert_eq!(stats.frames_sent, 0);
        assert!(stats.cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_sink_surfaces_error() {
        let pacer = FramePacer::default();
        let frame_len = AudioFormat::internal().frame_bytes(DEFAULT_FRAME_MS);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();
        let err = pacer
            .pace(Bytes::from(vec![0u8; frame_len]), &tx, &cancel)
            .await;
        assert!(matches!(err, Err(AudioError::SinkClosed)));
    }
}
