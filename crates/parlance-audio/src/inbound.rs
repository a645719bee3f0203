//! Bounded window for inbound microphone frames.
//!
//! Frames are never buffered past a small fixed window: when the consumer
//! (the transcription path) cannot keep up, the oldest frames are dropped
//! and counted, so playback latency stays bounded at the cost of losing
//! stale audio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::format::AudioFrame;

pub const DEFAULT_WINDOW_FRAMES: usize = 50; // one second at 20 ms frames

#[derive(Debug)]
pub struct InboundWindow {
    frames: VecDeque<AudioFrame>,
    max_frames: usize,
    dropped: Arc<AtomicU64>,
}

impl InboundWindow {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a frame, evicting the oldest when the window is full.
    pub fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() == self.max_frames {
            self.frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.frames.push_back(frame);
    }

    /// Take the oldest retained frame.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    /// Drain everything retained, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Shared counter of frames lost to eviction, for observability.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InboundWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use bytes::Bytes;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(Bytes::from(vec![tag, 0]), AudioFormat::internal())
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let mut window = InboundWindow::new(3);
        for i in 0..5u8 {
            window.push(frame(i));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.dropped(), 2);
        assert_eq!(window.pop().unwrap().data[0], 2);
    }

    #[test]
    fn drain_returns_in_arrival_order() {
        let mut window = InboundWindow::new(8);
        for i in 0..4u8 {
            window.push(frame(i));
        }
        let tags: Vec<u8> = window.drain().iter().map(|f| f.data[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert!(window.is_empty());
    }
}
