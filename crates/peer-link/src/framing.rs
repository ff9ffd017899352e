//! Slicing of JSON envelopes over a size-limited data channel.
//!
//! An outbound message is sent as consecutive slices of at most
//! `chunk_chars` characters followed by a single [`TERMINATOR`] message. The
//! channel is ordered and reliable, so the receiver only concatenates until it
//! sees the terminator. Slices are cut on `char` boundaries so every channel
//! message stays valid UTF-8 text.

use relay_bus::Envelope;
use thiserror::Error;
use tracing::warn;

use crate::config::ManagerConfig;

pub const TERMINATOR: &str = "-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameConfig {
    pub chunk_chars: usize,
    pub max_message_chars: usize,
}

impl FrameConfig {
    pub fn new(chunk_chars: usize, max_message_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(2),
            max_message_chars,
        }
    }
}

impl From<&ManagerConfig> for FrameConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self::new(config.chunk_chars, config.max_message_chars)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message exceeds max size: {0} chars")]
    MessageTooLarge(usize),
    #[error("frame payload malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Split `text` into channel messages, terminator included.
pub fn split_text(text: &str, config: &FrameConfig) -> Result<Vec<String>, FrameError> {
    let total_chars = text.chars().count();
    if total_chars > config.max_message_chars {
        return Err(FrameError::MessageTooLarge(total_chars));
    }

    let mut frames = Vec::with_capacity(total_chars / config.chunk_chars + 2);
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == config.chunk_chars {
            frames.push(text[start..offset].to_string());
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        frames.push(text[start..].to_string());
    }
    frames.push(TERMINATOR.to_string());
    Ok(frames)
}

pub fn encode_envelope(envelope: &Envelope, config: &FrameConfig) -> Result<Vec<String>, FrameError> {
    let json = serde_json::to_string(envelope)?;
    split_text(&json, config)
}

pub fn decode_envelope(text: &str) -> Result<Envelope, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Accumulates slices for one channel until a terminator completes them.
#[derive(Debug)]
pub struct Reassembler {
    buffer: String,
    buffered_chars: usize,
    overflowed: bool,
    config: FrameConfig,
}

impl Reassembler {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            buffer: String::new(),
            buffered_chars: 0,
            overflowed: false,
            config,
        }
    }

    /// Feed one channel message. Returns the completed text on a terminator.
    pub fn ingest(&mut self, message: &str) -> Option<String> {
        if message == TERMINATOR {
            let overflowed = std::mem::replace(&mut self.overflowed, false);
            self.buffered_chars = 0;
            let completed = std::mem::take(&mut self.buffer);
            return (!overflowed).then_some(completed);
        }
        if self.overflowed {
            return None;
        }
        self.buffered_chars = self.buffered_chars.saturating_add(message.chars().count());
        if self.buffered_chars > self.config.max_message_chars {
            warn!(
                buffered_chars = self.buffered_chars,
                max = self.config.max_message_chars,
                "inbound message exceeds limit; dropping until terminator"
            );
            self.buffer.clear();
            self.overflowed = true;
            return None;
        }
        self.buffer.push_str(message);
        None
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && !self.overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(chunk_chars: usize) -> FrameConfig {
        FrameConfig::new(chunk_chars, 1 << 20)
    }

    fn reassemble(frames: &[String], config: FrameConfig) -> Vec<String> {
        let mut reassembler = Reassembler::new(config);
        frames
            .iter()
            .filter_map(|frame| reassembler.ingest(frame))
            .collect()
    }

    #[test]
    fn boundary_sizes_round_trip() {
        let chunk = 16;
        let config = config(chunk);
        for size in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk] {
            let text: String = (0..size).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let frames = split_text(&text, &config).expect("split");
            assert_eq!(frames.last().map(String::as_str), Some(TERMINATOR));
            assert_eq!(frames.len() - 1, size.div_ceil(chunk), "size {size}");
            assert!(frames.iter().all(|frame| frame.chars().count() <= chunk));
            assert_eq!(reassemble(&frames, config), vec![text], "size {size}");
        }
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let config = config(3);
        let text = "héllo wörld ✓✓✓";
        let frames = split_text(text, &config).expect("split");
        assert_eq!(frames[0], "hél");
        assert_eq!(reassemble(&frames, config), vec![text.to_string()]);
    }

    #[test]
    fn envelope_survives_framing() {
        let config = config(5_000);
        let envelope = Envelope::unicast(
            "alice",
            "bob",
            "edit",
            json!({ "ops": "x".repeat(12_345) }),
        );
        let frames = encode_envelope(&envelope, &config).expect("encode");
        assert_eq!(frames.len(), 4);
        let text = reassemble(&frames, config).pop().expect("completed");
        assert_eq!(decode_envelope(&text).expect("decode"), envelope);
    }

    #[test]
    fn partial_message_is_not_delivered() {
        let config = config(4);
        let frames = split_text("abcdefghij", &config).expect("split");
        let mut reassembler = Reassembler::new(config);
        for frame in &frames[..frames.len() - 1] {
            assert!(reassembler.ingest(frame).is_none());
        }
        assert!(!reassembler.is_idle());
        assert_eq!(reassembler.ingest(TERMINATOR).as_deref(), Some("abcdefghij"));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn oversize_rejected_on_both_sides() {
        let config = FrameConfig::new(4, 8);
        assert!(matches!(
            split_text("0123456789", &config),
            Err(FrameError::MessageTooLarge(10))
        ));

        let mut reassembler = Reassembler::new(config);
        for slice in ["0123", "4567", "89"] {
            assert!(reassembler.ingest(slice).is_none());
        }
        assert!(reassembler.ingest(TERMINATOR).is_none());
        // The next message starts clean.
        assert!(reassembler.ingest("ok").is_none());
        assert_eq!(reassembler.ingest(TERMINATOR).as_deref(), Some("ok"));
    }
}
