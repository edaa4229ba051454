//! Incremental decoders for long-lived response bodies.
//!
//! Every decoder here is transport-independent: bytes go in through `feed`
//! as they arrive, decoded units come out in arrival order, and `flush`
//! drains whatever a clean end of stream leaves behind.

use crate::error::ErrorKind;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tracing::warn;

/// Streaming UTF-8 decoding. A multi-byte sequence split across two reads is
/// held back until its tail arrives; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match error.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Newline-delimited JSON. Complete lines are parsed as they close; the
/// trailing fragment waits in the buffer for the next read.
#[derive(Debug)]
pub struct LineDecoder<T> {
    text: Utf8Decoder,
    buffer: String,
    _unit: PhantomData<fn() -> T>,
}

impl<T> Default for LineDecoder<T> {
    fn default() -> Self {
        Self {
            text: Utf8Decoder::new(),
            buffer: String::new(),
            _unit: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> LineDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<T, ErrorKind>> {
        let decoded = self.text.feed(bytes);
        self.buffer.push_str(&decoded);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let remainder = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, remainder);
        complete
            .split('\n')
            .filter_map(parse_line::<T>)
            .collect()
    }

    pub fn flush(&mut self) -> Option<Result<T, ErrorKind>> {
        let tail = self.text.flush();
        self.buffer.push_str(&tail);
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

fn parse_line<T: DeserializeOwned>(line: &str) -> Option<Result<T, ErrorKind>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    Some(serde_json::from_str(line).map_err(|error| {
        warn!("skipping malformed stream line: {error}");
        ErrorKind::StreamDecode(format!("{error} in line `{}`", preview(line)))
    }))
}

fn preview(line: &str) -> String {
    if line.chars().count() <= 80 {
        return line.to_string();
    }
    let mut out = line.chars().take(79).collect::<String>();
    out.push('…');
    out
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LogFraming {
    /// Forward each read verbatim as one chunk.
    #[default]
    Raw,
    /// Strip the engine's 8-byte stdout/stderr frame headers.
    Multiplexed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

const FRAME_HEADER_LEN: usize = 8;

/// Demultiplexer for `[stream, 0, 0, 0, len_be32]` framed output. When the
/// first bytes do not look like a frame header (TTY output is never framed)
/// the decoder switches to passthrough for the rest of the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    passthrough: Option<bool>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        if self.passthrough.is_none() {
            if self.buffer.len() < 4 {
                return Vec::new();
            }
            let framed = StreamKind::from_byte(self.buffer[0]).is_some()
                && self.buffer[1..4].iter().all(|byte| *byte == 0);
            self.passthrough = Some(!framed);
        }

        if self.passthrough == Some(true) {
            if self.buffer.is_empty() {
                return Vec::new();
            }
            return vec![Frame {
                stream: StreamKind::Stdout,
                payload: std::mem::take(&mut self.buffer),
            }];
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    pub fn flush(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame {
            stream: StreamKind::Stdout,
            payload: std::mem::take(&mut self.buffer),
        })
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return None;
        }

        let stream = StreamKind::from_byte(self.buffer[0]).unwrap_or(StreamKind::Stdout);
        let length = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        if self.buffer.len() < FRAME_HEADER_LEN + length {
            return None;
        }

        let payload = self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();
        self.buffer.drain(..FRAME_HEADER_LEN + length);
        Some(Frame { stream, payload })
    }
}

/// Text chunks for a log stream under either framing discipline.
#[derive(Debug)]
pub struct LogDecoder {
    framing: LogFraming,
    frames: FrameDecoder,
    text: Utf8Decoder,
}

impl LogDecoder {
    pub fn new(framing: LogFraming) -> Self {
        Self {
            framing,
            frames: FrameDecoder::new(),
            text: Utf8Decoder::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        match self.framing {
            LogFraming::Raw => non_empty(self.text.feed(bytes)).into_iter().collect(),
            LogFraming::Multiplexed => self
                .frames
                .feed(bytes)
                .into_iter()
                .filter_map(|frame| non_empty(self.text.feed(&frame.payload)))
                .collect(),
        }
    }

    pub fn flush(&mut self) -> Option<String> {
        let mut tail = String::new();
        if let Some(frame) = self.frames.flush() {
            tail.push_str(&self.text.feed(&frame.payload));
        }
        tail.push_str(&self.text.flush());
        non_empty(tail)
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}
