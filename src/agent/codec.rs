//! Sentinel-framed decoder for agent stdout.
//!
//! The agent brackets each result record between ASCII sentinels:
//!
//! ```text
//! ---NANOCLAW_OUTPUT_START---
//! {"status":"success","result":"…","newSessionId":"…"}
//! ---NANOCLAW_OUTPUT_END---
//! ```
//!
//! Line framing is delegated to [`LinesCodec`] with a length cap so an
//! unterminated line cannot exhaust memory. Lines outside a frame, and
//! frame bodies that fail to parse, surface as [`StreamItem::Diagnostic`]
//! for logging; they never terminate the stream.

use bytes::BytesMut;
use serde::Deserialize;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Frame opening sentinel.
pub const OUTPUT_START: &str = "---NANOCLAW_OUTPUT_START---";
/// Frame closing sentinel.
pub const OUTPUT_END: &str = "---NANOCLAW_OUTPUT_END---";

/// Maximum length of one stdout line: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Result status carried by a frame.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Success,
    Error,
}

/// One decoded result record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OutputFrame {
    /// Whether the agent considers this record a success.
    pub status: FrameStatus,
    /// Text to surface to the chat; may contain `<internal>` spans.
    #[serde(default)]
    pub result: Option<String>,
    /// Session handle to persist before the reply is sent.
    #[serde(default, rename = "newSessionId")]
    pub new_session_id: Option<String>,
    /// Human-readable error when `status` is `error`.
    #[serde(default)]
    pub error: Option<String>,
}

impl OutputFrame {
    /// Synthetic frame emitted by the supervisor on timeout or kill.
    #[must_use]
    pub fn synthetic_error(message: &str) -> Self {
        Self {
            status: FrameStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.to_owned()),
        }
    }
}

/// One decoded stdout item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A complete, parsed frame.
    Frame(OutputFrame),
    /// Non-protocol output; logged, never surfaced.
    Diagnostic(String),
}

/// Stateful sentinel-frame decoder.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
    /// Accumulated body lines while inside a frame.
    body: Option<Vec<String>>,
    /// Total stream bytes consumed; the supervisor reads this to enforce
    /// the output cap.
    consumed: u64,
}

impl FrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            body: None,
            consumed: 0,
        }
    }

    /// Total stream bytes consumed so far.
    #[must_use]
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    fn consume_line(&mut self, line: String) -> Option<StreamItem> {
        let trimmed = line.trim_end_matches('\r');

        match self.body.take() {
            None => {
                if trimmed == OUTPUT_START {
                    self.body = Some(Vec::new());
                    None
                } else if trimmed.is_empty() {
                    None
                } else {
                    Some(StreamItem::Diagnostic(line))
                }
            }
            Some(mut body) => {
                if trimmed == OUTPUT_END {
                    let text = body.join("\n");
                    match serde_json::from_str::<OutputFrame>(&text) {
                        Ok(frame) => Some(StreamItem::Frame(frame)),
                        Err(err) => Some(StreamItem::Diagnostic(format!(
                            "unparseable frame ({err}): {text}"
                        ))),
                    }
                } else {
                    body.push(trimmed.to_owned());
                    self.body = Some(body);
                    None
                }
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = StreamItem;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let before = src.len();
            let decoded = self.lines.decode(src).map_err(map_codec_error);
            self.consumed += (before - src.len()) as u64;
            match decoded? {
                None => return Ok(None),
                Some(line) => {
                    if let Some(item) = self.consume_line(line) {
                        return Ok(Some(item));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.lines.decode_eof(src).map_err(map_codec_error)? {
                None => {
                    // An unterminated frame at EOF is diagnostic, not data.
                    return Ok(self.body.take().map(|body| {
                        StreamItem::Diagnostic(format!(
                            "stream ended inside frame: {}",
                            body.join("\n")
                        ))
                    }));
                }
                Some(line) => {
                    if let Some(item) = self.consume_line(line) {
                        return Ok(Some(item));
                    }
                }
            }
        }
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Agent(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
