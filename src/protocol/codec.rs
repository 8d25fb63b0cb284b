//! Newline-delimited JSON codec
//!
//! Each frame is one JSON document followed by `\n`. `serde_json` escapes
//! control characters inside strings, so an encoded frame never contains a
//! raw newline and the delimiter is unambiguous.

use crate::error::FramingError;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound for a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Codec decoding `In` frames and encoding `Out` frames.
///
/// A server-side socket uses `JsonLinesCodec<WireRequest, Response>`, an
/// outbound connection uses `JsonLinesCodec<Response, WireRequest>`.
#[derive(Debug)]
pub struct JsonLinesCodec<In, Out> {
    lines: LinesCodec,
    max_frame_bytes: usize,
    _marker: PhantomData<fn() -> (In, Out)>,
}

impl<In, Out> JsonLinesCodec<In, Out> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
            _marker: PhantomData,
        }
    }

    fn map_lines_error(&self, err: LinesCodecError) -> FramingError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => FramingError::FrameTooLarge {
                max_bytes: self.max_frame_bytes,
            },
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                FramingError::MalformedJson {
                    reason: "frame is not valid UTF-8".to_string(),
                }
            }
            LinesCodecError::Io(e) => FramingError::Io(e),
        }
    }
}

impl<In, Out> Default for JsonLinesCodec<In, Out> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Parse one frame (without its delimiter) into `T`.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, FramingError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;
    if !value.is_object() {
        return Err(FramingError::InvalidEnvelope {
            reason: "frame is not a JSON object".to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| FramingError::InvalidEnvelope {
        reason: e.to_string(),
    })
}

/// Serialize `msg` into a complete frame, delimiter included.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FramingError> {
    let mut frame = serde_json::to_vec(msg).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;
    frame.push(b'\n');
    Ok(frame)
}

impl<In: DeserializeOwned, Out> Decoder for JsonLinesCodec<In, Out> {
    type Item = In;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, FramingError> {
        loop {
            let line = match self.lines.decode(src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_lines_error(e)),
            };
            // blank keep-alive lines carry no message
            if line.trim().is_empty() {
                continue;
            }
            return decode_frame(&line).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<In>, FramingError> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        let pending = src.len();
        src.clear();
        Err(FramingError::MalformedJson {
            reason: format!("stream ended inside a frame ({} bytes pending)", pending),
        })
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLinesCodec<In, Out> {
    type Error = FramingError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), FramingError> {
        let payload = serde_json::to_vec(&item).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}
