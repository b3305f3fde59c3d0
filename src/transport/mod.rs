//! Transport layer for host ↔ worker communication.
//!
//! Provides the newline-delimited JSON codec used on both ends of the bridge.
//! Frames are re-assembled across reads by the `FramedRead` buffer, so a
//! message split over any number of TCP reads still decodes exactly once.

pub mod protocol;

pub use protocol::{Request, RequestId, RequestKind, Response, Status};

use std::io;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Maximum frame size (8 MB). Safety valve against a peer that never sends `\n`.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// One decoded line.
///
/// Bad input is reported as a value instead of an error so the stream keeps
/// going; only I/O failures end a `FramedRead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    Message(T),
    /// The line was not valid JSON for `T`. Holds the raw line.
    Malformed(String),
    /// The line exceeded the frame limit and was discarded.
    Oversized { limit: usize },
}

/// Codec that splits on `\n` and serializes each line with JSON.
///
/// Wraps `AnyDelimiterCodec` for the line assembly and adds serde_json.
pub struct JsonLinesCodec<T> {
    inner: AnyDelimiterCodec,
    max_frame_length: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_frame_length,
            ),
            max_frame_length,
            _phantom: PhantomData,
        }
    }

    pub const fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    /// Parse one line. Blank lines yield `None`.
    fn parse(line: &Bytes) -> Option<Frame<T>> {
        let line: &[u8] = line;
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let frame = match serde_json::from_slice(line) {
            Ok(item) => Frame::Message(item),
            Err(e) => {
                tracing::debug!(error = %e, len = line.len(), "Undecodable frame");
                Frame::Malformed(String::from_utf8_lossy(line).into_owned())
            }
        };
        Some(frame)
    }

    fn lift(
        &self,
        chunk: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Option<Frame<T>>>, io::Error> {
        match chunk {
            Ok(Some(line)) => Ok(Some(Self::parse(&line))),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(limit = self.max_frame_length, "Discarding oversized frame");
                Ok(Some(Some(Frame::Oversized {
                    limit: self.max_frame_length,
                })))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Frame<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let chunk = self.inner.decode(src);
            match self.lift(chunk)? {
                Some(Some(frame)) => return Ok(Some(frame)),
                // blank line, keep scanning
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let chunk = self.inner.decode_eof(src);
            match self.lift(chunk)? {
                Some(Some(frame)) => return Ok(Some(frame)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame exceeds max size: {} > {}",
                    json.len(),
                    self.max_frame_length
                ),
            ));
        }

        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
