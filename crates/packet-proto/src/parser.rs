//! Incremental, allocation-light parsing of a byte stream into frames.
//!
//! Network reads arrive in arbitrary-sized chunks; [`FrameParser`] accumulates
//! them into complete frames regardless of how the input happens to be
//! sliced, and hands each completed `(key_id, ciphertext)` pair to a
//! [`FrameHandler`]. This crate never decrypts anything itself — decryption,
//! and the session/plaintext layers above it, are a collaborator's job.

use bytes::{Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    header::{FrameHeader, KeyId},
};

/// Accumulates exactly `N` bytes across any number of `feed` calls.
///
/// Used for the fixed-size frame header; the ciphertext body (whose length
/// is only known after the header parses) uses a plain `BytesMut` instead.
#[derive(Debug, Clone)]
pub struct ValueParser<const N: usize> {
    buf: [u8; N],
    filled: usize,
}

impl<const N: usize> ValueParser<N> {
    /// A parser with nothing accumulated yet.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: [0u8; N], filled: 0 }
    }

    /// Copies as much of `input` as needed to reach `N` bytes total.
    ///
    /// Returns `(consumed, complete)`: `consumed` is how much of `input` was
    /// used (always `<= input.len()`), and `complete` is whether the target
    /// size has now been reached.
    pub fn feed(&mut self, input: &[u8]) -> (usize, bool) {
        let needed = N - self.filled;
        let take = needed.min(input.len());
        self.buf[self.filled..self.filled + take].copy_from_slice(&input[..take]);
        self.filled += take;
        (take, self.filled == N)
    }

    /// Discards any accumulated bytes.
    pub fn reset(&mut self) {
        self.filled = 0;
    }

    /// The accumulated bytes. Only meaningful once `feed` has reported
    /// completion.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.filled]
    }
}

impl<const N: usize> Default for ValueParser<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives structurally-complete frames as the parser assembles them.
///
/// Implemented by the collaborator that owns decryption (typically a
/// `Cipher`-backed component one layer up); this trait never sees plaintext.
pub trait FrameHandler {
    /// A frame's header parsed and exactly `ciphertext_length` ciphertext
    /// bytes collected. Any error returned here is surfaced to the caller of
    /// [`FrameParser::feed`] exactly like a structural parse error: the
    /// parser has already reset to await the next frame header before this
    /// returns.
    fn on_frame(&mut self, key_id: KeyId, ciphertext: Bytes) -> Result<()>;
}

const FRAME_HEADER_SIZE: usize = FrameHeader::SIZE;

#[derive(Debug, Clone)]
enum ParserState {
    AwaitHeader(ValueParser<FRAME_HEADER_SIZE>),
    AwaitCiphertext { key_id: KeyId, needed: usize, buf: BytesMut },
}

impl Default for ParserState {
    fn default() -> Self {
        Self::AwaitHeader(ValueParser::new())
    }
}

/// Streaming frame parser.
///
/// Feed it arbitrarily-chunked bytes from a socket; it calls
/// [`FrameHandler::on_frame`] once per complete frame and resets itself to
/// await the next header immediately beforehand, so a handler error (or a
/// structural error detected by the parser itself) never leaves the parser
/// stuck mid-frame.
pub struct FrameParser {
    state: ParserState,
    max_ciphertext_length: u32,
}

impl FrameParser {
    /// A parser that rejects frames whose ciphertext exceeds
    /// `max_ciphertext_length`.
    #[must_use]
    pub fn new(max_ciphertext_length: u32) -> Self {
        Self { state: ParserState::default(), max_ciphertext_length }
    }

    /// Feeds `input` to the parser, invoking `handler.on_frame` for each
    /// frame completed along the way. May invoke the handler more than once
    /// if `input` spans multiple frames.
    ///
    /// # Errors
    ///
    /// Returns the first structural error encountered (malformed header) or
    /// the first error the handler returns. Either way, the parser has
    /// already discarded the in-progress frame and is ready for the next
    /// header on the subsequent call.
    pub fn feed(&mut self, mut input: &[u8], handler: &mut impl FrameHandler) -> Result<()> {
        while !input.is_empty() {
            match &mut self.state {
                ParserState::AwaitHeader(value) => {
                    let (consumed, complete) = value.feed(input);
                    input = &input[consumed..];
                    if !complete {
                        break;
                    }
                    let header =
                        match FrameHeader::from_bytes(value.bytes(), self.max_ciphertext_length) {
                            Ok(header) => header,
                            Err(err) => {
                                self.state = ParserState::default();
                                return Err(err);
                            }
                        };
                    let needed = header.ciphertext_length() as usize;
                    self.state = ParserState::AwaitCiphertext {
                        key_id: header.key_id(),
                        needed,
                        buf: BytesMut::with_capacity(needed),
                    };
                }
                ParserState::AwaitCiphertext { needed, buf, .. } => {
                    let remaining = *needed - buf.len();
                    let take = remaining.min(input.len());
                    buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if buf.len() < *needed {
                        break;
                    }
                    let ParserState::AwaitCiphertext { key_id, buf, .. } =
                        std::mem::take(&mut self.state)
                    else {
                        unreachable!("matched above")
                    };
                    self.state = ParserState::default();
                    handler.on_frame(key_id, buf.freeze())?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FrameParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameParser")
            .field("max_ciphertext_length", &self.max_ciphertext_length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Vec<(KeyId, Bytes)>,
    }

    impl FrameHandler for Collector {
        fn on_frame(&mut self, key_id: KeyId, ciphertext: Bytes) -> Result<()> {
            self.frames.push((key_id, ciphertext));
            Ok(())
        }
    }

    struct AlwaysErrors;

    impl FrameHandler for AlwaysErrors {
        fn on_frame(&mut self, _key_id: KeyId, _ciphertext: Bytes) -> Result<()> {
            Err(ProtocolError::Malformed("handler refused"))
        }
    }

    fn encode_frame(key_id: KeyId, ciphertext: &[u8]) -> Vec<u8> {
        let header = FrameHeader::new(key_id, ciphertext.len() as u32);
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(ciphertext);
        out
    }

    #[test]
    fn parses_single_frame_fed_whole() {
        let mut parser = FrameParser::new(FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH);
        let mut collector = Collector::default();
        let frame = encode_frame([1u8; 32], b"hello");
        parser.feed(&frame, &mut collector).expect("should parse");
        assert_eq!(collector.frames.len(), 1);
        assert_eq!(&collector.frames[0].1[..], b"hello");
    }

    #[test]
    fn parses_frame_fed_one_byte_at_a_time() {
        let mut parser = FrameParser::new(FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH);
        let mut collector = Collector::default();
        let frame = encode_frame([2u8; 32], b"chunked-payload");
        for byte in &frame {
            parser.feed(std::slice::from_ref(byte), &mut collector).expect("should parse");
        }
        assert_eq!(collector.frames.len(), 1);
        assert_eq!(&collector.frames[0].1[..], b"chunked-payload");
    }

    #[test]
    fn parses_two_frames_fed_concatenated() {
        let mut parser = FrameParser::new(FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH);
        let mut collector = Collector::default();
        let mut both = encode_frame([3u8; 32], b"first");
        both.extend(encode_frame([4u8; 32], b"second"));
        parser.feed(&both, &mut collector).expect("should parse");
        assert_eq!(collector.frames.len(), 2);
        assert_eq!(&collector.frames[0].1[..], b"first");
        assert_eq!(&collector.frames[1].1[..], b"second");
    }

    #[test]
    fn structural_error_resets_parser_for_next_frame() {
        let mut parser = FrameParser::new(16);
        let mut collector = Collector::default();
        let bad = encode_frame([5u8; 32], &vec![0u8; 1024]);
        let err = parser.feed(&bad, &mut collector);
        assert!(err.is_err());
        let good = encode_frame([6u8; 32], b"ok");
        parser.feed(&good, &mut collector).expect("parser should recover");
        assert_eq!(collector.frames.len(), 1);
        assert_eq!(&collector.frames[0].1[..], b"ok");
    }

    #[test]
    fn handler_error_also_resets_parser() {
        let mut parser = FrameParser::new(FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH);
        let frame = encode_frame([7u8; 32], b"doomed");
        assert!(parser.feed(&frame, &mut AlwaysErrors).is_err());
        let mut collector = Collector::default();
        let next = encode_frame([8u8; 32], b"recovered");
        parser.feed(&next, &mut collector).expect("should parse after handler error");
        assert_eq!(collector.frames.len(), 1);
    }
}
