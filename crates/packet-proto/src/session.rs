//! Per-tunnel replay-protection state.
//!
//! A `Session` is freshly randomized (id and both sequence numbers) at
//! creation rather than zero-based, so an attacker replaying frames across a
//! session restart must guess a 64-bit starting sequence instead of simply
//! replaying from zero.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// 16-byte session identifier, chosen at random per session.
pub type SessionId = [u8; 16];

/// `{ id: 16 bytes, seq: u64 }`, 24 bytes on the wire. What a sender attaches
/// to a frame to bind it to a session and a position in that session's
/// outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    id: SessionId,
    seq: u64,
}

impl SessionHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 24;

    /// Builds a header from its raw fields.
    #[must_use]
    pub fn new(id: SessionId, seq: u64) -> Self {
        Self { id, seq }
    }

    /// Parses a header from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::TooShort { expected: Self::SIZE, actual: bytes.len() });
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[0..16]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&bytes[16..24]);
        Ok(Self { id, seq: u64::from_be_bytes(seq_bytes) })
    }

    /// Serializes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.id);
        dst.put_u64(self.seq);
    }

    /// The session this header claims to belong to.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The sequence position this header claims.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Fills `buf` with cryptographically random bytes.
///
/// Abstracted as a plain closure (rather than a trait object reaching into
/// `packet-core`'s `Environment`) so this crate stays free of async/runtime
/// dependencies; callers pass `Environment::random_bytes` or an equivalent.
pub trait RandomSource: FnMut(&mut [u8]) {}
impl<F: FnMut(&mut [u8])> RandomSource for F {}

fn random_u64(random: &mut impl RandomSource) -> u64 {
    let mut bytes = [0u8; 8];
    random(&mut bytes);
    u64::from_be_bytes(bytes)
}

/// Per-tunnel replay-protection record.
///
/// The full record (id plus both independently-random sequence numbers) is
/// what travels on the wire inside `ServerHello`, letting the initiator
/// adopt a genuinely distinct peer view via [`Self::swapped`]; a single
/// frame only ever attaches one [`SessionHeader`] (this session's current
/// outbound position), not the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    inbound_seq: u64,
    outbound_seq: u64,
}

impl Session {
    /// Size of the serialized session.
    pub const SIZE: usize = 16 + 8 + 8;

    /// Creates a session with a random id and two independently-random
    /// (not zero-based) starting sequence numbers, one per direction.
    pub fn new(mut random: impl RandomSource) -> Self {
        let mut id = [0u8; 16];
        random(&mut id);
        let inbound_seq = random_u64(&mut random);
        let outbound_seq = random_u64(&mut random);
        Self { id, inbound_seq, outbound_seq }
    }

    /// Builds a session with explicit field values (used when adopting a
    /// peer's session state during the handshake, or in tests).
    #[must_use]
    pub fn from_parts(id: SessionId, inbound_seq: u64, outbound_seq: u64) -> Self {
        Self { id, inbound_seq, outbound_seq }
    }

    /// Parses a session from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::TooShort { expected: Self::SIZE, actual: bytes.len() });
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[0..16]);
        let mut inbound_bytes = [0u8; 8];
        inbound_bytes.copy_from_slice(&bytes[16..24]);
        let mut outbound_bytes = [0u8; 8];
        outbound_bytes.copy_from_slice(&bytes[24..32]);
        Ok(Self {
            id,
            inbound_seq: u64::from_be_bytes(inbound_bytes),
            outbound_seq: u64::from_be_bytes(outbound_bytes),
        })
    }

    /// Serializes the session.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.id);
        dst.put_u64(self.inbound_seq);
        dst.put_u64(self.outbound_seq);
    }

    /// This session's id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next sequence number this session expects to accept.
    #[must_use]
    pub fn inbound_seq(&self) -> u64 {
        self.inbound_seq
    }

    /// Next sequence number this session will emit.
    #[must_use]
    pub fn outbound_seq(&self) -> u64 {
        self.outbound_seq
    }

    /// Returns a session with inbound/outbound swapped.
    ///
    /// Used when adopting a peer's advertised session: what was their
    /// outbound stream is our inbound stream, and vice versa.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self { id: self.id, inbound_seq: self.outbound_seq, outbound_seq: self.inbound_seq }
    }

    /// Accepts `header` iff it matches this session's id and expected
    /// inbound sequence exactly. On acceptance, advances `inbound_seq`.
    /// Rejection (including replay of a previously-accepted header) is a
    /// hard error for the caller to act on; this method never panics.
    #[must_use]
    pub fn verify_inbound(&mut self, header: &SessionHeader) -> bool {
        if header.id() == self.id && header.seq() == self.inbound_seq {
            self.inbound_seq = self.inbound_seq.wrapping_add(1);
            true
        } else {
            false
        }
    }

    /// Returns the header for the next outbound frame, then advances
    /// `outbound_seq`.
    pub fn next_outbound(&mut self) -> SessionHeader {
        let header = SessionHeader::new(self.id, self.outbound_seq);
        self.outbound_seq = self.outbound_seq.wrapping_add(1);
        header
    }

    /// Regenerates id and both sequence numbers from `random`.
    pub fn reset(&mut self, random: impl RandomSource) {
        *self = Self::new(random);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_random(seed: u8) -> impl RandomSource {
        let mut counter = seed;
        move |buf: &mut [u8]| {
            for b in buf {
                *b = counter;
                counter = counter.wrapping_add(1);
            }
        }
    }

    #[test]
    fn session_header_round_trip() {
        let header = SessionHeader::new([7u8; 16], 0xdead_beef_0000_0001);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SessionHeader::SIZE);
        assert_eq!(SessionHeader::from_bytes(&buf).unwrap(), header);
    }

    #[test]
    fn verify_inbound_accepts_exact_match_and_advances() {
        let mut session = Session::new(counting_random(1));
        let expected = SessionHeader::new(session.id(), session.inbound_seq());
        assert!(session.verify_inbound(&expected));
        assert_eq!(session.inbound_seq(), expected.seq() + 1);
    }

    #[test]
    fn verify_inbound_rejects_replay() {
        let mut session = Session::new(counting_random(2));
        let header = SessionHeader::new(session.id(), session.inbound_seq());
        assert!(session.verify_inbound(&header));
        assert!(!session.verify_inbound(&header), "replaying the same header must be rejected");
    }

    #[test]
    fn verify_inbound_rejects_wrong_session_id() {
        let mut session = Session::new(counting_random(3));
        let header = SessionHeader::new([0xffu8; 16], session.inbound_seq());
        assert!(!session.verify_inbound(&header));
    }

    #[test]
    fn next_outbound_is_monotonic() {
        let mut session = Session::new(counting_random(4));
        let start = session.outbound_seq();
        for i in 0..5u64 {
            let header = session.next_outbound();
            assert_eq!(header.seq(), start + i);
        }
        assert_eq!(session.outbound_seq(), start + 5);
    }

    #[test]
    fn swapped_exchanges_directions() {
        let session = Session::new(counting_random(5));
        assert_ne!(
            session.inbound_seq(),
            session.outbound_seq(),
            "the two sequence numbers must be drawn independently"
        );
        let swapped = session.swapped();
        assert_eq!(swapped.inbound_seq(), session.outbound_seq());
        assert_eq!(swapped.outbound_seq(), session.inbound_seq());
    }

    #[test]
    fn session_round_trip() {
        let session = Session::from_parts([3u8; 16], 11, 22);
        let mut buf = Vec::new();
        session.encode(&mut buf);
        assert_eq!(buf.len(), Session::SIZE);
        assert_eq!(Session::from_bytes(&buf).unwrap(), session);
    }

    #[test]
    fn reset_changes_id_and_sequences() {
        let mut session = Session::new(counting_random(6));
        let before = session;
        session.reset(counting_random(200));
        assert_ne!(session.id(), before.id());
    }
}
