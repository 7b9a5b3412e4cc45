//! Per-connection handshake and session state machine (§4.5).
//!
//! Mirrors the action pattern used throughout this codebase: `Tunnel` is a
//! pure state machine with no socket and no stored `Environment` — callers
//! pass `now` and, where randomness or wall-clock time are needed, an
//! `&impl Environment` explicitly. The driver (packet-net's socket glue, or
//! the simulation harness) executes the actions returned and owns the
//! actual transport.
//!
//! Transitions only move forward; every error is fatal and the caller is
//! expected to close the tunnel's socket in response (§4.5: "All socket
//! errors, unexpected messages given state, and session violations are
//! fatal to the tunnel").

use std::{ops::Sub, sync::Arc, time::Duration};

use bytes::Bytes;
use packet_proto::{
    ClientHello, ClientKeyExchange, DataPacket, ErrorPacket, HeartbeatPacket, Message,
    MessageCatalog, PlaintextHeader, PromoteConnection, ServerHello, ServerKeyExchange, Session,
    SessionHeader, decode_tagged, encode_tagged,
};

use crate::{
    cipher::{Cipher, KeyRing},
    env::Environment,
    error::TunnelError,
    fragmentation::{self, ReassemblyBuffer},
};

/// Default maximum accepted ciphertext length per frame (§3): 2 MiB.
pub const DEFAULT_MAX_CIPHERTEXT_LENGTH: u32 = packet_proto::FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH;

/// Tunnel lifecycle state (§3, §4.5). The acceptor and initiator journeys
/// share the terminal `WaitData`/`Closed` states but diverge on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// TCP connect in progress (initiator only).
    WaitConnect,
    /// Listening for `ClientHello` (acceptor only).
    WaitClientHello,
    /// Listening for `ServerHello` (initiator only).
    WaitServerHello,
    /// Listening for `PromoteConnection` (acceptor only).
    WaitPromote,
    /// Steady-state: data, heartbeats, and key rotation.
    WaitData,
    /// Terminal. No further frames are processed.
    Closed,
}

/// Which side of the handshake a tunnel is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the TCP connection.
    Initiator,
    /// Accepted an incoming TCP connection.
    Acceptor,
}

/// Actions a driver must execute on behalf of a [`Tunnel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Write these bytes to the tunnel's socket, under `send_lock` (§4.5) so
    /// a multi-fragment message's frames land contiguously.
    Send(Bytes),
    /// Deliver this application payload upward.
    Deliver(DataPacket),
    /// Close the tunnel's socket and report it to the connection manager.
    Close {
        /// Human-readable reason, propagated to `ConnectionError`/
        /// `ConnectionTerminated` event consumers.
        reason: String,
    },
    /// The handshake completed; `initiator` matches this tunnel's [`Role`].
    ConnectionEstablished {
        /// Whether this side initiated the TCP connection.
        initiator: bool,
    },
}

/// Per-tunnel configuration independent of the connection manager's timers.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local host-id advertised in `ClientHello`/`ServerHello`.
    pub local_host_id: String,
    /// Expected peer host-id (known ahead of connect for the initiator;
    /// learned from `ClientHello` for the acceptor).
    pub peer_host_id: Option<String>,
    /// Largest accepted `ciphertext_length` (§3).
    pub max_ciphertext_length: u32,
    /// Wire-format version stamped on every `SerializableHeader`.
    pub message_version: u16,
}

impl TunnelConfig {
    /// Config for a tunnel with the default ciphertext bound and message
    /// version `1`.
    #[must_use]
    pub fn new(local_host_id: impl Into<String>, peer_host_id: Option<String>) -> Self {
        Self {
            local_host_id: local_host_id.into(),
            peer_host_id,
            max_ciphertext_length: DEFAULT_MAX_CIPHERTEXT_LENGTH,
            message_version: 1,
        }
    }
}

/// Per-TCP-socket handshake and session state machine.
pub struct Tunnel<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: TunnelState,
    role: Role,
    config: TunnelConfig,
    last_sent_time: I,
    last_recv_time: I,
    session: Option<Session>,
    parser: packet_proto::FrameParser,
    reassembly: ReassemblyBuffer,
    key_ring: Arc<dyn KeyRing>,
    pre_shared_cipher: Arc<dyn Cipher>,
    pending_kex: Option<Arc<dyn crate::cipher::KeyExchange>>,
    catalog: Arc<MessageCatalog>,
}

impl<I> Tunnel<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Builds a tunnel for the connection initiator, starting in
    /// [`TunnelState::WaitConnect`].
    #[must_use]
    pub fn new_initiator(
        now: I,
        config: TunnelConfig,
        pre_shared_cipher: Arc<dyn Cipher>,
        key_ring: Arc<dyn KeyRing>,
        catalog: Arc<MessageCatalog>,
    ) -> Self {
        let parser = packet_proto::FrameParser::new(config.max_ciphertext_length);
        Self {
            state: TunnelState::WaitConnect,
            role: Role::Initiator,
            config,
            last_sent_time: now,
            last_recv_time: now,
            session: None,
            parser,
            reassembly: ReassemblyBuffer::new(),
            key_ring,
            pre_shared_cipher,
            pending_kex: None,
            catalog,
        }
    }

    /// Builds a tunnel for an accepted connection, starting in
    /// [`TunnelState::WaitClientHello`].
    #[must_use]
    pub fn new_acceptor(
        now: I,
        config: TunnelConfig,
        pre_shared_cipher: Arc<dyn Cipher>,
        key_ring: Arc<dyn KeyRing>,
        catalog: Arc<MessageCatalog>,
    ) -> Self {
        let parser = packet_proto::FrameParser::new(config.max_ciphertext_length);
        Self {
            state: TunnelState::WaitClientHello,
            role: Role::Acceptor,
            config,
            last_sent_time: now,
            last_recv_time: now,
            session: None,
            parser,
            reassembly: ReassemblyBuffer::new(),
            key_ring,
            pre_shared_cipher,
            pending_kex: None,
            catalog,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Which side of the handshake this tunnel is playing.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer's host-id, once known. `None` for an acceptor tunnel that
    /// has not yet received `ClientHello`.
    #[must_use]
    pub fn peer_host_id(&self) -> Option<&str> {
        self.config.peer_host_id.as_deref()
    }

    /// Time this tunnel last successfully sent a frame.
    #[must_use]
    pub fn last_sent_time(&self) -> I {
        self.last_sent_time
    }

    /// Time this tunnel last successfully received and accepted a frame.
    #[must_use]
    pub fn last_recv_time(&self) -> I {
        self.last_recv_time
    }

    fn fail(&mut self, state: TunnelState, detail: impl Into<String>) -> TunnelError {
        self.state = TunnelState::Closed;
        TunnelError::Protocol { state, detail: detail.into() }
    }

    /// Every `TunnelError` is fatal (§4.5); driver-invoked methods that
    /// encode and send (as opposed to those reached only through
    /// `feed_bytes`, which already closes on any handler error) route their
    /// fallible body through here so a crypto or framing failure mid-send
    /// also closes the tunnel instead of leaving it in a half-failed state.
    fn close_on_err<T>(&mut self, result: Result<T, TunnelError>) -> Result<T, TunnelError> {
        if result.is_err() {
            self.state = TunnelState::Closed;
        }
        result
    }

    /// Initiator: call once the TCP connect completes.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Protocol`] if not in [`TunnelState::WaitConnect`].
    pub fn on_connected(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if self.state != TunnelState::WaitConnect {
            return Err(self.fail(self.state, "on_connected called outside WaitConnect"));
        }

        let kex = self.key_ring.create_key_exchange(&[]);
        self.pending_kex = Some(kex.clone());

        let hello = ClientHello {
            host_id: self.config.local_host_id.clone(),
            cipher_suite: self.key_ring.cipher_suite(),
            kex_params: kex.params(),
        };

        let frame_result = self.encode_and_frame(env, &hello.into(), false);
        let frame = self.close_on_err(frame_result)?;
        self.state = TunnelState::WaitServerHello;
        self.last_sent_time = now;

        Ok(vec![TunnelAction::Send(frame)])
    }

    /// Acceptor: call when a raw TCP accept completes, before any bytes
    /// have arrived. Exists purely for symmetry with `on_connected`; the
    /// acceptor has nothing to send yet.
    pub fn on_accepted(&mut self, now: I) {
        self.last_sent_time = now;
        self.last_recv_time = now;
    }

    fn encode_and_frame(
        &mut self,
        env: &impl Environment<Instant = I>,
        message: &Message,
        include_session: bool,
    ) -> Result<Bytes, TunnelError> {
        self.encode_and_frame_compressed(env, message, include_session, false)
    }

    fn encode_and_frame_compressed(
        &mut self,
        env: &impl Environment<Instant = I>,
        message: &Message,
        include_session: bool,
        compress: bool,
    ) -> Result<Bytes, TunnelError> {
        let cipher: Arc<dyn Cipher> = if include_session {
            self.key_ring.random_cipher()?
        } else {
            self.pre_shared_cipher.clone()
        };

        let session_header = if include_session {
            let session = self.session.as_mut().ok_or_else(|| TunnelError::Session(
                "attempted to send session-bound frame with no session established".into(),
            ))?;
            Some(session.next_outbound())
        } else {
            None
        };

        let mut random = env.random_source();
        let random_length = {
            let mut byte = [0u8; 1];
            random(&mut byte);
            packet_proto::plaintext::MIN_RANDOM_LENGTH
                + byte[0] % (packet_proto::plaintext::MAX_RANDOM_LENGTH - packet_proto::plaintext::MIN_RANDOM_LENGTH + 1)
        };
        let mut padding = vec![0u8; random_length as usize];
        random(&mut padding);

        let flags = PlaintextHeader::flags_for(session_header.is_some(), compress);
        let header = PlaintextHeader::new(random_length, flags)?;

        let mut plaintext = Vec::new();
        header.encode(&mut plaintext);
        plaintext.extend_from_slice(&padding);
        if let Some(session_header) = session_header {
            let mut buf = Vec::new();
            session_header.encode(&mut buf);
            plaintext.extend_from_slice(&buf);
        }

        let body = encode_tagged(message, self.config.message_version);
        if compress {
            use std::io::Write;
            let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&body)
                .map_err(|e| TunnelError::Resource(format!("compression failed: {e}")))?;
            let compressed =
                encoder.finish().map_err(|e| TunnelError::Resource(format!("compression failed: {e}")))?;
            plaintext.extend_from_slice(&compressed);
        } else {
            plaintext.extend_from_slice(&body);
        }

        let ciphertext = cipher.encrypt_and_frame(&plaintext);
        Ok(packet_proto::encode_frame(cipher.key_id(), &ciphertext))
    }

    /// Feeds raw transport bytes (arbitrarily chunked) through the frame
    /// parser, decrypting and dispatching each completed frame.
    ///
    /// # Errors
    ///
    /// Any error returned is fatal: the tunnel has already transitioned to
    /// [`TunnelState::Closed`].
    pub fn feed_bytes(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        bytes: &[u8],
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        // The parser's own accumulation state must survive across calls (a
        // frame header or ciphertext body can span more than one
        // `feed_bytes` call), but `Handler` needs to borrow `self` mutably
        // while the parser runs, so the real parser is swapped out for a
        // placeholder for the duration of the call and swapped back after.
        let placeholder = packet_proto::FrameParser::new(self.config.max_ciphertext_length);
        let mut parser = std::mem::replace(&mut self.parser, placeholder);
        let mut handler = Handler { tunnel: self, env, now, actions: Vec::new(), error: None };
        let parse_result = parser.feed(bytes, &mut handler);

        let Handler { actions, error, .. } = handler;
        self.parser = parser;

        if let Some(error) = error {
            self.state = TunnelState::Closed;
            return Err(error);
        }
        if let Err(protocol_error) = parse_result {
            self.state = TunnelState::Closed;
            return Err(protocol_error.into());
        }

        Ok(actions)
    }

    fn process_ciphertext(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        key_id: packet_proto::KeyId,
        ciphertext: Bytes,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        let cipher = self.cipher_for_state(&key_id)?;
        let plaintext = cipher.decrypt(&ciphertext)?;

        let header = PlaintextHeader::from_bytes(&plaintext)?;
        let mut offset = PlaintextHeader::SIZE + header.random_length() as usize;

        if header.has_session_header() {
            let Some(session) = self.session.as_mut() else {
                return Err(self.fail(self.state, "session header present before session established"));
            };
            let session_header = SessionHeader::from_bytes(&plaintext[offset..])?;
            offset += SessionHeader::SIZE;
            if !session.verify_inbound(&session_header) {
                return Err(self.fail(self.state, "session sequence/id mismatch (possible replay)"));
            }
        } else if self.session.is_some() {
            return Err(self.fail(self.state, "session header expected but absent"));
        }

        let body = if header.is_compressed() {
            use std::io::Read;
            let mut decoder = flate2::read::DeflateDecoder::new(&plaintext[offset..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| TunnelError::Resource(format!("decompression failed: {e}")))?;
            Bytes::from(out)
        } else {
            Bytes::copy_from_slice(&plaintext[offset..])
        };

        let message = decode_tagged(&body, &self.catalog)?;
        self.last_recv_time = now;
        self.dispatch(env, now, message)
    }

    fn cipher_for_state(&self, key_id: &packet_proto::KeyId) -> Result<Arc<dyn Cipher>, TunnelError> {
        match self.state {
            TunnelState::WaitClientHello | TunnelState::WaitServerHello => {
                if *key_id == self.pre_shared_cipher.key_id() {
                    Ok(self.pre_shared_cipher.clone())
                } else {
                    Err(TunnelError::Crypto(crate::cipher::CipherError::UnknownKeyId))
                }
            }
            TunnelState::WaitPromote | TunnelState::WaitData => self
                .key_ring
                .cipher_for(key_id)
                .ok_or(TunnelError::Crypto(crate::cipher::CipherError::UnknownKeyId)),
            TunnelState::WaitConnect | TunnelState::Closed => {
                Err(TunnelError::Crypto(crate::cipher::CipherError::UnknownKeyId))
            }
        }
    }

    fn dispatch(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        message: Message,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        match (self.state, message) {
            (TunnelState::WaitClientHello, Message::ClientHello(hello)) => {
                self.handle_client_hello(env, now, hello)
            }
            (TunnelState::WaitServerHello, Message::ServerHello(hello)) => {
                self.handle_server_hello(env, now, hello)
            }
            (TunnelState::WaitPromote, Message::PromoteConnection(promote)) => {
                self.handle_promote(promote)
            }
            (TunnelState::WaitData, Message::ClientKeyExchange(kex)) => {
                self.handle_client_key_exchange(env, now, kex)
            }
            (TunnelState::WaitData, Message::ServerKeyExchange(kex)) => {
                self.handle_server_key_exchange(kex)
            }
            (TunnelState::WaitData, Message::Heartbeat(_)) => Ok(vec![]),
            (TunnelState::WaitData, Message::Error(err)) => {
                Err(self.fail(self.state, format!("peer reported error {}: {}", err.code, err.message)))
            }
            (TunnelState::WaitData, message @ (Message::Data(_) | Message::Fragment(_))) => {
                match self.reassembly.feed(message, &self.catalog)? {
                    Some(Message::Data(data)) => Ok(vec![TunnelAction::Deliver(data)]),
                    Some(_) | None => Ok(vec![]),
                }
            }
            (state, message) => {
                Err(self.fail(state, format!("unexpected message {:?} in state {state:?}", message.type_tag())))
            }
        }
    }

    fn handle_client_hello(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        hello: ClientHello,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if let Some(expected) = &self.config.peer_host_id {
            if *expected != hello.host_id {
                return Err(self.fail(self.state, "ClientHello host-id mismatch"));
            }
        }
        self.config.peer_host_id = Some(hello.host_id.clone());

        let kex = self.key_ring.create_key_exchange(&hello.kex_params);
        let shared_key = kex.derive_shared_key(&hello.kex_params)?;
        let cipher = Arc::new(crate::cipher::ChaChaCipher::new(kex.id(), &shared_key));
        self.key_ring.add_cipher_key(cipher);

        let session = Session::new(env.random_source());
        self.session = Some(session);

        let server_hello = ServerHello {
            host_id: self.config.local_host_id.clone(),
            session,
            cipher_suite: self.key_ring.cipher_suite(),
            kex_params: kex.params(),
        };

        let frame = self.encode_and_frame(env, &server_hello.into(), false)?;
        self.state = TunnelState::WaitPromote;
        self.last_sent_time = now;

        Ok(vec![TunnelAction::Send(frame)])
    }

    fn handle_server_hello(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        hello: ServerHello,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if let Some(expected) = &self.config.peer_host_id {
            if *expected != hello.host_id {
                return Err(self.fail(self.state, "ServerHello host-id mismatch"));
            }
        }
        self.config.peer_host_id = Some(hello.host_id);

        let Some(kex) = self.pending_kex.take() else {
            return Err(self.fail(self.state, "no key exchange in flight for ServerHello"));
        };
        let shared_key = kex.derive_shared_key(&hello.kex_params)?;
        let cipher = Arc::new(crate::cipher::ChaChaCipher::new(kex.id(), &shared_key));
        self.key_ring.add_cipher_key(cipher);

        // What was the acceptor's outbound stream is our inbound stream,
        // and vice versa.
        self.session = Some(hello.session.swapped());

        let promote = PromoteConnection { host_id: self.config.local_host_id.clone() };
        let frame = self.encode_and_frame(env, &promote.into(), true)?;
        self.state = TunnelState::WaitData;
        self.last_sent_time = now;

        Ok(vec![TunnelAction::Send(frame), TunnelAction::ConnectionEstablished { initiator: true }])
    }

    fn handle_promote(&mut self, promote: PromoteConnection) -> Result<Vec<TunnelAction>, TunnelError> {
        if let Some(expected) = &self.config.peer_host_id {
            if *expected != promote.host_id {
                return Err(self.fail(self.state, "PromoteConnection host-id mismatch"));
            }
        }
        self.state = TunnelState::WaitData;
        Ok(vec![TunnelAction::ConnectionEstablished { initiator: false }])
    }

    fn handle_client_key_exchange(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        kex: ClientKeyExchange,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        let our_kex = self.key_ring.create_key_exchange(&kex.kex_params);
        let shared_key = our_kex.derive_shared_key(&kex.kex_params)?;
        let cipher = Arc::new(crate::cipher::ChaChaCipher::new(our_kex.id(), &shared_key));
        self.key_ring.add_cipher_key(cipher);

        let response =
            ServerKeyExchange { cipher_suite: kex.cipher_suite, kex_params: our_kex.params() };
        let frame = self.encode_and_frame(env, &response.into(), true)?;
        self.last_sent_time = now;

        Ok(vec![TunnelAction::Send(frame)])
    }

    fn handle_server_key_exchange(
        &mut self,
        kex: ServerKeyExchange,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        let Some(our_kex) = self.pending_kex.take() else {
            return Err(self.fail(self.state, "no key exchange in flight for ServerKeyExchange"));
        };
        let shared_key = our_kex.derive_shared_key(&kex.kex_params)?;
        let cipher = Arc::new(crate::cipher::ChaChaCipher::new(our_kex.id(), &shared_key));
        self.key_ring.add_cipher_key(cipher);
        Ok(vec![])
    }

    /// Initiates key rotation: derives a new ephemeral key exchange and
    /// sends `ClientKeyExchange` carrying our half.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Protocol`] if not in [`TunnelState::WaitData`].
    pub fn rotate_key(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if self.state != TunnelState::WaitData {
            return Err(self.fail(self.state, "rotate_key called outside WaitData"));
        }
        let kex = self.key_ring.create_key_exchange(&[]);
        self.pending_kex = Some(kex.clone());

        let message = ClientKeyExchange { cipher_suite: self.key_ring.cipher_suite(), kex_params: kex.params() };
        let frame_result = self.encode_and_frame(env, &message.into(), true);
        let frame = self.close_on_err(frame_result)?;
        self.last_sent_time = now;
        Ok(vec![TunnelAction::Send(frame)])
    }

    /// Serializes, fragments if necessary, and frames `bytes` as a
    /// `DataPacket` from `host_id`. Must be called in [`TunnelState::WaitData`].
    /// `compress` deflates each resulting frame's payload before encryption,
    /// at the cost of the CPU time spent compressing.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Protocol`] if not in [`TunnelState::WaitData`].
    pub fn send_data(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        bytes: Bytes,
        compress: bool,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if self.state != TunnelState::WaitData {
            return Err(self.fail(self.state, "send_data called outside WaitData"));
        }

        let data: Message = DataPacket {
            host_id: self.config.local_host_id.clone(),
            chunk_index: 1,
            chunk_count: 1,
            bytes,
        }
        .into();

        let cipher_result = self.key_ring.random_cipher().map_err(TunnelError::from);
        let cipher_overhead = self.close_on_err(cipher_result)?.max_framing_overhead_length();
        let limit = fragmentation::max_fragment_payload(
            self.config.max_ciphertext_length,
            cipher_overhead,
            "Fragment",
        );

        let mut actions = Vec::new();
        for piece in fragmentation::fragment_message(&data, limit) {
            let frame_result = self.encode_and_frame_compressed(env, &piece, true, compress);
            let frame = self.close_on_err(frame_result)?;
            actions.push(TunnelAction::Send(frame));
        }
        self.last_sent_time = now;
        Ok(actions)
    }

    /// Sends a `HeartbeatPacket`. Called by the connection manager's timer,
    /// not by application code directly (§4.6).
    ///
    /// # Errors
    ///
    /// [`TunnelError::Protocol`] if not in [`TunnelState::WaitData`].
    pub fn send_heartbeat(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        wall_clock_now: u64,
        last_recv_wall_clock: u64,
    ) -> Result<Vec<TunnelAction>, TunnelError> {
        if self.state != TunnelState::WaitData {
            return Err(self.fail(self.state, "send_heartbeat called outside WaitData"));
        }
        let heartbeat: Message =
            HeartbeatPacket { last_recv_time_seen: last_recv_wall_clock, now: wall_clock_now }.into();
        let frame_result = self.encode_and_frame(env, &heartbeat, true);
        let frame = self.close_on_err(frame_result)?;
        self.last_sent_time = now;
        Ok(vec![TunnelAction::Send(frame)])
    }

    /// Sends an `ErrorPacket` and marks the tunnel closed. Used when this
    /// side wants to tell the peer why it is tearing the tunnel down before
    /// actually doing so.
    pub fn send_error_and_close(
        &mut self,
        env: &impl Environment<Instant = I>,
        code: u16,
        message: impl Into<String>,
    ) -> Vec<TunnelAction> {
        let packet: Message = ErrorPacket { code, message: message.into() }.into();
        let mut actions = Vec::new();
        if self.state == TunnelState::WaitData {
            if let Ok(frame) = self.encode_and_frame(env, &packet, true) {
                actions.push(TunnelAction::Send(frame));
            }
        }
        self.state = TunnelState::Closed;
        actions.push(TunnelAction::Close { reason: "local error".into() });
        actions
    }

    /// Marks the tunnel closed without sending anything (e.g. after a
    /// transport-level disconnect).
    pub fn close(&mut self) {
        self.state = TunnelState::Closed;
    }
}

struct Handler<'a, I, E>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
    E: Environment<Instant = I>,
{
    tunnel: &'a mut Tunnel<I>,
    env: &'a E,
    now: I,
    actions: Vec<TunnelAction>,
    error: Option<TunnelError>,
}

impl<I, E> packet_proto::FrameHandler for Handler<'_, I, E>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
    E: Environment<Instant = I>,
{
    fn on_frame(
        &mut self,
        key_id: packet_proto::KeyId,
        ciphertext: Bytes,
    ) -> packet_proto::Result<()> {
        match self.tunnel.process_ciphertext(self.env, self.now, key_id, ciphertext) {
            Ok(actions) => {
                self.actions.extend(actions);
                Ok(())
            }
            Err(err) => {
                self.error = Some(err);
                Err(packet_proto::ProtocolError::Malformed("tunnel rejected frame"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::cipher::{ChaChaCipher, InMemoryKeyRing, SymmetricKey};

    #[derive(Clone)]
    struct TestEnv {
        seed: u8,
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn wall_clock_secs(&self) -> u64 {
            0
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = self.seed.wrapping_add(i as u8);
            }
        }
    }

    fn pre_shared_cipher() -> Arc<dyn Cipher> {
        Arc::new(ChaChaCipher::new([0xAA; 32], &SymmetricKey([0x11; 32])))
    }

    fn run_handshake() -> (Tunnel<Instant>, Tunnel<Instant>, TestEnv, TestEnv) {
        let t0 = Instant::now();
        let client_env = TestEnv { seed: 1 };
        let server_env = TestEnv { seed: 2 };

        let mut client = Tunnel::new_initiator(
            t0,
            TunnelConfig::new("A", Some("B".into())),
            pre_shared_cipher(),
            Arc::new(InMemoryKeyRing::new()),
            Arc::new(MessageCatalog::with_defaults()),
        );
        let mut server = Tunnel::new_acceptor(
            t0,
            TunnelConfig::new("B", Some("A".into())),
            pre_shared_cipher(),
            Arc::new(InMemoryKeyRing::new()),
            Arc::new(MessageCatalog::with_defaults()),
        );

        let actions = client.on_connected(&client_env, t0).expect("should send ClientHello");
        let TunnelAction::Send(client_hello_frame) = &actions[0] else { panic!("expected Send") };

        let actions = server
            .feed_bytes(&server_env, t0, client_hello_frame)
            .expect("server should accept ClientHello");
        let TunnelAction::Send(server_hello_frame) = &actions[0] else { panic!("expected Send") };

        let actions = client
            .feed_bytes(&client_env, t0, server_hello_frame)
            .expect("client should accept ServerHello");
        assert!(actions.iter().any(|a| matches!(a, TunnelAction::ConnectionEstablished { initiator: true })));
        let TunnelAction::Send(promote_frame) = &actions[0] else { panic!("expected Send") };

        let actions = server
            .feed_bytes(&server_env, t0, promote_frame)
            .expect("server should accept PromoteConnection");
        assert!(actions.iter().any(|a| matches!(a, TunnelAction::ConnectionEstablished { initiator: false })));

        assert_eq!(client.state(), TunnelState::WaitData);
        assert_eq!(server.state(), TunnelState::WaitData);

        (client, server, client_env, server_env)
    }

    #[test]
    fn happy_handshake_reaches_wait_data_both_sides() {
        run_handshake();
    }

    #[test]
    fn data_packet_round_trips_after_handshake() {
        let (mut client, mut server, client_env, server_env) = run_handshake();
        let t1 = Instant::now();

        let actions = client
            .send_data(&client_env, t1, Bytes::from_static(&[0x01, 0x02, 0x03]), false)
            .expect("should send data");
        let TunnelAction::Send(frame) = &actions[0] else { panic!("expected Send") };

        let actions =
            server.feed_bytes(&server_env, t1, frame).expect("server should accept DataPacket");
        let TunnelAction::Deliver(delivered) = &actions[0] else { panic!("expected Deliver") };
        assert_eq!(&delivered.bytes[..], &[0x01, 0x02, 0x03]);
        assert_eq!(delivered.host_id, "A");
    }

    #[test]
    fn compressed_data_packet_round_trips_after_handshake() {
        let (mut client, mut server, client_env, server_env) = run_handshake();
        let t1 = Instant::now();
        let payload = Bytes::from(vec![0x42u8; 512]);

        let actions = client
            .send_data(&client_env, t1, payload.clone(), true)
            .expect("should send compressed data");
        let TunnelAction::Send(frame) = &actions[0] else { panic!("expected Send") };

        let actions =
            server.feed_bytes(&server_env, t1, frame).expect("server should accept compressed DataPacket");
        let TunnelAction::Deliver(delivered) = &actions[0] else { panic!("expected Deliver") };
        assert_eq!(&delivered.bytes[..], &payload[..]);
    }

    #[test]
    fn replaying_a_frame_is_rejected() {
        let (mut client, mut server, client_env, server_env) = run_handshake();
        let t1 = Instant::now();

        let actions = client
            .send_data(&client_env, t1, Bytes::from_static(&[0xAB]), false)
            .expect("should send data");
        let TunnelAction::Send(frame) = actions[0].clone() else { panic!("expected Send") };

        server.feed_bytes(&server_env, t1, &frame).expect("first delivery should succeed");

        let replay_result = server.feed_bytes(&server_env, t1, &frame);
        assert!(replay_result.is_err(), "replayed frame must be rejected");
        assert_eq!(server.state(), TunnelState::Closed);
    }

    #[test]
    fn unexpected_message_in_state_is_protocol_error() {
        let t0 = Instant::now();
        let env = TestEnv { seed: 5 };
        let mut server = Tunnel::new_acceptor(
            t0,
            TunnelConfig::new("B", None),
            pre_shared_cipher(),
            Arc::new(InMemoryKeyRing::new()),
            Arc::new(MessageCatalog::with_defaults()),
        );

        let promote: Message = PromoteConnection { host_id: "A".into() }.into();
        let cipher = pre_shared_cipher();
        let frame_bytes = {
            let mut plaintext = Vec::new();
            let header = PlaintextHeader::new(5, 0).unwrap();
            header.encode(&mut plaintext);
            plaintext.extend_from_slice(&[0u8; 5]);
            plaintext.extend_from_slice(&encode_tagged(&promote, 1));
            let ciphertext = cipher.encrypt_and_frame(&plaintext);
            packet_proto::encode_frame(cipher.key_id(), &ciphertext)
        };

        let result = server.feed_bytes(&env, t0, &frame_bytes);
        assert!(result.is_err());
        assert_eq!(server.state(), TunnelState::Closed);
    }
}
