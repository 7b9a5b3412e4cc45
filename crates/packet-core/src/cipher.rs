//! Collaborator contracts this crate consumes but does not mandate the
//! implementation of: the AEAD cipher, the key-ring, and the key-exchange
//! primitive (§6). A reference implementation (ChaCha20-Poly1305 over
//! X25519) is provided for tests and the simulation harness; production
//! deployments may supply their own.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use chacha20poly1305::{
    AeadCore, ChaCha20Poly1305, KeyInit,
    aead::{Aead, OsRng},
};
use hkdf::Hkdf;
use packet_proto::KeyId;
use parking_lot::Mutex;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub [u8; 32]);

/// Errors from the cipher/key-exchange collaborator boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// AEAD decryption failed (bad MAC, wrong key, or truncated ciphertext).
    #[error("decryption failed")]
    DecryptFailed,

    /// The ciphertext blob was shorter than a nonce, so no IV could be read.
    #[error("ciphertext shorter than nonce")]
    CiphertextTooShort,

    /// No cipher is installed for the requested key-id.
    #[error("unknown key-id")]
    UnknownKeyId,

    /// No cipher is installed in the key-ring at all.
    #[error("key-ring is empty")]
    EmptyKeyRing,

    /// No key-exchange is in flight for the requested id.
    #[error("unknown key-exchange id")]
    UnknownKeyExchangeId,
}

/// An installed, ready-to-use symmetric cipher, named by its key-id.
///
/// Implementations own encrypt-then-MAC framing end to end: `encrypt_and_frame`
/// returns the exact bytes that follow a frame's [`packet_proto::FrameHeader`]
/// (an explicit IV, the ciphertext, and the authentication tag); `decrypt`
/// inverts that and MUST verify the tag before returning any plaintext byte.
pub trait Cipher: Send + Sync {
    /// The key-id this cipher is installed under.
    fn key_id(&self) -> KeyId;

    /// Encrypts `plaintext`, returning `iv || ciphertext || mac`.
    fn encrypt_and_frame(&self, plaintext: &[u8]) -> Vec<u8>;

    /// Verifies and decrypts a buffer previously produced by
    /// `encrypt_and_frame`.
    ///
    /// # Errors
    ///
    /// [`CipherError::DecryptFailed`] on MAC failure or corrupt input.
    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Bytes of overhead (IV + MAC) this cipher adds to every frame, used to
    /// compute `max_fragment_payload` (§4.4).
    fn max_framing_overhead_length(&self) -> usize;
}

/// One side of an in-progress Diffie-Hellman-style key exchange.
pub trait KeyExchange: Send + Sync {
    /// Identifies this exchange for a later [`KeyRing::key_exchange_for`]
    /// lookup (needed when a handshake step and its response arrive in
    /// separate messages).
    fn id(&self) -> KeyId;

    /// This side's public parameters, to be sent to the peer.
    fn params(&self) -> Bytes;

    /// Derives the shared symmetric key from the peer's public parameters.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the reference implementation never fails
    /// for well-formed 32-byte X25519 public keys.
    fn derive_shared_key(&self, peer_params: &[u8]) -> Result<SymmetricKey, CipherError>;
}

/// Shared collection of installed ciphers and in-flight key exchanges.
///
/// Reads (`cipher_for`, `random_cipher`) are frequent and dominate; writes
/// (`add_cipher_key`) happen only during key exchange (§5: "any internal
/// locking is the key-ring's responsibility").
pub trait KeyRing: Send + Sync {
    /// Looks up an installed cipher by key-id.
    fn cipher_for(&self, key_id: &KeyId) -> Option<Arc<dyn Cipher>>;

    /// Picks a cipher uniformly at random among those installed, so no
    /// single key-id dominates a tunnel's outbound traffic.
    fn random_cipher(&self) -> Result<Arc<dyn Cipher>, CipherError>;

    /// Installs a newly-derived cipher, making it eligible for
    /// `random_cipher` and lookup by `cipher_for`.
    fn add_cipher_key(&self, cipher: Arc<dyn Cipher>);

    /// Starts a new key exchange, to be sent to the peer and later completed
    /// with `derive_shared_key` once their half arrives. `peer_params` is the
    /// peer's half when one is already in hand (responding to a `ClientHello`
    /// or `ClientKeyExchange`); empty when this side is initiating and has
    /// nothing to respond to yet.
    fn create_key_exchange(&self, peer_params: &[u8]) -> Arc<dyn KeyExchange>;

    /// Looks up an in-flight key exchange by id.
    fn key_exchange_for(&self, id: &KeyId) -> Option<Arc<dyn KeyExchange>>;

    /// The cipher suite this key-ring negotiates.
    fn cipher_suite(&self) -> u16;
}

/// Reference cipher suite: ChaCha20-Poly1305 AEAD over an X25519 key
/// exchange, keys derived via HKDF-SHA256.
pub const CIPHER_SUITE_CHACHA20POLY1305_X25519: u16 = 0x0001;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"packet-core/chacha20poly1305-x25519/v1";

/// ChaCha20-Poly1305 [`Cipher`] reference implementation.
pub struct ChaChaCipher {
    key_id: KeyId,
    aead: ChaCha20Poly1305,
}

impl ChaChaCipher {
    /// Builds a cipher named `key_id` from a 32-byte symmetric key.
    #[must_use]
    pub fn new(key_id: KeyId, key: &SymmetricKey) -> Self {
        #[allow(clippy::expect_used)]
        let aead = ChaCha20Poly1305::new_from_slice(&key.0).expect("key is exactly 32 bytes");
        Self { key_id, aead }
    }
}

impl Cipher for ChaChaCipher {
    fn key_id(&self) -> KeyId {
        self.key_id
    }

    fn encrypt_and_frame(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        #[allow(clippy::expect_used)]
        let ciphertext = self.aead.encrypt(&nonce, plaintext).expect("encryption is infallible");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CipherError> {
        if bytes.len() < NONCE_LEN {
            return Err(CipherError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.aead
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| CipherError::DecryptFailed)
    }

    fn max_framing_overhead_length(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }
}

/// X25519 [`KeyExchange`] reference implementation.
pub struct X25519KeyExchange {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl X25519KeyExchange {
    /// Generates a fresh ephemeral keypair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl KeyExchange for X25519KeyExchange {
    fn id(&self) -> KeyId {
        *self.public.as_bytes()
    }

    fn params(&self) -> Bytes {
        Bytes::copy_from_slice(self.public.as_bytes())
    }

    fn derive_shared_key(&self, peer_params: &[u8]) -> Result<SymmetricKey, CipherError> {
        let peer_bytes: [u8; 32] =
            peer_params.try_into().map_err(|_| CipherError::DecryptFailed)?;
        let peer_public = x25519_dalek::PublicKey::from(peer_bytes);
        let shared = self.secret.diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        #[allow(clippy::expect_used)]
        hk.expand(HKDF_INFO, &mut key).expect("32 is a valid HKDF-SHA256 output length");
        Ok(SymmetricKey(key))
    }
}

/// In-memory [`KeyRing`] reference implementation, guarded by a mutex as the
/// trait contract requires.
pub struct InMemoryKeyRing {
    ciphers: Mutex<HashMap<KeyId, Arc<dyn Cipher>>>,
    exchanges: Mutex<HashMap<KeyId, Arc<dyn KeyExchange>>>,
    cipher_suite: u16,
}

impl InMemoryKeyRing {
    /// An empty key-ring negotiating [`CIPHER_SUITE_CHACHA20POLY1305_X25519`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            ciphers: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            cipher_suite: CIPHER_SUITE_CHACHA20POLY1305_X25519,
        }
    }
}

impl Default for InMemoryKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRing for InMemoryKeyRing {
    fn cipher_for(&self, key_id: &KeyId) -> Option<Arc<dyn Cipher>> {
        self.ciphers.lock().get(key_id).cloned()
    }

    fn random_cipher(&self) -> Result<Arc<dyn Cipher>, CipherError> {
        use rand::seq::IteratorRandom;
        self.ciphers
            .lock()
            .values()
            .cloned()
            .choose(&mut rand::thread_rng())
            .ok_or(CipherError::EmptyKeyRing)
    }

    fn add_cipher_key(&self, cipher: Arc<dyn Cipher>) {
        self.ciphers.lock().insert(cipher.key_id(), cipher);
    }

    fn create_key_exchange(&self, _peer_params: &[u8]) -> Arc<dyn KeyExchange> {
        let exchange: Arc<dyn KeyExchange> = Arc::new(X25519KeyExchange::generate());
        self.exchanges.lock().insert(exchange.id(), exchange.clone());
        exchange
    }

    fn key_exchange_for(&self, id: &KeyId) -> Option<Arc<dyn KeyExchange>> {
        self.exchanges.lock().get(id).cloned()
    }

    fn cipher_suite(&self) -> u16 {
        self.cipher_suite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chacha_cipher_round_trips() {
        let key = SymmetricKey([7u8; 32]);
        let cipher = ChaChaCipher::new([1u8; 32], &key);
        let framed = cipher.encrypt_and_frame(b"hello tunnel");
        let plaintext = cipher.decrypt(&framed).expect("should decrypt");
        assert_eq!(plaintext, b"hello tunnel");
    }

    #[test]
    fn chacha_cipher_rejects_tampered_ciphertext() {
        let key = SymmetricKey([9u8; 32]);
        let cipher = ChaChaCipher::new([2u8; 32], &key);
        let mut framed = cipher.encrypt_and_frame(b"payload");
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(cipher.decrypt(&framed), Err(CipherError::DecryptFailed)));
    }

    #[test]
    fn x25519_exchange_derives_matching_shared_key() {
        let alice = X25519KeyExchange::generate();
        let bob = X25519KeyExchange::generate();

        let alice_key = alice.derive_shared_key(&bob.params()).expect("should derive");
        let bob_key = bob.derive_shared_key(&alice.params()).expect("should derive");

        assert_eq!(alice_key.0, bob_key.0);
    }

    #[test]
    fn key_ring_random_cipher_fails_when_empty() {
        let ring = InMemoryKeyRing::new();
        assert!(matches!(ring.random_cipher(), Err(CipherError::EmptyKeyRing)));
    }

    #[test]
    fn key_ring_round_trips_install_and_lookup() {
        let ring = InMemoryKeyRing::new();
        let key = SymmetricKey([3u8; 32]);
        let cipher = Arc::new(ChaChaCipher::new([4u8; 32], &key));
        ring.add_cipher_key(cipher.clone());

        let looked_up = ring.cipher_for(&[4u8; 32]).expect("should find installed cipher");
        assert_eq!(looked_up.key_id(), [4u8; 32]);
        assert!(ring.random_cipher().is_ok());
    }

    #[test]
    fn key_ring_tracks_in_flight_exchanges() {
        let ring = InMemoryKeyRing::new();
        let exchange = ring.create_key_exchange(&[]);
        let found = ring.key_exchange_for(&exchange.id()).expect("should find exchange");
        assert_eq!(found.id(), exchange.id());
    }
}
