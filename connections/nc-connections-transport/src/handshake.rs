//! `EncryptionRunner`: drives a `HandshakeCipher` as initiator or responder
//! over an `EndpointChannel`, producing an `EncryptionContext` plus a short
//! authentication token (spec §4.5).

use crate::channel::{EncryptionContext, EndpointChannel};
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use nc_connections_core::error::{ChannelError, HandshakeError};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// One step of a two-party handshake: either more bytes to send, a final
/// result, or failure. This is the opaque contract named without pinning a
/// specific cryptographic construction (spec §4.5).
pub enum HandshakeStep {
    /// Send `outgoing` and wait for the peer's next message.
    Continue { outgoing: Bytes },
    /// The handshake is complete; `outgoing`, if present, is the last
    /// message to send before switching to the derived context.
    Done {
        outgoing: Option<Bytes>,
        context: Arc<dyn EncryptionContext>,
        auth_token: String,
        raw_auth_token: Bytes,
    },
    Failed(HandshakeError),
}

/// The pluggable two-party state machine `EncryptionRunner` drives (spec
/// §4.5). Implementations are not required to model UKEY2 byte-exactly;
/// they only need to honor the `step` contract.
pub trait HandshakeCipher: Send {
    fn start(&mut self) -> HandshakeStep;
    fn step(&mut self, incoming: &[u8]) -> HandshakeStep;
}

/// A `ChaCha20Poly1305` context keyed from an HKDF-SHA256 derivation over an
/// X25519 shared secret (spec §4.5). Nonces are built from the 12
/// low-order bytes of the big-endian per-direction counter; counters are
/// supplied by `EndpointChannel` and never reused.
pub struct ChaCha20Ukey2Context {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
}

fn nonce_from_counter(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::clone_from_slice(&bytes)
}

impl EncryptionContext for ChaCha20Ukey2Context {
    fn seal(&self, plaintext: &[u8], send_counter: u64) -> Result<Bytes, ChannelError> {
        self.send_cipher
            .encrypt(&nonce_from_counter(send_counter), plaintext)
            .map(Bytes::from)
            .map_err(|_| ChannelError::InvalidPayload)
    }

    fn open(&self, ciphertext: &[u8], recv_counter: u64) -> Result<Bytes, ChannelError> {
        self.recv_cipher
            .decrypt(&nonce_from_counter(recv_counter), ciphertext)
            .map(Bytes::from)
            .map_err(|_| ChannelError::InvalidPayload)
    }
}

enum Role {
    Initiator,
    Responder,
}

/// An unauthenticated X25519 key exchange: each side sends its ephemeral
/// public key and, on receiving the peer's, derives the session keys.
/// Grounded in the shape of the real UKEY2 handshake (key agreement plus
/// key-confirmation material) but built from off-the-shelf primitives
/// rather than a byte-exact reimplementation (spec §4.5). `NullCipher`
/// below is the deterministic test stand-in.
pub struct X25519Ukey2Cipher {
    role: Role,
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    done: bool,
}

const UKEY2_HKDF_INFO: &[u8] = b"nearby-connections/ukey2/v1";
const AUTH_TOKEN_LEN: usize = 32;

impl X25519Ukey2Cipher {
    fn new(role: Role) -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            role,
            secret: Some(secret),
            public,
            done: false,
        }
    }

    pub fn initiator() -> Self {
        Self::new(Role::Initiator)
    }

    pub fn responder() -> Self {
        Self::new(Role::Responder)
    }

    fn derive(&self, shared_secret: &[u8; 32]) -> (ChaCha20Ukey2Context, String, Bytes) {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut okm = [0u8; 32 + 32 + AUTH_TOKEN_LEN];
        hk.expand(UKEY2_HKDF_INFO, &mut okm)
            .expect("HKDF output length is within RFC 5869 bounds");
        let (key_a, rest) = okm.split_at(32);
        let (key_b, auth_material) = rest.split_at(32);

        let (send_key, recv_key) = match self.role {
            Role::Initiator => (key_a, key_b),
            Role::Responder => (key_b, key_a),
        };
        let context = ChaCha20Ukey2Context {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
        };
        use base64::Engine;
        let auth_token = base64::engine::general_purpose::STANDARD.encode(&auth_material[..9]);
        (context, auth_token, Bytes::copy_from_slice(auth_material))
    }
}

impl HandshakeCipher for X25519Ukey2Cipher {
    fn start(&mut self) -> HandshakeStep {
        HandshakeStep::Continue {
            outgoing: Bytes::copy_from_slice(self.public.as_bytes()),
        }
    }

    fn step(&mut self, incoming: &[u8]) -> HandshakeStep {
        if self.done {
            return HandshakeStep::Failed(HandshakeError::OutOfOrder);
        }
        let Ok(peer_bytes) = <[u8; 32]>::try_from(incoming) else {
            return HandshakeStep::Failed(HandshakeError::Io);
        };
        let peer_public = PublicKey::from(peer_bytes);
        let Some(secret) = self.secret.take() else {
            return HandshakeStep::Failed(HandshakeError::OutOfOrder);
        };
        let shared = secret.diffie_hellman(&peer_public);
        let shared_secret = *shared.as_bytes();
        self.done = true;
        let (context, auth_token, raw_auth_token) = self.derive(&shared_secret);
        HandshakeStep::Done {
            outgoing: None,
            context: Arc::new(context),
            auth_token,
            raw_auth_token,
        }
    }
}

/// A handshake that skips key exchange entirely and installs no encryption
/// context, for deterministic tests that don't care about confidentiality
/// (spec §4.14).
pub struct NullCipher;

impl HandshakeCipher for NullCipher {
    fn start(&mut self) -> HandshakeStep {
        let mut raw = [0u8; AUTH_TOKEN_LEN];
        rand::rng().fill_bytes(&mut raw);
        HandshakeStep::Done {
            outgoing: None,
            context: Arc::new(NullContext),
            auth_token: { use base64::Engine; base64::engine::general_purpose::STANDARD.encode(&raw[..9]) },
            raw_auth_token: Bytes::copy_from_slice(&raw),
        }
    }

    fn step(&mut self, _incoming: &[u8]) -> HandshakeStep {
        HandshakeStep::Failed(HandshakeError::OutOfOrder)
    }
}

struct NullContext;
impl EncryptionContext for NullContext {
    fn seal(&self, plaintext: &[u8], _send_counter: u64) -> Result<Bytes, ChannelError> {
        Ok(Bytes::copy_from_slice(plaintext))
    }
    fn open(&self, ciphertext: &[u8], _recv_counter: u64) -> Result<Bytes, ChannelError> {
        Ok(Bytes::copy_from_slice(ciphertext))
    }
}

/// Result delivered to the caller once the handshake finishes, matching the
/// `{on_success, on_failure}` listener contract in spec §4.5.
pub enum EncryptionRunnerResult {
    Success {
        context: Arc<dyn EncryptionContext>,
        auth_token: String,
        raw_auth_token: Bytes,
    },
    Failure(HandshakeError),
}

/// Drives `cipher` to completion over `channel`, writing/reading raw
/// handshake messages as plain (unencrypted) frames. Callers install the
/// resulting context on the channel themselves once it succeeds.
pub fn run_handshake(
    channel: &EndpointChannel,
    mut cipher: impl HandshakeCipher,
) -> EncryptionRunnerResult {
    let mut step = cipher.start();
    loop {
        match step {
            HandshakeStep::Continue { outgoing } => {
                if !outgoing.is_empty() && channel.write(&outgoing).is_err() {
                    return EncryptionRunnerResult::Failure(HandshakeError::Io);
                }
                let incoming = match channel.read() {
                    Ok(bytes) => bytes,
                    Err(_) => return EncryptionRunnerResult::Failure(HandshakeError::Io),
                };
                step = cipher.step(&incoming);
            }
            HandshakeStep::Done {
                outgoing,
                context,
                auth_token,
                raw_auth_token,
            } => {
                if let Some(outgoing) = outgoing {
                    if channel.write(&outgoing).is_err() {
                        return EncryptionRunnerResult::Failure(HandshakeError::Io);
                    }
                }
                return EncryptionRunnerResult::Success {
                    context,
                    auth_token,
                    raw_auth_token,
                };
            }
            HandshakeStep::Failed(err) => return EncryptionRunnerResult::Failure(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use nc_codec::frame::Medium;
    use std::thread;

    #[test]
    fn x25519_handshake_derives_matching_contexts() {
        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        let channel_a = EndpointChannel::new(a);
        let channel_b = EndpointChannel::new(b);

        let responder = thread::spawn(move || run_handshake(&channel_b, X25519Ukey2Cipher::responder()));
        let initiator_result = run_handshake(&channel_a, X25519Ukey2Cipher::initiator());
        let responder_result = responder.join().unwrap();

        let (EncryptionRunnerResult::Success { context: ctx_a, auth_token: token_a, .. },
             EncryptionRunnerResult::Success { context: ctx_b, auth_token: token_b, .. }) =
            (initiator_result, responder_result)
        else {
            panic!("handshake should succeed on both sides");
        };

        let sealed = ctx_a.seal(b"payload", 0).unwrap();
        assert_eq!(ctx_b.open(&sealed, 0).unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(token_a.len(), token_b.len());
    }

    #[test]
    fn null_cipher_completes_without_a_round_trip() {
        let (a, _b) = InMemoryChannel::pair(Medium::Ble);
        let channel = EndpointChannel::new(a);
        match run_handshake(&channel, NullCipher) {
            EncryptionRunnerResult::Success { context, .. } => {
                let sealed = context.seal(b"hi", 0).unwrap();
                assert_eq!(context.open(&sealed, 0).unwrap(), Bytes::from_static(b"hi"));
            }
            EncryptionRunnerResult::Failure(_) => panic!("NullCipher must not fail"),
        }
    }
}
