//! Public-key box encryption for message bodies.
//!
//! Every client declares an X25519 public key. The server pairs it with
//! its own long-term private key to form a [`MailBox`]: an
//! `XSalsa20-Poly1305` box whose shared secret is fixed per
//! (server key, client key) pair. Both sides seal the JSON text of a
//! message as `base64(nonce || ciphertext)` with a fresh random nonce, so
//! the same payload sealed for two clients never yields the same bytes.
//!
//! [`Envelope`] is what a connection actually holds: a mailbox when the
//! server authenticates with boxes, or plain JSON when a shared secret
//! guards the transport instead.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{self, Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::Serialize;
use serde_json::Value;

/// Length in bytes of public and private keys.
pub const KEY_LEN: usize = 32;

/// Length in bytes of the nonce prefixed to every sealed message.
const NONCE_LEN: usize = 24;

/// Length in bytes of the Poly1305 authentication tag.
const TAG_LEN: usize = 16;

/// Errors from key decoding and box sealing/opening.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A key was not valid hex.
    #[error("invalid hex key: {0}")]
    Hex(#[from] hex::FromHexError),

    /// A sealed message was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A key decoded to the wrong number of bytes.
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    /// A sealed message is shorter than a nonce plus a tag.
    #[error("sealed message too short ({0} bytes)")]
    TooShort(usize),

    /// The ciphertext did not verify under this mailbox's keys.
    #[error("message failed authentication")]
    Authentication,

    /// The cipher refused to seal the message.
    #[error("encryption failed")]
    Seal,

    /// The plaintext was not valid JSON, or a value failed to serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A long-term X25519 key pair.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate(&mut OsRng))
    }

    /// Restore a key pair from its hex-encoded private key.
    pub fn from_private_hex(encoded: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_secret(SecretKey::from(decode_key(encoded)?)))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The public half of the pair.
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The public key, hex-encoded, as handed out to clients.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Open a mailbox with a peer.
    pub fn mailbox_for(&self, peer: &PublicKey) -> MailBox {
        MailBox {
            salsa: SalsaBox::new(peer, &self.secret),
            peer: peer.clone(),
        }
    }

    /// Open a mailbox with a peer given its hex-encoded public key.
    pub fn mailbox_for_hex(&self, peer: &str) -> Result<MailBox, CryptoError> {
        Ok(self.mailbox_for(&decode_public_key(peer)?))
    }
}

impl core::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Decode a hex-encoded X25519 public key.
pub fn decode_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
    Ok(PublicKey::from(decode_key(encoded)?))
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(encoded.trim())?;
    bytes
        .try_into()
        .map_err(|rejected: Vec<u8>| CryptoError::KeyLength(rejected.len()))
}

/// An encryption context bound to one peer's public key.
pub struct MailBox {
    salsa: SalsaBox,
    peer: PublicKey,
}

impl MailBox {
    /// The peer's public key, hex-encoded.
    pub fn peer_public_key_hex(&self) -> String {
        hex::encode(self.peer.as_bytes())
    }

    /// Serialize `value` to JSON and seal it.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CryptoError> {
        self.seal_text(&serde_json::to_string(value)?)
    }

    /// Seal already-serialized JSON text.
    pub fn seal_text(&self, json: &str) -> Result<String, CryptoError> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = self
            .salsa
            .encrypt(&nonce, json.as_bytes())
            .map_err(|aead::Error| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open a sealed message and parse its JSON plaintext.
    pub fn open(&self, sealed: &str) -> Result<Value, CryptoError> {
        let plaintext = self.open_bytes(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn open_bytes(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD.decode(sealed.trim())?;
        if raw.len() < NONCE_LEN.saturating_add(TAG_LEN) {
            return Err(CryptoError::TooShort(raw.len()));
        }

        let (nonce, ciphertext) = raw
            .split_at_checked(NONCE_LEN)
            .ok_or(CryptoError::TooShort(raw.len()))?;
        let nonce = GenericArray::from_exact_iter(nonce.iter().copied())
            .ok_or(CryptoError::TooShort(raw.len()))?;

        self.salsa
            .decrypt(&nonce, ciphertext)
            .map_err(|aead::Error| CryptoError::Authentication)
    }
}

impl core::fmt::Debug for MailBox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailBox")
            .field("peer", &self.peer_public_key_hex())
            .finish_non_exhaustive()
    }
}

/// How a connection's message bodies are protected.
#[derive(Debug)]
pub enum Envelope {
    /// Bodies are boxed to the peer's declared public key.
    Boxed(MailBox),
    /// Bodies are plain JSON; the transport was authorized by shared secret.
    Plain,
}

impl Envelope {
    /// Whether bodies are encrypted.
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Boxed(_))
    }

    /// Serialize `value` to JSON and seal it for the peer.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CryptoError> {
        self.seal_text(&serde_json::to_string(value)?)
    }

    /// Seal already-serialized JSON text for the peer.
    pub fn seal_text(&self, json: &str) -> Result<String, CryptoError> {
        match self {
            Self::Boxed(mailbox) => mailbox.seal_text(json),
            Self::Plain => Ok(json.to_owned()),
        }
    }

    /// Open a frame received from the peer.
    pub fn open(&self, frame: &str) -> Result<Value, CryptoError> {
        match self {
            Self::Boxed(mailbox) => mailbox.open(frame),
            Self::Plain => Ok(serde_json::from_str(frame)?),
        }
    }
}
