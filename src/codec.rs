//! Wire codec for Jupyter messages
//!
//! A message travels as a multipart envelope:
//!
//! ```text
//! [identity..., "<IDS|MSG>", signature, header, parent_header, metadata, content, buffer...]
//! ```
//!
//! The signature is the hex HMAC of the four JSON frames in that order, or the
//! empty string when the connection key is empty. Buffers are never signed.

use std::sync::Arc;

use bytes::Bytes;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::error::CodecError;
use crate::message::{JupyterMessage, MessageHeader};

/// Frame separating routing identities from the signed message frames.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Prefix every `signature_scheme` carries before the digest name.
pub const SCHEME_PREFIX: &str = "hmac-";

/// Keyed-hash algorithm named by a connection's `signature_scheme`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl SigningAlgorithm {
    /// Parse a scheme such as `hmac-sha256`
    pub fn from_scheme(scheme: &str) -> Result<Self, CodecError> {
        let name = scheme
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| CodecError::UnsupportedScheme(scheme.to_string()))?;

        match name {
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(CodecError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// Digest name without the scheme prefix
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

/// Computes and checks message signatures.
///
/// The key is shared read-only between clones, so a signer can be handed to
/// every channel handler without synchronization.
#[derive(Clone)]
pub struct Signer {
    algorithm: SigningAlgorithm,
    key: Arc<[u8]>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("algorithm", &self.algorithm)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Signer {
    pub fn new(algorithm: SigningAlgorithm, key: &[u8]) -> Self {
        Self {
            algorithm,
            key: Arc::from(key),
        }
    }

    /// Signing is disabled when the key is empty
    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Hex signature over `parts`, or an empty string when signing is disabled
    pub fn sign(&self, parts: &[&[u8]]) -> Result<String, CodecError> {
        if !self.is_enabled() {
            return Ok(String::new());
        }

        let digest = match self.algorithm {
            SigningAlgorithm::Sha224 => hmac_digest::<Hmac<Sha224>>(&self.key, parts)?,
            SigningAlgorithm::Sha256 => hmac_digest::<Hmac<Sha256>>(&self.key, parts)?,
            SigningAlgorithm::Sha384 => hmac_digest::<Hmac<Sha384>>(&self.key, parts)?,
            SigningAlgorithm::Sha512 => hmac_digest::<Hmac<Sha512>>(&self.key, parts)?,
        };
        Ok(hex::encode(digest))
    }

    /// Check a received hex signature in constant time.
    ///
    /// Always succeeds when signing is disabled.
    pub fn verify(&self, parts: &[&[u8]], signature: &[u8]) -> Result<(), CodecError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let expected = hex::decode(signature).map_err(|_| CodecError::Authentication)?;
        let valid = match self.algorithm {
            SigningAlgorithm::Sha224 => hmac_verify::<Hmac<Sha224>>(&self.key, parts, &expected),
            SigningAlgorithm::Sha256 => hmac_verify::<Hmac<Sha256>>(&self.key, parts, &expected),
            SigningAlgorithm::Sha384 => hmac_verify::<Hmac<Sha384>>(&self.key, parts, &expected),
            SigningAlgorithm::Sha512 => hmac_verify::<Hmac<Sha512>>(&self.key, parts, &expected),
        };

        if valid {
            Ok(())
        } else {
            Err(CodecError::Authentication)
        }
    }
}

fn keyed_mac<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Option<M> {
    let mut mac = <M as Mac>::new_from_slice(key).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(mac)
}

fn hmac_digest<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
    // HMAC accepts keys of any length; a failure here means the algorithm is unusable.
    let mac = keyed_mac::<M>(key, parts)
        .ok_or_else(|| CodecError::UnsupportedScheme("invalid HMAC key".to_string()))?;
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_verify<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    keyed_mac::<M>(key, parts).is_some_and(|mac| mac.verify_slice(expected).is_ok())
}

/// A message in wire form, one field per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Routing frames before the delimiter (ROUTER identities, or the IOPub topic)
    pub identities: Vec<Bytes>,
    pub signature: Bytes,
    pub header: Bytes,
    pub parent_header: Bytes,
    pub metadata: Bytes,
    pub content: Bytes,
    pub buffers: Vec<Bytes>,
}

impl SignedEnvelope {
    /// Split a received multipart message at its delimiter
    pub fn from_frames(mut frames: Vec<Bytes>) -> Result<Self, CodecError> {
        let delim_pos = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or(CodecError::MissingDelimiter)?;

        let found = frames.len() - delim_pos - 1;
        if found < 5 {
            return Err(CodecError::Truncated { found });
        }

        let mut rest = frames.split_off(delim_pos + 1).into_iter();
        frames.pop(); // the delimiter itself
        let identities = frames;

        let mut next = || rest.next().unwrap_or_default();
        let signature = next();
        let header = next();
        let parent_header = next();
        let metadata = next();
        let content = next();

        Ok(Self {
            identities,
            signature,
            header,
            parent_header,
            metadata,
            content,
            buffers: rest.collect(),
        })
    }

    /// Flatten into frames in wire order
    pub fn into_frames(self) -> Vec<Bytes> {
        let mut frames = self.identities;
        frames.reserve(6 + self.buffers.len());
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(self.signature);
        frames.push(self.header);
        frames.push(self.parent_header);
        frames.push(self.metadata);
        frames.push(self.content);
        frames.extend(self.buffers);
        frames
    }

    /// The four frames covered by the signature, in signing order
    pub fn signed_parts(&self) -> [&[u8]; 4] {
        [
            self.header.as_ref(),
            self.parent_header.as_ref(),
            self.metadata.as_ref(),
            self.content.as_ref(),
        ]
    }
}

/// Encodes and decodes [`JupyterMessage`]s for one connection key.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    signer: Signer,
}

impl MessageCodec {
    /// Build a codec from a `signature_scheme` string and the shared key
    pub fn new(scheme: &str, key: &[u8]) -> Result<Self, CodecError> {
        let algorithm = SigningAlgorithm::from_scheme(scheme)?;
        Ok(Self::with_signer(Signer::new(algorithm, key)))
    }

    pub fn with_signer(signer: Signer) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Serialize and sign a message
    pub fn encode(&self, msg: &JupyterMessage) -> Result<SignedEnvelope, CodecError> {
        let header = serde_json::to_vec(&msg.header).map_err(CodecError::Encoding)?;
        let parent = serde_json::to_vec(&msg.parent_header).map_err(CodecError::Encoding)?;
        let metadata = serde_json::to_vec(&msg.metadata).map_err(CodecError::Encoding)?;
        let content = serde_json::to_vec(&msg.content).map_err(CodecError::Encoding)?;

        let signature = self.signer.sign(&[
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ])?;

        Ok(SignedEnvelope {
            identities: vec![],
            signature: Bytes::from(signature),
            header: Bytes::from(header),
            parent_header: Bytes::from(parent),
            metadata: Bytes::from(metadata),
            content: Bytes::from(content),
            buffers: msg.buffers.iter().cloned().map(Bytes::from).collect(),
        })
    }

    /// Verify and parse an envelope.
    ///
    /// The signature is checked before any frame is parsed.
    pub fn decode(&self, envelope: &SignedEnvelope) -> Result<JupyterMessage, CodecError> {
        self.signer
            .verify(&envelope.signed_parts(), &envelope.signature)?;

        let header: MessageHeader = parse_frame("header", &envelope.header)?;

        Ok(JupyterMessage {
            header,
            parent_header: parse_frame("parent_header", &envelope.parent_header)?,
            metadata: parse_frame("metadata", &envelope.metadata)?,
            content: parse_frame("content", &envelope.content)?,
            buffers: envelope.buffers.iter().map(|b| b.to_vec()).collect(),
        })
    }

    /// Decode raw frames, returning the routing identities alongside the message
    pub fn decode_frames(
        &self,
        frames: Vec<Bytes>,
    ) -> Result<(Vec<Bytes>, JupyterMessage), CodecError> {
        let envelope = SignedEnvelope::from_frames(frames)?;
        let msg = self.decode(&envelope)?;
        Ok((envelope.identities, msg))
    }
}

fn parse_frame<T: serde::de::DeserializeOwned>(
    frame: &'static str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidFrame {
        frame,
        reason: e.to_string(),
    })
}
