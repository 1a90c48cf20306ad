//! Wire envelope, typed payloads, and stream framing.
//!
//! Every logical stream carries exactly one frame:
//!
//! ```text
//! [10-byte header: zigzag varint length L, zero padded][L bytes: MessagePack envelope]
//! ```
//!
//! The envelope is serialized with `rmp-serde` in positional (array) form,
//! which is deterministic: re-encoding a decoded envelope yields the same
//! bytes, so the signature digest can always be recomputed by the receiver.

use crate::error::WireError;
use crate::keyscheme::{KeyPair, KeyScheme};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on a serialized envelope, enforced on send and receive.
pub const MAX_MESSAGE_SIZE: usize = 65000;

/// Size of the fixed length header preceding every envelope.
pub const LENGTH_HEADER_SIZE: usize = 10;

/// Accepted clock skew between sender timestamp and receiver clock.
pub const TIMESTAMP_WINDOW_NANOS: i64 = 60 * 1_000_000_000;

/// An application message type that can ride inside an envelope.
///
/// `TYPE_TAG` must be unique across the types registered with a network.
pub trait Message: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}

/// A self-describing payload: type tag plus serialized body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_tag: String,
    pub body: Vec<u8>,
}

impl Payload {
    /// Serialize a typed message into a payload.
    pub fn encode<T: Message>(message: &T) -> Result<Self, WireError> {
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            body: rmp_serde::to_vec(message)?,
        })
    }
}

/// The signed, addressed unit of wire transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender public key.
    pub from: Vec<u8>,
    /// Recipient public key.
    pub to: Vec<u8>,
    /// Signing time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Payload,
    /// Id of the key scheme that produced `signature`.
    pub scheme_id: String,
    /// Signature over the envelope encoded with this field empty.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// An unsigned envelope stamped with the current time.
    pub fn new(from: &[u8], to: &[u8], payload: Payload, scheme_id: &str) -> Self {
        Self {
            from: from.to_vec(),
            to: to.to_vec(),
            timestamp: now_nanos(),
            payload,
            scheme_id: scheme_id.to_string(),
            signature: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// The signature digest input: this envelope encoded with `signature` cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, WireError> {
        let unsigned = Envelope {
            signature: Vec::new(),
            ..self.clone()
        };
        unsigned.encode()
    }

    /// Sign with `key` under `scheme`, replacing any previous signature.
    pub fn sign(&mut self, key: &KeyPair, scheme: &dyn KeyScheme) -> Result<(), WireError> {
        let data = self.signing_bytes()?;
        let signature = scheme.sign(key, &data)?;
        if signature.is_empty() {
            return Err(WireError::SigningFailed(format!(
                "scheme {} produced an empty signature",
                scheme.id()
            )));
        }
        self.signature = signature;
        Ok(())
    }

    /// Verify the signature against the claimed sender key.
    pub fn verify(&self, scheme: &dyn KeyScheme) -> bool {
        match self.signing_bytes() {
            Ok(data) => scheme.verify(&data, &self.signature, &self.from),
            Err(_) => false,
        }
    }

    /// Whether the timestamp lies within the freshness window around `now`.
    pub fn is_fresh_at(&self, now: i64) -> bool {
        let skew = (now as i128 - self.timestamp as i128).abs();
        skew <= TIMESTAMP_WINDOW_NANOS as i128
    }
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// A payload decoded into its registered concrete type.
#[derive(Clone)]
pub struct DecodedMessage {
    type_tag: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl DecodedMessage {
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Borrow the message as `T`, if that is its type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

type DecodeFn = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>, WireError>;

fn decode_as<T: Message>(body: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, WireError> {
    let value: T = rmp_serde::from_slice(body)?;
    Ok(Arc::new(value))
}

/// Map from payload type tag to decoder.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: Arc<RwLock<HashMap<String, DecodeFn>>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` so payloads tagged `T::TYPE_TAG` decode into it.
    pub fn register<T: Message>(&self) {
        let mut decoders = self.decoders.write().unwrap_or_else(|e| e.into_inner());
        decoders.insert(T::TYPE_TAG.to_string(), decode_as::<T> as DecodeFn);
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        let decoders = self.decoders.read().unwrap_or_else(|e| e.into_inner());
        decoders.contains_key(type_tag)
    }

    /// Decode a payload by looking up its type tag.
    pub fn decode(&self, payload: &Payload) -> Result<DecodedMessage, WireError> {
        let decoder = {
            let decoders = self.decoders.read().unwrap_or_else(|e| e.into_inner());
            decoders
                .get(&payload.type_tag)
                .copied()
                .ok_or_else(|| WireError::UnknownMessageType(payload.type_tag.clone()))?
        };
        Ok(DecodedMessage {
            type_tag: payload.type_tag.clone(),
            value: decoder(&payload.body)?,
        })
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decoders = self.decoders.read().unwrap_or_else(|e| e.into_inner());
        let mut tags: Vec<&String> = decoders.keys().collect();
        tags.sort();
        f.debug_struct("MessageRegistry").field("types", &tags).finish()
    }
}

/// Encode a length as a zigzag varint in a fixed, zero-padded header.
pub fn encode_length(len: i64) -> [u8; LENGTH_HEADER_SIZE] {
    let mut header = [0u8; LENGTH_HEADER_SIZE];
    let mut ux = (len << 1) as u64;
    if len < 0 {
        ux = !ux;
    }
    let mut i = 0;
    while ux >= 0x80 {
        header[i] = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    header[i] = ux as u8;
    header
}

/// Decode the zigzag varint at the start of a length header.
///
/// Returns `None` if no terminating byte is found or the value overflows.
pub fn decode_length(header: &[u8; LENGTH_HEADER_SIZE]) -> Option<i64> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in header.iter().enumerate() {
        if byte < 0x80 {
            if i == LENGTH_HEADER_SIZE - 1 && byte > 1 {
                return None;
            }
            ux |= (byte as u64) << shift;
            let mut x = (ux >> 1) as i64;
            if ux & 1 != 0 {
                x = !x;
            }
            return Some(x);
        }
        ux |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}

/// Write one frame (length header + body) and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > max {
        return Err(WireError::MessageTooLarge {
            size: body.len(),
            max,
        });
    }
    let mut bytes = Vec::with_capacity(LENGTH_HEADER_SIZE + body.len());
    bytes.extend_from_slice(&encode_length(body.len() as i64));
    bytes.extend_from_slice(body);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body.
///
/// The declared length is validated before any body byte is read; a zero,
/// negative, malformed, or oversized length is rejected immediately.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LENGTH_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header).unwrap_or(0);
    if len <= 0 {
        return Err(WireError::InvalidLength(len));
    }
    if len as u64 > max as u64 {
        return Err(WireError::MessageTooLarge {
            size: len as usize,
            max,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyscheme::Ed25519Scheme;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const TYPE_TAG: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Message for Note {
        const TYPE_TAG: &'static str = "test.note";
    }

    fn signed_envelope() -> (Envelope, KeyPair) {
        let sender = Ed25519Scheme::generate();
        let receiver = Ed25519Scheme::generate();
        let payload = Payload::encode(&Note {
            text: "hello over the wire".to_string(),
        })
        .unwrap();
        let mut env = Envelope::new(
            sender.public_key(),
            receiver.public_key(),
            payload,
            Ed25519Scheme::ID,
        );
        env.sign(&sender, &Ed25519Scheme).unwrap();
        (env, sender)
    }

    #[test]
    fn test_envelope_roundtrip() {
        let (env, _) = signed_envelope();
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
        // Deterministic: re-encoding gives identical bytes.
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let (env, _) = signed_envelope();
        let bytes = env.encode().unwrap();
        assert!(Envelope::decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn test_signature_excluded_from_digest() {
        let (env, _) = signed_envelope();
        let mut other = env.clone();
        other.signature = vec![1, 2, 3];
        assert_eq!(env.signing_bytes().unwrap(), other.signing_bytes().unwrap());
    }

    #[test]
    fn test_sign_and_verify() {
        let (env, _) = signed_envelope();
        assert_eq!(env.signature.len(), 64);
        assert!(env.verify(&Ed25519Scheme));
    }

    #[test]
    fn test_field_tampering_detected() {
        let (env, _) = signed_envelope();
        let intruder = Ed25519Scheme::generate();

        let mut e = env.clone();
        e.to = intruder.public_key().to_vec();
        assert!(!e.verify(&Ed25519Scheme), "recipient swap");

        let mut e = env.clone();
        e.timestamp += 1;
        assert!(!e.verify(&Ed25519Scheme), "timestamp shift");

        let mut e = env.clone();
        e.payload.body.push(0);
        assert!(!e.verify(&Ed25519Scheme), "payload change");

        let mut e = env.clone();
        e.payload.type_tag = "test.other".to_string();
        assert!(!e.verify(&Ed25519Scheme), "type tag change");

        let mut e = env.clone();
        e.from = intruder.public_key().to_vec();
        assert!(!e.verify(&Ed25519Scheme), "sender swap");
    }

    #[test]
    fn test_signature_bit_flips_detected() {
        let (env, _) = signed_envelope();
        for byte in 0..env.signature.len() {
            for bit in 0..8 {
                let mut e = env.clone();
                e.signature[byte] ^= 1 << bit;
                assert!(!e.verify(&Ed25519Scheme), "signature bit {byte}:{bit}");
            }
        }
    }

    #[test]
    fn test_serialized_bit_flips_detected() {
        let (env, _) = signed_envelope();
        let bytes = env.encode().unwrap();
        for byte in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                if let Ok(decoded) = Envelope::decode(&corrupted) {
                    if decoded != env {
                        assert!(!decoded.verify(&Ed25519Scheme), "bit {byte}:{bit}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_freshness_window() {
        let (mut env, _) = signed_envelope();
        let now = env.timestamp;
        assert!(env.is_fresh_at(now));
        assert!(env.is_fresh_at(now + TIMESTAMP_WINDOW_NANOS));
        assert!(!env.is_fresh_at(now + TIMESTAMP_WINDOW_NANOS + 1));
        assert!(!env.is_fresh_at(now - TIMESTAMP_WINDOW_NANOS - 1));

        env.timestamp = now + 30 * 1_000_000_000;
        assert!(env.is_fresh_at(now));
        env.timestamp = i64::MIN;
        assert!(!env.is_fresh_at(now));
    }

    #[test]
    fn test_registry_decodes_by_tag() {
        let registry = MessageRegistry::new();
        registry.register::<Ping>();
        registry.register::<Note>();

        let payload = Payload::encode(&Ping { seq: 7 }).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded.type_tag(), "test.ping");
        assert!(decoded.is::<Ping>());
        assert!(!decoded.is::<Note>());
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { seq: 7 }));
        assert!(decoded.downcast_ref::<Note>().is_none());
    }

    #[test]
    fn test_registry_unknown_tag() {
        let registry = MessageRegistry::new();
        let payload = Payload::encode(&Ping { seq: 1 }).unwrap();
        match registry.decode(&payload) {
            Err(WireError::UnknownMessageType(tag)) => assert_eq!(tag, "test.ping"),
            other => panic!("Expected UnknownMessageType, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_bad_body() {
        let registry = MessageRegistry::new();
        registry.register::<Note>();
        let payload = Payload {
            type_tag: Note::TYPE_TAG.to_string(),
            body: vec![0xc1],
        };
        assert!(matches!(registry.decode(&payload), Err(WireError::Codec(_))));
    }

    #[test]
    fn test_length_header_vectors() {
        // Same bytes Go's binary.PutVarint produces.
        assert_eq!(encode_length(1)[..1], [0x02]);
        assert_eq!(encode_length(300)[..2], [0xd8, 0x04]);
        assert_eq!(encode_length(-1)[..1], [0x01]);
        assert!(encode_length(1)[1..].iter().all(|b| *b == 0));

        for len in [1i64, 127, 128, 65000, 1 << 40, -5] {
            assert_eq!(decode_length(&encode_length(len)), Some(len));
        }
        assert_eq!(decode_length(&[0xff; LENGTH_HEADER_SIZE]), None);
    }

    #[tokio::test]
    async fn test_write_frame_layout() {
        let body = b"envelope-bytes".to_vec();
        let mut expected = encode_length(body.len() as i64).to_vec();
        expected.extend_from_slice(&body);

        let mut mock = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut mock, &body, MAX_MESSAGE_SIZE).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_frame_rejects_oversized() {
        let mut sink = Vec::new();
        let err = write_frame(&mut sink, &vec![0u8; MAX_MESSAGE_SIZE + 1], MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { size: 65001, max: 65000 }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame() {
        let body = b"hello".to_vec();
        let mut mock = tokio_test::io::Builder::new()
            .read(&encode_length(5))
            .read(&body[..2])
            .read(&body[2..])
            .build();
        let read = read_frame(&mut mock, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(read, body);
    }

    #[tokio::test]
    async fn test_read_frame_oversized_skips_body() {
        // Only the header is available: reading any body byte would hit EOF.
        let mut mock = tokio_test::io::Builder::new()
            .read(&encode_length(70000))
            .build();
        match read_frame(&mut mock, MAX_MESSAGE_SIZE).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, 70000);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_frame_zero_length() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&encode_length(0))
            .build();
        assert!(matches!(
            read_frame(&mut mock, MAX_MESSAGE_SIZE).await,
            Err(WireError::InvalidLength(0))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_short_body() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&encode_length(100))
            .read(&[7u8; 40])
            .build();
        match read_frame(&mut mock, MAX_MESSAGE_SIZE).await {
            Err(WireError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("Expected short read, got {other:?}"),
        }
    }
}
