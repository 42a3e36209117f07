//! Binary encoding of payloads.
//!
//! The wire format carries exactly one encoded value per datagram and no type
//! tag, so the receiving side has to name the expected type when decoding:
//!
//! ```
//! use fanout::codec::{BincodeCodec, Codec};
//!
//! let codec = BincodeCodec::default();
//! let bytes = codec.encode(&(21u32, "bid".to_string()))?;
//! let (value, label): (u32, String) = codec.decode(&bytes)?;
//! assert_eq!(value, 21);
//! assert_eq!(label, "bid");
//! # Ok::<(), fanout::codec::CodecError>(())
//! ```

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// The largest payload a single UDP/IPv4 datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Indicates that a value could not be converted to or from its wire form.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The bytes are not a valid encoding of the requested type.
    ///
    /// This covers truncated datagrams, trailing garbage and values of a
    /// different type.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Symmetric conversion between payload values and datagram bytes.
///
/// For every supported value `v`, `decode(&encode(&v)?)? == v`.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serializes `value` into an owned byte string.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserializes a `T` from `bytes`.
    ///
    /// Malformed input must be reported as [`CodecError::Decode`].
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary codec backed by `bincode`.
///
/// Integers are varint encoded and trailing bytes after a value are rejected.
/// The size limit applies to encoding and bounds allocations while decoding
/// untrusted datagrams.
#[derive(Debug, Clone, Copy)]
pub struct BincodeCodec {
    limit: u64,
}

impl BincodeCodec {
    /// Creates a codec that refuses encodings larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit as u64,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit as usize
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.limit)
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::with_limit(MAX_DATAGRAM_SIZE)
    }
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        self.options()
            .serialize(value)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.options()
            .deserialize(bytes)
            .map_err(|err| CodecError::Decode(Box::new(err)))
    }
}
