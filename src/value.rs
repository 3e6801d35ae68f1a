//! Serialized values and the codec boundary
//!
//! The value serialization format belongs to the embedder. This module only
//! defines the envelope values travel in and the [`ValueCodec`] seam the
//! client calls into. [`JsonCodec`] is the default codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{IdbError, Result};

/// Decoded value handed to the embedder
pub type StructuredValue = serde_json::Value;

/// Identifier of an out-of-band blob held by the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub u64);

/// Descriptor of a blob that must be streamed before a value can be decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub id: BlobId,
    /// Size of the stored (possibly compressed) data, if known
    pub size: Option<u64>,
    /// Stored data is zlib-compressed
    pub compressed: bool,
}

/// A value as it crosses the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedValue {
    /// Inline serialized bytes (empty when the value lives out of band)
    pub data: Bytes,
    /// The value was too large to inline and must be preprocessed first
    pub has_preprocess_info: bool,
}

impl SerializedValue {
    /// Inline value
    pub fn inline(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            has_preprocess_info: false,
        }
    }

    /// Placeholder for a value delivered through preprocessing
    pub fn out_of_band() -> Self {
        Self {
            data: Bytes::new(),
            has_preprocess_info: true,
        }
    }
}

/// Opaque encode/decode collaborator
pub trait ValueCodec: Send + Sync {
    /// Serialize a value for a put/add request
    fn encode(&self, value: &StructuredValue) -> Result<Bytes>;

    /// Deserialize bytes from a response
    fn decode(&self, data: &[u8]) -> Result<StructuredValue>;
}

/// Default codec: values are JSON documents
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &StructuredValue) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<StructuredValue> {
        if data.is_empty() {
            return Err(IdbError::DataClone("Empty serialized value".into()));
        }
        Ok(serde_json::from_slice(data)?)
    }
}
