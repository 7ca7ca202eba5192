//! Transport abstraction traits.
//!
//! [`Codec`] marshals job specifications, job items and results for remote
//! calculation nodes. Implementations live in extension crates:
//! - `viewcalc-ext-json` -> serde_json

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TraitError;

/// Wire format encoding/decoding.
pub trait Codec: Send + Sync {
    /// Encode value to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TraitError>;

    /// Decode bytes to value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TraitError>;

    /// Get content type header.
    fn content_type(&self) -> &'static str;
}
