//! String codec for values stored in Redis.
//!
//! Encoding is plain JSON. Decoding is tolerant: a value that does not parse
//! comes back untouched as [`Decoded::Raw`] so a foreign or corrupt entry
//! never takes down a listener or a consumer.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageResult;

/// Result of a tolerant decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Message(T),
    Raw(String),
}

impl<T> Decoded<T> {
    pub fn message(self) -> Option<T> {
        match self {
            Decoded::Message(msg) => Some(msg),
            Decoded::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Decoded::Raw(_))
    }
}

pub fn stringify<T: Serialize>(value: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn parse<T: DeserializeOwned>(input: &str) -> Decoded<T> {
    match serde_json::from_str(input) {
        Ok(value) => Decoded::Message(value),
        Err(_) => Decoded::Raw(input.to_string()),
    }
}
