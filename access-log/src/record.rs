use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// One parsed access log event.
///
/// Only `user_id` and `num_bytes` take part in aggregation, the rest is carried through parsing.
/// A missing or null `user_id` decodes as an empty string so the aggregation side can count it as an
/// invalid key rather than losing it at the parser. `num_bytes` is unsigned, so negative or missing
/// byte counts are rejected here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommonLog {
    pub ip: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: String,
    pub http_request: String,
    pub http_response: i32,
    pub num_bytes: u64,
    pub user_agent: String,
}

fn empty_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl CommonLog {
    /// Minimal record with placeholder values for the fields the aggregation ignores.
    pub fn new(user_id: impl Into<String>, num_bytes: u64) -> Self {
        Self {
            ip: String::from("0.0.0.0"),
            user_id: user_id.into(),
            lat: 0.0,
            lng: 0.0,
            timestamp: String::new(),
            http_request: String::new(),
            http_response: 200,
            num_bytes,
            user_agent: String::new(),
        }
    }
}

#[derive(Error, Debug)]
#[error("malformed record on line {line}: {source}")]
pub struct MalformedRecordError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Decodes a single JSON object into a [`CommonLog`].
///
/// `line` is only used to label the error.
pub fn parse_json(raw: &str, line: usize) -> Result<CommonLog, MalformedRecordError> {
    serde_json::from_str(raw).map_err(|source| MalformedRecordError { line, source })
}
