//! Request and response messages exchanged between clients and the server.

use serde_json::{Map, Value};

use crate::clock::now_millis;

/// A single simulated request.
///
/// `meta` is an opaque key/value bag owned by the request; behavior scripts
/// may read and mutate it across hook calls, and the engine writes their
/// changes back after each hook returns.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub client_id: String,
    pub data: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub meta: Map<String, Value>,
}

impl Request {
    /// Creates a request stamped with the current time and an empty meta bag.
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            data: data.into(),
            timestamp: now_millis(),
            meta: Map::new(),
        }
    }
}

/// A single simulated response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    pub data: String,
    pub error: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Response {
    /// Successful response carrying `data`.
    pub fn ok(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: true,
            data: data.into(),
            error: String::new(),
            timestamp: now_millis(),
        }
    }

    /// Failed response carrying an error message.
    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            data: String::new(),
            error: error.into(),
            timestamp: now_millis(),
        }
    }
}
