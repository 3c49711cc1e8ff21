//! Control-plane message bodies.
//!
//! Keys are PascalCase and every field defaults, so `{}` (or an empty body)
//! is a valid request.

use serde::{Deserialize, Serialize};

use crate::migratable::TransferPayload;

/// Version reported by `/hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// `POST /hello` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelloRequest {
    /// Generation of the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
}

/// `POST /hello` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HelloResponse {
    pub version: u32,
    /// Generation that answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
}

/// `POST /transfer` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransferRequest {
    /// Generation of the caller; a responder refuses to drain itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
}

/// `POST /transfer` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransferResponse {
    pub servers_transfer_data: TransferPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
}

/// Parse a request body, treating an empty body as `{}`.
pub(crate) fn parse_body<T>(body: &[u8]) -> Result<T, serde_json::Error>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
}
