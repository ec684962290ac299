//! PayloadCodec - wire message と JSON 文字列の相互変換
//!
//! キューに載るのは常に UTF-8 の JSON 文字列。
//! decode 後に version を検査し、未対応なら `Validation` で弾く。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::message::SUPPORTED_VERSIONS;
use crate::domain::{DispatchError, RequestMessage, ResponseMessage};

/// Message attribute carrying the wire kind.
pub const KIND_ATTRIBUTE: &str = "kind";
pub const REQUEST_KIND: &str = "request";
pub const RESPONSE_KIND: &str = "response";

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode_request(&self, message: &RequestMessage) -> Result<String, DispatchError> {
        encode(message)
    }

    pub fn decode_request(&self, payload: &str) -> Result<RequestMessage, DispatchError> {
        let message: RequestMessage = decode(payload)?;
        check_version(&message.metadata.version)?;
        Ok(message)
    }

    pub fn encode_response(&self, message: &ResponseMessage) -> Result<String, DispatchError> {
        encode(message)
    }

    pub fn decode_response(&self, payload: &str) -> Result<ResponseMessage, DispatchError> {
        let message: ResponseMessage = decode(payload)?;
        check_version(&message.metadata.version)?;
        Ok(message)
    }
}

fn encode<M: Serialize>(message: &M) -> Result<String, DispatchError> {
    Ok(serde_json::to_string(message)?)
}

fn decode<M: DeserializeOwned>(payload: &str) -> Result<M, DispatchError> {
    Ok(serde_json::from_str(payload)?)
}

fn check_version(version: &str) -> Result<(), DispatchError> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(DispatchError::Validation(format!("unsupported version: {version}")))
    }
}
