//! # Request Codec
//!
//! Turns a typed request into its wire text and a reply text back into a typed
//! response. The request/reply gateway only moves these strings around.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while encoding a request or decoding a reply.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The reply was received but is malformed.
    #[error("Failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A request that knows its own wire form and how to read its reply.
pub trait ClientRequest: Send + Sync {
    /// What a decoded reply turns into.
    type Response: Send;

    /// Serializes the request.
    fn to_wire(&self) -> Result<String, CodecError>;

    /// Parses the reply text.
    fn from_wire_response(&self, reply: &str) -> Result<Self::Response, CodecError>;
}

/// # JSON Request
///
/// A serde-serializable request body whose reply is a JSON array of results.
///
/// ```rust
/// use lib_tagstream::codec::{ClientRequest, JsonRequest};
///
/// let request: JsonRequest<Vec<u64>, String> = JsonRequest::new(vec![1, 2]);
/// assert_eq!(request.to_wire().unwrap(), "[1,2]");
/// assert_eq!(request.from_wire_response(r#"["a","b"]"#).unwrap(), vec!["a", "b"]);
/// ```
pub struct JsonRequest<Req, Resp> {
    body: Req,
    _response: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> JsonRequest<Req, Resp> {
    /// Wraps `body`.
    pub fn new(body: Req) -> Self {
        Self { body, _response: PhantomData }
    }

    /// The wrapped request body.
    pub fn body(&self) -> &Req {
        &self.body
    }
}

impl<Req, Resp> ClientRequest for JsonRequest<Req, Resp>
where
    Req: Serialize + Send + Sync,
    Resp: DeserializeOwned + Send,
{
    type Response = Vec<Resp>;

    fn to_wire(&self) -> Result<String, CodecError> {
        serde_json::to_string(&self.body).map_err(CodecError::Encode)
    }

    fn from_wire_response(&self, reply: &str) -> Result<Vec<Resp>, CodecError> {
        serde_json::from_str(reply).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct TagQuery {
        tag_ids: Vec<u64>,
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct TagValue {
        id: u64,
        value: f64,
    }

    #[test]
    fn test_json_request_encodes_body() {
        let request: JsonRequest<TagQuery, TagValue> = JsonRequest::new(TagQuery { tag_ids: vec![3, 4] });
        assert_eq!(request.to_wire().unwrap(), r#"{"tagIds":[3,4]}"#);
    }

    #[test]
    fn test_json_request_decodes_collection() {
        let request: JsonRequest<TagQuery, TagValue> = JsonRequest::new(TagQuery { tag_ids: vec![3] });
        let values = request.from_wire_response(r#"[{"id":3,"value":1.5}]"#).unwrap();
        assert_eq!(values, vec![TagValue { id: 3, value: 1.5 }]);
    }

    #[test]
    fn test_malformed_reply_is_a_decode_error() {
        let request: JsonRequest<TagQuery, TagValue> = JsonRequest::new(TagQuery { tag_ids: vec![] });
        assert!(matches!(request.from_wire_response("not json"), Err(CodecError::Decode(_))));
    }
}
