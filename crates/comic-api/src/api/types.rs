//! Request descriptors and response envelope decoding.

use super::error::RawError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to issue one logical request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path appended to the base URL, starting with `/`
    pub path: String,
    /// Query parameters, kept sorted so identity is deterministic
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Endpoint pattern used for rate limiting
    pub endpoint: String,
}

#[derive(Serialize)]
struct Identity<'a> {
    method: Method,
    path: &'a str,
    params: &'a BTreeMap<String, String>,
    body: &'a Option<Value>,
}

impl RequestDescriptor {
    pub fn get(path: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            params: BTreeMap::new(),
            body: None,
            endpoint: endpoint.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Deterministic identity used to deduplicate concurrent requests
    pub fn dedup_key(&self) -> String {
        let identity = Identity {
            method: self.method,
            path: &self.path,
            params: &self.params,
            body: &self.body,
        };
        // Serializing plain strings and JSON values cannot fail
        serde_json::to_string(&identity).unwrap_or_else(|_| {
            format!("{} {} {:?} {:?}", self.method, self.path, self.params, self.body)
        })
    }
}

/// A response body wrapped in a `{ status, data, message }` envelope
///
/// `data` and `message` are `Some` whenever the key is present, even when its
/// value is `null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub status: String,
    #[serde(default, deserialize_with = "present")]
    pub data: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub message: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    /// Message text, when the server sent a string or a list of strings
    pub fn message_text(&self) -> Option<String> {
        let text = match self.message.as_ref()? {
            Value::String(message) => message.trim().to_string(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

/// The two shapes a response body can take
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Enveloped(Envelope),
    Raw(Value),
}

const ENVELOPE_FAILURE_MESSAGE: &str = "The server reported a failure.";

impl ResponseBody {
    /// Decode as an envelope when the body has a string `status`
    pub fn decode(value: Value) -> Self {
        let tagged = value
            .get("status")
            .is_some_and(|status| status.is_string());
        if !tagged {
            return ResponseBody::Raw(value);
        }
        match Envelope::deserialize(&value) {
            Ok(envelope) => ResponseBody::Enveloped(envelope),
            Err(_) => ResponseBody::Raw(value),
        }
    }

    /// Extract the payload, failing when the envelope reports an error
    pub fn into_data(self) -> Result<Value, RawError> {
        match self {
            ResponseBody::Raw(value) => Ok(value),
            ResponseBody::Enveloped(envelope) if envelope.status == "success" => {
                match envelope.data {
                    Some(data) => Ok(data),
                    None => {
                        let mut rest = envelope.rest;
                        if let Some(message) = envelope.message {
                            rest.insert("message".to_string(), message);
                        }
                        Ok(Value::Object(rest))
                    }
                }
            }
            ResponseBody::Enveloped(envelope) => Err(RawError::Envelope(
                envelope
                    .message_text()
                    .unwrap_or_else(|| ENVELOPE_FAILURE_MESSAGE.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_key_is_order_independent() {
        let a = RequestDescriptor::get("/search", "search")
            .with_param("keyword", "one piece")
            .with_param("page", 1);
        let b = RequestDescriptor::get("/search", "search")
            .with_param("page", 1)
            .with_param("keyword", "one piece");
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = RequestDescriptor::get("/search", "search").with_param("keyword", "naruto");
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_dedup_key_includes_method_and_body() {
        let get = RequestDescriptor::get("/genre", "genre");
        let mut post = get.clone();
        post.method = Method::Post;
        assert_ne!(get.dedup_key(), post.dedup_key());

        let with_body = get.clone().with_body(json!({"b": 1, "a": 2}));
        let same_body = get.clone().with_body(json!({"a": 2, "b": 1}));
        assert_eq!(with_body.dedup_key(), same_body.dedup_key());
        assert_ne!(with_body.dedup_key(), get.dedup_key());
    }

    #[test]
    fn test_success_envelope_unwraps_data() {
        let body = ResponseBody::decode(json!({"status": "success", "data": [1, 2, 3]}));
        assert!(matches!(body, ResponseBody::Enveloped(_)));
        assert_eq!(body.into_data().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_success_envelope_without_data_drops_status() {
        let body = ResponseBody::decode(json!({
            "status": "success",
            "komik": [{"title": "A"}],
            "page": 2
        }));
        assert_eq!(
            body.into_data().unwrap(),
            json!({"komik": [{"title": "A"}], "page": 2})
        );
    }

    #[test]
    fn test_failure_envelope_carries_message() {
        let body = ResponseBody::decode(json!({"status": "error", "message": "Komik not found"}));
        match body.into_data() {
            Err(RawError::Envelope(message)) => assert_eq!(message, "Komik not found"),
            other => panic!("expected envelope error, got {other:?}"),
        }

        let body = ResponseBody::decode(json!({"status": "fail"}));
        match body.into_data() {
            Err(RawError::Envelope(message)) => assert_eq!(message, ENVELOPE_FAILURE_MESSAGE),
            other => panic!("expected envelope error, got {other:?}"),
        }
    }

    #[test]
    fn test_body_without_status_is_raw() {
        let value = json!({"results": [], "total": 0});
        let body = ResponseBody::decode(value.clone());
        assert_eq!(body, ResponseBody::Raw(value.clone()));
        assert_eq!(body.into_data().unwrap(), value);

        let array = json!([{"id": "x"}]);
        assert_eq!(ResponseBody::decode(array.clone()).into_data().unwrap(), array);

        // A non-string status is not an envelope
        let numeric = json!({"status": 200, "items": []});
        assert_eq!(ResponseBody::decode(numeric.clone()), ResponseBody::Raw(numeric));
    }

    #[test]
    fn test_failure_envelope_with_non_string_message() {
        let body = ResponseBody::decode(json!({"status": "fail", "message": 500}));
        assert!(matches!(body, ResponseBody::Enveloped(_)));
        match body.into_data() {
            Err(RawError::Envelope(message)) => assert_eq!(message, ENVELOPE_FAILURE_MESSAGE),
            other => panic!("expected envelope error, got {other:?}"),
        }

        let body = ResponseBody::decode(json!({
            "status": "error",
            "message": ["keyword is required", "page must be a number"]
        }));
        match body.into_data() {
            Err(RawError::Envelope(message)) => {
                assert_eq!(message, "keyword is required; page must be a number")
            }
            other => panic!("expected envelope error, got {other:?}"),
        }

        let body = ResponseBody::decode(json!({"status": "error", "message": null}));
        assert!(matches!(
            body.into_data(),
            Err(RawError::Envelope(message)) if message == ENVELOPE_FAILURE_MESSAGE
        ));
    }

    #[test]
    fn test_success_envelope_with_null_data() {
        let body = ResponseBody::decode(json!({"status": "success", "data": null}));
        assert_eq!(body.into_data().unwrap(), Value::Null);

        let body = ResponseBody::decode(json!({"status": "success", "message": {"note": 1}}));
        assert_eq!(body.into_data().unwrap(), json!({"message": {"note": 1}}));
    }
}
