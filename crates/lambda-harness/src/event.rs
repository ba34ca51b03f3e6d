//! Event envelopes presented to handlers.
//!
//! The shapes follow API Gateway proxy events and SQS batch events closely
//! enough for handler code written against those platforms, without trying
//! to reproduce every vendor field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// HTTP methods a function can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl HttpMethod {
    /// Returns the method as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity. Never populated locally since no identity provider exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Principal that made the call.
    pub caller: Option<String>,
    /// Principal identifier of the user.
    pub user: Option<String>,
    /// API key used for the request.
    pub api_key: Option<String>,
    /// ARN of the calling user.
    pub user_arn: Option<String>,
    /// Cognito authentication type.
    pub cognito_authentication_type: Option<String>,
    /// User agent of the caller.
    pub user_agent: Option<String>,
    /// Cognito identity pool id.
    pub cognito_identity_pool_id: Option<String>,
    /// Cognito authentication provider.
    pub cognito_authentication_provider: Option<String>,
    /// Source IP address of the caller.
    pub source_ip: Option<String>,
    /// Account of the caller.
    pub account_id: Option<String>,
    /// Cognito identity id.
    pub cognito_identity_id: Option<String>,
}

/// Request context nested in every [`HttpRequestEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Deployment stage name.
    pub stage: String,
    /// Always `None` locally.
    pub identity: Option<Identity>,
    /// Identifier stable per route.
    pub resource_id: String,
    /// Identifier of the API.
    pub api_id: String,
    /// Route template, same as the event's `resource`.
    pub resource_path: String,
    /// Method of the request.
    pub http_method: HttpMethod,
    /// Identifier of this request.
    pub request_id: String,
    /// Account the API belongs to.
    pub account_id: String,
}

/// Proxy-style event built from an inbound HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestEvent {
    /// Decoded JSON body, present only when the request carried one.
    pub body: Option<Value>,
    /// Route template the request matched, e.g. `/items/{id}`.
    pub resource: String,
    /// Concrete request path.
    pub path: String,
    /// Request headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Synthesized request context.
    pub request_context: RequestContext,
    /// Decoded query string parameters.
    pub query_string_parameters: HashMap<String, String>,
    /// Values of the template's `{name}` segments.
    pub path_parameters: HashMap<String, String>,
    /// Method of the request.
    pub http_method: HttpMethod,
    /// Always empty locally.
    pub stage_variables: HashMap<String, String>,
}

/// One received queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessageRecord {
    /// Identifier assigned when the message was sent.
    pub message_id: String,
    /// Handle used to delete the message after this receive.
    pub receipt_handle: String,
    /// Raw message body, exactly as sent.
    pub body: String,
    /// System attributes such as `ApproximateReceiveCount`.
    pub attributes: HashMap<String, String>,
    /// User-defined message attributes.
    pub message_attributes: HashMap<String, String>,
    /// Hex SHA-256 digest of the body.
    pub body_checksum: String,
    /// Always `aws:sqs`.
    pub event_source: String,
    /// ARN of the queue the message came from.
    #[serde(rename = "eventSourceARN")]
    pub event_source_arn: String,
    /// Region of the queue.
    pub aws_region: String,
}

impl QueueMessageRecord {
    /// Parses the body as JSON.
    pub fn json_body(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

/// Ordered, never-empty batch of records from a single poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBatchEvent")]
pub struct QueueBatchEvent {
    #[serde(rename = "Records")]
    records: Vec<QueueMessageRecord>,
}

#[derive(Deserialize)]
struct RawBatchEvent {
    #[serde(rename = "Records")]
    records: Vec<QueueMessageRecord>,
}

impl TryFrom<RawBatchEvent> for QueueBatchEvent {
    type Error = &'static str;

    fn try_from(raw: RawBatchEvent) -> Result<Self, Self::Error> {
        if raw.records.is_empty() {
            return Err("a queue batch event needs at least one record");
        }
        Ok(Self {
            records: raw.records,
        })
    }
}

impl QueueBatchEvent {
    /// Wraps records that are already known to be non-empty.
    pub(crate) fn from_records(records: Vec<QueueMessageRecord>) -> Self {
        debug_assert!(!records.is_empty());
        Self { records }
    }

    /// Records in the order the queue returned them.
    pub fn records(&self) -> &[QueueMessageRecord] {
        &self.records
    }

    /// Consumes the event, returning its records.
    pub fn into_records(self) -> Vec<QueueMessageRecord> {
        self.records
    }

    /// Number of records in the batch. Always at least one.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always `false`; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Response returned by a full-event HTTP handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response body, sent empty when `None`.
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpResponse {
    /// Creates an empty response with the given status.
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Creates an empty `200 OK` response.
    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Creates a response with a JSON body and a matching content type.
    pub fn json<T: Serialize>(status_code: u16, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(status_code)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_string(body)?))
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> QueueMessageRecord {
        QueueMessageRecord {
            message_id: id.to_string(),
            receipt_handle: format!("rh-{id}"),
            body: r#"{"test":123}"#.to_string(),
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
            body_checksum: String::new(),
            event_source: "aws:sqs".to_string(),
            event_source_arn: "arn:aws:sqs:us-east-1:123456789012:q".to_string(),
            aws_region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn batch_serializes_with_records_key() {
        let event = QueueBatchEvent::from_records(vec![record("1")]);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["Records"][0]["messageId"], "1");
        assert_eq!(
            value["Records"][0]["eventSourceARN"],
            "arn:aws:sqs:us-east-1:123456789012:q"
        );
        assert_eq!(event.records()[0].json_body().unwrap(), json!({"test": 123}));
    }

    #[test]
    fn empty_batch_cannot_be_deserialized() {
        let result: Result<QueueBatchEvent, _> = serde_json::from_value(json!({"Records": []}));
        assert!(result.is_err());
    }

    #[test]
    fn http_method_uses_wire_names() {
        assert_eq!(serde_json::to_string(&HttpMethod::Get).unwrap(), "\"GET\"");
        assert_eq!(HttpMethod::Post.to_string(), "POST");
    }

    #[test]
    fn json_response_sets_content_type() {
        let response = HttpResponse::json(201, &json!({"id": 7})).unwrap();

        assert_eq!(response.status_code, 201);
        assert_eq!(response.headers["Content-Type"], "application/json");
        assert_eq!(response.body.as_deref(), Some(r#"{"id":7}"#));
    }

    #[test]
    fn response_deserializes_without_optional_fields() {
        let response: HttpResponse = serde_json::from_value(json!({"statusCode": 204})).unwrap();
        assert_eq!(response, HttpResponse::new(204));
    }
}
