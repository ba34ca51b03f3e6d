//! Translation of raw triggers into event envelopes.
//!
//! Everything here is pure: no network, queue or registry access. The HTTP
//! server and the poll dispatcher collect the raw inputs and hand them over.

use crate::config::{FunctionConfig, HttpConfig};
use crate::error::TranslateError;
use crate::event::{
    HttpMethod, HttpRequestEvent, QueueBatchEvent, QueueMessageRecord, RequestContext,
};
use crate::queue::{RawMessage, body_checksum};
use axum::body::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

/// Event source reported on every queue record.
pub const QUEUE_EVENT_SOURCE: &str = "aws:sqs";

/// An inbound HTTP request reduced to the parts an event needs.
#[derive(Debug, Clone, Default)]
pub struct RawHttpRequest {
    /// Concrete request path.
    pub path: String,
    /// Header names are lowercase. Values that are not valid UTF-8 are dropped.
    pub headers: HashMap<String, String>,
    /// Decoded query string parameters.
    pub query: HashMap<String, String>,
    /// Values of the `{name}` segments of the matched template.
    pub path_params: HashMap<String, String>,
    /// Request body exactly as received.
    pub body: Bytes,
}

/// The route a request matched.
#[derive(Debug, Clone, Copy)]
pub struct MatchedRoute<'a> {
    /// Method the route answers.
    pub method: HttpMethod,
    /// Route template, e.g. `/items/{id}`.
    pub template: &'a str,
}

/// Values synthesized into every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvironment {
    /// Stage name reported in the request context.
    pub stage: String,
    /// API identifier reported in the request context.
    pub api_id: String,
    /// Account the API pretends to live in.
    pub account_id: String,
    /// Region the API pretends to run in.
    pub region: String,
}

impl EventEnvironment {
    /// Builds the environment from configuration.
    pub fn new(http: &HttpConfig, function: &FunctionConfig) -> Self {
        Self {
            stage: http.stage.clone(),
            api_id: http.api_id.clone(),
            account_id: function.account_id.clone(),
            region: function.region.clone(),
        }
    }
}

impl Default for EventEnvironment {
    fn default() -> Self {
        Self::new(&HttpConfig::default(), &FunctionConfig::default())
    }
}

/// The queue a batch was received from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSource {
    /// Name the queue was registered under.
    pub queue_name: String,
    /// Region reported as `awsRegion`.
    pub region: String,
    /// Account used in the event source ARN.
    pub account_id: String,
}

impl QueueSource {
    /// Describes `queue_name` in the given function environment.
    pub fn new(queue_name: impl Into<String>, function: &FunctionConfig) -> Self {
        Self {
            queue_name: queue_name.into(),
            region: function.region.clone(),
            account_id: function.account_id.clone(),
        }
    }

    /// ARN reported as the record's event source.
    pub fn arn(&self) -> String {
        format!(
            "arn:aws:sqs:{}:{}:{}",
            self.region, self.account_id, self.queue_name
        )
    }
}

/// Stable per-route resource id, as API Gateway assigns one per resource.
fn resource_id(route: &MatchedRoute<'_>) -> String {
    body_checksum(&format!("{} {}", route.method, route.template))[..10].to_string()
}

/// Builds an [`HttpRequestEvent`] from a raw request.
///
/// The body is decoded as JSON only when the request carried one. An empty
/// body yields `body = None`.
///
/// # Errors
///
/// Returns [`TranslateError::MalformedBody`] when a non-empty body is not
/// valid JSON.
pub fn translate_http(
    raw: RawHttpRequest,
    route: MatchedRoute<'_>,
    environment: &EventEnvironment,
) -> Result<HttpRequestEvent, TranslateError> {
    let body = if raw.body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&raw.body)
                .map_err(|e| TranslateError::MalformedBody(e.to_string()))?,
        )
    };

    Ok(HttpRequestEvent {
        body,
        resource: route.template.to_string(),
        path: raw.path,
        headers: raw.headers,
        request_context: RequestContext {
            stage: environment.stage.clone(),
            identity: None,
            resource_id: resource_id(&route),
            api_id: environment.api_id.clone(),
            resource_path: route.template.to_string(),
            http_method: route.method,
            request_id: Uuid::new_v4().to_string(),
            account_id: environment.account_id.clone(),
        },
        query_string_parameters: raw.query,
        path_parameters: raw.path_params,
        http_method: route.method,
        stage_variables: HashMap::new(),
    })
}

/// Builds a [`QueueBatchEvent`] from the messages of one receive.
///
/// Records keep the order the queue returned them in. Missing attribute maps
/// default to empty.
///
/// # Errors
///
/// Returns [`TranslateError::MalformedBatch`] for an empty batch, or when
/// any message lacks its id, receipt handle or body. The whole batch is
/// rejected in that case.
pub fn translate_queue_batch(
    raw_messages: Vec<RawMessage>,
    source: &QueueSource,
) -> Result<QueueBatchEvent, TranslateError> {
    if raw_messages.is_empty() {
        return Err(TranslateError::MalformedBatch(
            "received batch is empty".to_string(),
        ));
    }

    let event_source_arn = source.arn();
    let records = raw_messages
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let missing = |field: &str| {
                TranslateError::MalformedBatch(format!("message {index} has no {field}"))
            };

            let message_id = raw.message_id.ok_or_else(|| missing("message id"))?;
            let receipt_handle = raw.receipt_handle.ok_or_else(|| missing("receipt handle"))?;
            let body = raw.body.ok_or_else(|| missing("body"))?;
            let body_checksum = raw
                .body_checksum
                .unwrap_or_else(|| body_checksum(&body));

            Ok(QueueMessageRecord {
                message_id,
                receipt_handle,
                body,
                attributes: raw.attributes.unwrap_or_default(),
                message_attributes: raw.message_attributes.unwrap_or_default(),
                body_checksum,
                event_source: QUEUE_EVENT_SOURCE.to_string(),
                event_source_arn: event_source_arn.clone(),
                aws_region: source.region.clone(),
            })
        })
        .collect::<Result<Vec<_>, TranslateError>>()?;

    Ok(QueueBatchEvent::from_records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn route() -> MatchedRoute<'static> {
        MatchedRoute {
            method: HttpMethod::Post,
            template: "/items/{id}",
        }
    }

    fn raw_request(body: &str) -> RawHttpRequest {
        RawHttpRequest {
            path: "/items/42".to_string(),
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            query: HashMap::from([("verbose".to_string(), "true".to_string())]),
            path_params: HashMap::from([("id".to_string(), "42".to_string())]),
            body: Bytes::from(body.to_string()),
        }
    }

    fn source() -> QueueSource {
        QueueSource::new("123", &FunctionConfig::default())
    }

    fn raw_message(index: usize) -> RawMessage {
        RawMessage {
            message_id: Some(format!("id-{index}")),
            receipt_handle: Some(format!("rh-{index}")),
            body: Some(format!("{{\"n\":{index}}}")),
            ..RawMessage::default()
        }
    }

    #[test]
    fn http_event_carries_route_and_request() {
        let event = translate_http(
            raw_request(r#"{"test":123}"#),
            route(),
            &EventEnvironment::default(),
        )
        .unwrap();

        assert_eq!(event.body, Some(json!({"test": 123})));
        assert_eq!(event.resource, "/items/{id}");
        assert_eq!(event.path, "/items/42");
        assert_eq!(event.http_method, HttpMethod::Post);
        assert_eq!(event.path_parameters["id"], "42");
        assert_eq!(event.query_string_parameters["verbose"], "true");
        assert_eq!(event.request_context.stage, "local");
        assert_eq!(event.request_context.account_id, "123456789012");
        assert_eq!(event.request_context.resource_path, "/items/{id}");
        assert!(event.request_context.identity.is_none());
    }

    #[test]
    fn http_event_without_body() {
        let event =
            translate_http(raw_request(""), route(), &EventEnvironment::default()).unwrap();
        assert_eq!(event.body, None);
    }

    #[test]
    fn whitespace_body_is_decoded_and_rejected() {
        let err = translate_http(raw_request(" \n"), route(), &EventEnvironment::default())
            .unwrap_err();
        assert!(matches!(err, TranslateError::MalformedBody(_)));
    }

    #[test]
    fn http_event_with_malformed_body_fails() {
        let err = translate_http(raw_request("{not json"), route(), &EventEnvironment::default())
            .unwrap_err();
        assert!(matches!(err, TranslateError::MalformedBody(_)));
    }

    #[test]
    fn resource_id_is_stable_per_route() {
        let env = EventEnvironment::default();
        let first = translate_http(raw_request(""), route(), &env).unwrap();
        let second = translate_http(raw_request(""), route(), &env).unwrap();

        assert_eq!(
            first.request_context.resource_id,
            second.request_context.resource_id
        );
        assert_ne!(
            first.request_context.request_id,
            second.request_context.request_id
        );
    }

    #[test]
    fn queue_record_fields() {
        let batch = translate_queue_batch(vec![raw_message(0)], &source()).unwrap();
        let record = &batch.records()[0];

        assert_eq!(record.event_source, "aws:sqs");
        assert_eq!(record.event_source_arn, "arn:aws:sqs:us-east-1:123456789012:123");
        assert_eq!(record.aws_region, "us-east-1");
        assert!(record.attributes.is_empty());
        assert_eq!(record.body_checksum, body_checksum(&record.body));
    }

    #[test]
    fn empty_queue_batch_is_malformed() {
        let err = translate_queue_batch(Vec::new(), &source()).unwrap_err();
        assert!(matches!(err, TranslateError::MalformedBatch(_)));
    }

    proptest! {
        #[test]
        fn queue_batch_maps_one_to_one_in_order(count in 1usize..=10) {
            let raw: Vec<_> = (0..count).map(raw_message).collect();
            let batch = translate_queue_batch(raw, &source()).unwrap();

            prop_assert_eq!(batch.len(), count);
            for (index, record) in batch.records().iter().enumerate() {
                prop_assert_eq!(&record.message_id, &format!("id-{index}"));
                prop_assert_eq!(&record.receipt_handle, &format!("rh-{index}"));
            }
        }

        #[test]
        fn one_incomplete_message_rejects_whole_batch(
            count in 1usize..=10,
            broken in 0usize..10,
            field in 0u8..3,
        ) {
            let broken = broken % count;
            let mut raw: Vec<_> = (0..count).map(raw_message).collect();
            match field {
                0 => raw[broken].message_id = None,
                1 => raw[broken].receipt_handle = None,
                _ => raw[broken].body = None,
            }

            let result = translate_queue_batch(raw, &source());
            prop_assert!(matches!(result, Err(TranslateError::MalformedBatch(_))));
        }
    }
}
