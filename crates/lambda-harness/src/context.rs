//! Per-invocation context passed to handlers alongside the event.

use crate::config::FunctionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Synthesized metadata for a single handler invocation.
///
/// A fresh context is built for every invocation. Nothing in it carries over
/// between invocations, and handlers only ever see a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    /// Unique identifier for this invocation.
    pub aws_request_id: String,

    /// Name of the invoked function.
    pub function_name: String,

    /// Version of the invoked function.
    pub function_version: String,

    /// ARN of the function being invoked.
    pub invoked_function_arn: String,

    /// Account the function pretends to live in.
    pub account_id: String,

    /// Region the function pretends to run in.
    pub region: String,

    /// Memory limit in MB.
    pub memory_limit_in_mb: u32,

    /// Log group name.
    pub log_group_name: String,

    /// Log stream name.
    pub log_stream_name: String,

    /// Timestamp when the invocation was created.
    pub created_at: DateTime<Utc>,

    /// Deadline by which the invocation should complete.
    pub deadline: DateTime<Utc>,

    /// X-Ray style trace ID.
    pub trace_id: String,
}

impl InvocationContext {
    /// Creates a context for one invocation of `function_name`.
    ///
    /// # Examples
    ///
    /// ```
    /// use lambda_harness::config::FunctionConfig;
    /// use lambda_harness::context::InvocationContext;
    ///
    /// let context = InvocationContext::new("orders", &FunctionConfig::default());
    /// assert!(context.invoked_function_arn.ends_with(":function:orders"));
    /// ```
    pub fn new(function_name: &str, environment: &FunctionConfig) -> Self {
        let created_at = Utc::now();
        let timeout_ms =
            i64::try_from(environment.invocation_timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline = chrono::Duration::try_milliseconds(timeout_ms)
            .and_then(|timeout| created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            aws_request_id: Uuid::new_v4().to_string(),
            function_name: function_name.to_string(),
            function_version: environment.function_version.clone(),
            invoked_function_arn: format!(
                "arn:aws:lambda:{}:{}:function:{}",
                environment.region, environment.account_id, function_name
            ),
            account_id: environment.account_id.clone(),
            region: environment.region.clone(),
            memory_limit_in_mb: environment.memory_size_mb,
            log_group_name: format!("/aws/lambda/{}", function_name),
            log_stream_name: format!(
                "{}/[{}]{}",
                created_at.format("%Y/%m/%d"),
                environment.function_version,
                Uuid::new_v4().simple()
            ),
            created_at,
            deadline,
            trace_id: Self::generate_trace_id(created_at),
        }
    }

    /// Generates an AWS X-Ray trace ID.
    ///
    /// Format: Root=1-{8-hex-time}-{24-hex-random}
    fn generate_trace_id(timestamp: DateTime<Utc>) -> String {
        let epoch_time = timestamp.timestamp() as u32;
        let random_hex = format!("{:032x}", Uuid::new_v4().as_u128())
            .chars()
            .take(24)
            .collect::<String>();

        format!("Root=1-{:08x}-{}", epoch_time, random_hex)
    }

    /// Returns the deadline as milliseconds since Unix epoch.
    pub fn deadline_ms(&self) -> i64 {
        self.deadline.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn environment(timeout_ms: u64) -> FunctionConfig {
        FunctionConfig {
            invocation_timeout: Duration::from_millis(timeout_ms),
            ..FunctionConfig::default()
        }
    }

    #[test]
    fn context_uses_function_environment() {
        let env = FunctionConfig {
            region: "eu-west-1".to_string(),
            account_id: "111122223333".to_string(),
            ..FunctionConfig::default()
        };
        let context = InvocationContext::new("resize-images", &env);

        assert_eq!(
            context.invoked_function_arn,
            "arn:aws:lambda:eu-west-1:111122223333:function:resize-images"
        );
        assert_eq!(context.log_group_name, "/aws/lambda/resize-images");
        assert_eq!(context.function_version, "$LATEST");
        assert_eq!(context.memory_limit_in_mb, 128);
    }

    #[test]
    fn contexts_never_share_request_ids() {
        let env = FunctionConfig::default();
        let first = InvocationContext::new("f", &env);
        let second = InvocationContext::new("f", &env);

        assert_ne!(first.aws_request_id, second.aws_request_id);
        assert_ne!(first.trace_id, second.trace_id);
    }

    #[test]
    fn huge_timeout_saturates_deadline() {
        for timeout_ms in [10_000_000_000_000_000, u64::MAX] {
            let context = InvocationContext::new("f", &environment(timeout_ms));

            assert_eq!(context.deadline, DateTime::<Utc>::MAX_UTC);
            assert!(context.deadline > context.created_at);
        }
    }

    proptest! {
        #[test]
        fn deadline_is_in_future(timeout_ms in 1u64..=900000u64) {
            let context = InvocationContext::new("f", &environment(timeout_ms));

            prop_assert!(context.deadline > context.created_at);
            prop_assert!(context.deadline_ms() > context.created_at.timestamp_millis());
        }

        #[test]
        fn trace_id_format_is_valid(name in "[a-z][a-z0-9-]{0,20}") {
            let context = InvocationContext::new(&name, &FunctionConfig::default());

            prop_assert!(context.trace_id.starts_with("Root=1-"));
            let parts: Vec<_> = context.trace_id.split('-').collect();
            prop_assert_eq!(parts.len(), 3);
            prop_assert_eq!(parts[1].len(), 8);
            prop_assert_eq!(parts[2].len(), 24);
        }
    }
}
