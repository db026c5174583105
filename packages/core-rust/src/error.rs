//! Error codes, the caller-visible domain error, and the step error type.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::Value;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// RPC error code (gRPC numbering) with a snake_case wire name and an HTTP
/// status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

const CODES: [(ErrorCode, &str, u16); 17] = [
    (ErrorCode::Ok, "ok", 200),
    (ErrorCode::Canceled, "canceled", 499),
    (ErrorCode::Unknown, "unknown", 500),
    (ErrorCode::InvalidArgument, "invalid_argument", 400),
    (ErrorCode::DeadlineExceeded, "deadline_exceeded", 504),
    (ErrorCode::NotFound, "not_found", 404),
    (ErrorCode::AlreadyExists, "already_exists", 409),
    (ErrorCode::PermissionDenied, "permission_denied", 403),
    (ErrorCode::ResourceExhausted, "resource_exhausted", 429),
    (ErrorCode::FailedPrecondition, "failed_precondition", 400),
    (ErrorCode::Aborted, "aborted", 409),
    (ErrorCode::OutOfRange, "out_of_range", 400),
    (ErrorCode::Unimplemented, "unimplemented", 501),
    (ErrorCode::Internal, "internal", 500),
    (ErrorCode::Unavailable, "unavailable", 503),
    (ErrorCode::DataLoss, "data_loss", 500),
    (ErrorCode::Unauthenticated, "unauthenticated", 401),
];

impl ErrorCode {
    fn entry(self) -> (ErrorCode, &'static str, u16) {
        CODES[self as usize]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.entry().1
    }

    /// Suitable HTTP status for this code.
    #[must_use]
    pub fn http_status(self) -> u16 {
        self.entry().2
    }

    /// Looks a code up by its wire name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        CODES
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(code, _, _)| *code)
    }

    /// First code mapped to `status`, for failures that arrive without an
    /// error body. `unknown` when nothing matches.
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        CODES
            .iter()
            .skip(1)
            .find(|(_, _, s)| *s == status)
            .map_or(Self::Unknown, |(code, _, _)| *code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The name was not one of the known error codes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown error code {0:?}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// BusError
// ---------------------------------------------------------------------------

/// Caller-visible domain error, translated at the transport boundary into
/// the wire error representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct BusError {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    pub code: ErrorCode,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub help: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, Value>,
}

impl BusError {
    /// Creates an error whose status is derived from `code`.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: None,
            code,
            status: code.http_status(),
            title: None,
            message: message.into(),
            help: None,
            path: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }
}

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

/// How the resiliency layer may treat a failed step call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryClass {
    /// No explicit marking. Not retried.
    #[default]
    Unmarked,
    /// Safe to re-invoke under an active retry policy.
    Retriable,
    /// Never re-invoked, even under an active retry policy.
    Permanent,
}

/// Failure returned by an action, a pipeline, or a resiliency wrapper.
///
/// Optionally names an error template (resolved from configuration at the
/// transport boundary) and carries template metadata.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    pub code: Option<ErrorCode>,
    pub message: String,
    pub template: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    pub retry: RetryClass,
}

impl ActionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            template: None,
            metadata: BTreeMap::new(),
            retry: RetryClass::Unmarked,
        }
    }

    #[must_use]
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(message)
        }
    }

    /// An error rendered through the named error template.
    #[must_use]
    pub fn template(name: impl Into<String>, metadata: BTreeMap<String, Value>) -> Self {
        let name = name.into();
        Self {
            template: Some(name.clone()),
            metadata,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn retriable(mut self) -> Self {
        self.retry = RetryClass::Retriable;
        self
    }

    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.retry = RetryClass::Permanent;
        self
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.retry == RetryClass::Retriable
    }

    /// Structured error detail exposed to recovery pipelines as `$error`.
    #[must_use]
    pub fn to_value(&self, step: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("message".to_string(), Value::from(self.message.as_str()));
        map.insert(
            "code".to_string(),
            self.code.map_or(Value::Null, |c| Value::from(c.as_str())),
        );
        map.insert("step".to_string(), Value::from(step));
        if let Some(template) = &self.template {
            map.insert("template".to_string(), Value::from(template.as_str()));
        }
        if !self.metadata.is_empty() {
            map.insert("metadata".to_string(), Value::Map(self.metadata.clone()));
        }
        Value::Map(map)
    }
}

impl From<BusError> for ActionError {
    fn from(err: BusError) -> Self {
        Self {
            code: Some(err.code),
            message: err.message,
            template: err.kind,
            metadata: err.metadata,
            retry: RetryClass::Unmarked,
        }
    }
}

impl From<crate::types::ConversionError> for ActionError {
    fn from(err: crate::types::ConversionError) -> Self {
        Self::with_code(ErrorCode::InvalidArgument, err.to_string()).permanent()
    }
}

impl From<crate::codec::CodecError> for ActionError {
    fn from(err: crate::codec::CodecError) -> Self {
        Self::with_code(ErrorCode::InvalidArgument, err.to_string()).permanent()
    }
}

impl From<crate::expr::ExprError> for ActionError {
    fn from(err: crate::expr::ExprError) -> Self {
        Self::with_code(ErrorCode::InvalidArgument, err.to_string()).permanent()
    }
}

impl From<crate::stream::StreamError> for ActionError {
    fn from(err: crate::stream::StreamError) -> Self {
        Self::with_code(ErrorCode::Aborted, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_matches_discriminants() {
        for (i, (code, _, _)) in CODES.iter().enumerate() {
            assert_eq!(*code as usize, i);
        }
    }

    #[test]
    fn code_names_and_statuses() {
        assert_eq!(ErrorCode::Unimplemented.as_str(), "unimplemented");
        assert_eq!(ErrorCode::Unimplemented.http_status(), 501);
        assert_eq!(ErrorCode::ResourceExhausted.http_status(), 429);
        assert_eq!("permission_denied".parse::<ErrorCode>().unwrap(), ErrorCode::PermissionDenied);
        assert!("bogus".parse::<ErrorCode>().is_err());
        assert_eq!(ErrorCode::from_http_status(404), ErrorCode::NotFound);
        assert_eq!(ErrorCode::from_http_status(503), ErrorCode::Unavailable);
        assert_eq!(ErrorCode::from_http_status(418), ErrorCode::Unknown);
    }

    #[test]
    fn bus_error_serializes_code_by_name() {
        let err = BusError::unimplemented("Greeter::SayHello is not implemented");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "unimplemented");
        assert_eq!(json["status"], 501);
        assert!(json.get("help").is_none());
    }

    #[test]
    fn retry_marking() {
        let err = ActionError::new("boom");
        assert!(!err.is_retriable());
        assert!(err.clone().retriable().is_retriable());
        assert_eq!(err.permanent().retry, RetryClass::Permanent);
    }
}
