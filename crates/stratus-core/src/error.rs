//! The error taxonomy surfaced by every stratus operation.

use crate::response::{ResponseDetails, ResponseStatus};

/// Errors produced by storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorError {
    /// Socket, DNS, TLS, or timeout failure from the HTTP engine.
    #[error("{0}.")]
    Transport(String),

    /// Unexpected HTTP status with no parseable AWS body.
    #[error("{status}.")]
    Http {
        /// The HTTP status line, e.g. `502 Bad Gateway`.
        status: String,
    },

    /// 404 with no parseable AWS body.
    #[error("HTTP resource not found: {url}.")]
    HttpNotFound {
        /// The request URL.
        url: String,
    },

    /// An HTTP failure annotated with the standard S3 error envelope.
    #[error("{message} (Code='{code}', RequestId='{request_id}').")]
    Aws {
        /// `<Error>/<Code>`.
        code: String,
        /// `<Error>/<Message>`.
        message: String,
        /// `<Error>/<RequestId>`.
        request_id: String,
        /// `<Error>/<HostId>`.
        host_id: String,
    },

    /// Malformed XML, unknown nesting, or tag-stack overflow.
    #[error("Cannot parse the response.")]
    Parser,

    /// Missing HTTP status or an internal invariant violation.
    #[error("Unexpected error.")]
    Unexpected,

    /// `wait_any` was given more connections than the wait primitive supports.
    #[error("Too many connections passed to wait_any method.")]
    TooManyConnections,

    /// Per-operation summary wrapping the underlying failure.
    #[error("S3 {op} for '{key}' failed. {source}")]
    Operation {
        /// Operation name, e.g. `put`.
        op: &'static str,
        /// Operation subject, usually the key.
        key: String,
        /// The underlying failure.
        #[source]
        source: Box<StorError>,
    },
}

/// Convenience result type for storage operations.
pub type StorResult<T> = Result<T, StorError>;

impl StorError {
    /// Wrap an error in the per-operation summary.
    #[must_use]
    pub fn summarize(self, op: &'static str, key: impl Into<String>) -> Self {
        Self::Operation {
            op,
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any summary wrapper.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Map classified response details to the taxonomy.
    ///
    /// `Success` maps to `Ok`; every failure classification picks the error
    /// kind that preserves the most diagnostic context.
    pub fn check_details(details: &ResponseDetails) -> StorResult<()> {
        match details.status {
            ResponseStatus::Success => Ok(()),
            ResponseStatus::Unexpected => Err(Self::Unexpected),
            ResponseStatus::HttpResourceNotFound => Err(Self::HttpNotFound {
                url: details.url.clone(),
            }),
            // No details could be read from the payload, so report the
            // HTTP status as-is.
            ResponseStatus::HttpFailure | ResponseStatus::HttpOrAwsFailure => Err(Self::Http {
                status: details.http_status.clone(),
            }),
            ResponseStatus::FailureWithDetails => Err(Self::Aws {
                code: details.error_code.clone(),
                message: details.error_message.clone(),
                request_id: details.request_id.clone(),
                host_id: details.host_id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_format_summary_error() {
        let err = StorError::Transport("connection timed out".to_owned())
            .summarize("get", "tmp/f1/t.dat");
        assert_eq!(
            err.to_string(),
            "S3 get for 'tmp/f1/t.dat' failed. connection timed out."
        );
    }

    #[test]
    fn test_should_format_aws_error_with_code_and_request_id() {
        let err = StorError::Aws {
            code: "NoSuchBucket".to_owned(),
            message: "The specified bucket does not exist".to_owned(),
            request_id: "4442587FB7D0A2F9".to_owned(),
            host_id: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "The specified bucket does not exist (Code='NoSuchBucket', RequestId='4442587FB7D0A2F9')."
        );
    }

    #[test]
    fn test_should_expose_root_error_beneath_summary() {
        let err = StorError::Parser.summarize("list_objects", "bucket");
        assert!(matches!(err.root(), StorError::Parser));
    }

    #[test]
    fn test_should_map_details_to_taxonomy() {
        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::Success;
        assert!(StorError::check_details(&details).is_ok());

        details.status = ResponseStatus::HttpResourceNotFound;
        details.url = "http://example/b/k".to_owned();
        let err = StorError::check_details(&details).unwrap_err();
        assert_eq!(err.to_string(), "HTTP resource not found: http://example/b/k.");

        details.status = ResponseStatus::HttpOrAwsFailure;
        details.http_status = "503 Service Unavailable".to_owned();
        let err = StorError::check_details(&details).unwrap_err();
        assert_eq!(err.to_string(), "503 Service Unavailable.");

        details.status = ResponseStatus::FailureWithDetails;
        details.error_code = "SlowDown".to_owned();
        details.error_message = "Reduce your request rate".to_owned();
        details.request_id = "A1".to_owned();
        let err = StorError::check_details(&details).unwrap_err();
        assert!(matches!(err, StorError::Aws { .. }));

        details.status = ResponseStatus::Unexpected;
        let err = StorError::check_details(&details).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected error.");
    }
}
