//! Per-request response details and outcome classification.
//!
//! Every operation accumulates a [`ResponseDetails`] while the response is
//! consumed: the interesting headers, the standard S3 `<Error>` envelope
//! fields when present, and running transfer state. The
//! [`ResponseStatus`] starts from the HTTP status code and may later be
//! upgraded to [`ResponseStatus::FailureWithDetails`] when the body carries a
//! parseable error envelope.

use http::StatusCode;

/// Classification of a response, derived from the HTTP status and possibly
/// upgraded by the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    /// No HTTP status was seen; an internal invariant was violated.
    #[default]
    Unexpected,
    /// 200 / 204 / 206.
    Success,
    /// An HTTP failure with a parsed S3 `<Error>` envelope.
    FailureWithDetails,
    /// An HTTP failure outside the set S3 services are known to annotate.
    HttpFailure,
    /// 404; may still be upgraded when the body carries an envelope.
    HttpResourceNotFound,
    /// A status S3 services annotate with an XML error body; may be upgraded.
    HttpOrAwsFailure,
}

impl ResponseStatus {
    /// Classify an HTTP status code.
    ///
    /// 404 and the statuses S3/Walrus are known to annotate with an XML error
    /// body start out as upgradable failures; everything else outside the
    /// success set is a plain HTTP failure.
    #[must_use]
    pub fn classify(status: StatusCode) -> Self {
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT | StatusCode::NO_CONTENT => Self::Success,
            StatusCode::NOT_FOUND => Self::HttpResourceNotFound,
            StatusCode::MOVED_PERMANENTLY
            | StatusCode::BAD_REQUEST
            | StatusCode::FORBIDDEN
            | StatusCode::CONFLICT
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE => Self::HttpOrAwsFailure,
            _ => Self::HttpFailure,
        }
    }

    /// Whether the body may carry an S3 `<Error>` envelope worth parsing.
    #[must_use]
    pub fn may_have_error_body(self) -> bool {
        matches!(self, Self::HttpResourceNotFound | Self::HttpOrAwsFailure)
    }
}

/// Everything one request learned from its response.
#[derive(Debug, Clone)]
pub struct ResponseDetails {
    /// Outcome classification.
    pub status: ResponseStatus,
    /// Request URL, kept for error messages.
    pub url: String,
    /// Operation subject (usually the key), kept for error messages.
    pub name: String,

    /// HTTP status line, e.g. `404 Not Found`.
    pub http_status: String,
    /// `Date` response header.
    pub http_date: String,
    /// `Content-Length` response header; -1 when absent.
    pub http_content_length: i64,
    /// `Content-Type` response header.
    pub http_content_type: String,
    /// `x-amz-id-2` response header.
    pub amazon_id: String,
    /// `x-amz-request-id` response header, or `<RequestId>` from the body.
    pub request_id: String,
    /// ETag, without surrounding quotes.
    pub etag: String,

    /// `<Error>/<Code>` from the body.
    pub error_code: String,
    /// `<Error>/<Message>` from the body.
    pub error_message: String,
    /// `<Error>/<HostId>` from the body.
    pub host_id: String,
    /// `<IsTruncated>` from a listing body.
    pub is_truncated: bool,
    /// `<UploadId>` from an initiate-multipart body.
    pub upload_id: String,

    /// Bytes accepted by the sink so far.
    pub loaded_content_length: i64,
}

impl Default for ResponseDetails {
    fn default() -> Self {
        Self {
            status: ResponseStatus::Unexpected,
            url: String::new(),
            name: String::new(),
            http_status: String::new(),
            http_date: String::new(),
            http_content_length: -1,
            http_content_type: String::new(),
            amazon_id: String::new(),
            request_id: String::new(),
            etag: String::new(),
            error_code: String::new(),
            error_message: String::new(),
            host_id: String::new(),
            is_truncated: false,
            upload_id: String::new(),
            loaded_content_length: 0,
        }
    }
}

impl ResponseDetails {
    /// Create details for a named operation (the name shows up in summary
    /// errors, usually as the key).
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Upgrade an HTTP-level failure once a body `<Error>` field arrived.
    pub fn upgrade_to_detailed_failure(&mut self) {
        if self.status.may_have_error_body() {
            self.status = ResponseStatus::FailureWithDetails;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One case per row of the classification table.
    #[test]
    fn test_should_classify_success_statuses() {
        assert_eq!(
            ResponseStatus::classify(StatusCode::OK),
            ResponseStatus::Success
        );
        assert_eq!(
            ResponseStatus::classify(StatusCode::PARTIAL_CONTENT),
            ResponseStatus::Success
        );
        assert_eq!(
            ResponseStatus::classify(StatusCode::NO_CONTENT),
            ResponseStatus::Success
        );
    }

    #[test]
    fn test_should_classify_not_found_as_upgradable() {
        let status = ResponseStatus::classify(StatusCode::NOT_FOUND);
        assert_eq!(status, ResponseStatus::HttpResourceNotFound);
        assert!(status.may_have_error_body());
    }

    #[test]
    fn test_should_classify_aws_annotated_failures() {
        for code in [
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::CONFLICT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let status = ResponseStatus::classify(code);
            assert_eq!(status, ResponseStatus::HttpOrAwsFailure, "code {code}");
            assert!(status.may_have_error_body());
        }
    }

    #[test]
    fn test_should_classify_other_statuses_as_plain_http_failure() {
        for code in [
            StatusCode::CREATED,
            StatusCode::UNAUTHORIZED,
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::BAD_GATEWAY,
        ] {
            assert_eq!(
                ResponseStatus::classify(code),
                ResponseStatus::HttpFailure,
                "code {code}"
            );
        }
    }

    #[test]
    fn test_should_upgrade_only_upgradable_statuses() {
        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::HttpOrAwsFailure;
        details.upgrade_to_detailed_failure();
        assert_eq!(details.status, ResponseStatus::FailureWithDetails);

        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::Success;
        details.upgrade_to_detailed_failure();
        assert_eq!(details.status, ResponseStatus::Success);

        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::HttpFailure;
        details.upgrade_to_detailed_failure();
        assert_eq!(details.status, ResponseStatus::HttpFailure);
    }

    #[test]
    fn test_should_default_content_length_to_sentinel() {
        let details = ResponseDetails::named("tmp/key");
        assert_eq!(details.http_content_length, -1);
        assert_eq!(details.loaded_content_length, 0);
        assert_eq!(details.name, "tmp/key");
    }
}
