//! Base URL composition, key escaping, and query parameters.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use stratus_core::config::StorageConfig;

/// Everything except RFC 3986 unreserved characters is encoded. Slashes in
/// keys are encoded too; S3 treats `%2F` and `/` in object keys the same.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode an object key or query value.
#[must_use]
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, KEY_ENCODE_SET).to_string()
}

/// Composes request URLs for one endpoint.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base: String,
    region: String,
}

impl UrlBuilder {
    /// Build the base URL and extract the region from the host name.
    ///
    /// `s3-us-west-2.amazonaws.com` yields region `us-west-2`;
    /// `s3.amazonaws.com` (and every Walrus host) yields an empty region.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        let mut base = String::with_capacity(128);
        base.push_str(if config.is_https { "https://" } else { "http://" });
        base.push_str(config.effective_host());

        if let Some(port) = config.url_port() {
            base.push(':');
            base.push_str(&port.to_string());
        }

        if config.is_walrus {
            base.push_str("/services/Walrus");
        }
        base.push('/');

        let region = if config.is_walrus {
            String::new()
        } else {
            extract_region(config.effective_host())
        };

        Self { base, region }
    }

    /// The base URL, ending in `/`.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The region carried into `CreateBucketConfiguration`; empty for the
    /// default endpoint and for Walrus.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Compose the URL for a bucket-scoped request.
    ///
    /// Returns the full URL and the escaped key (with `suffix` appended),
    /// which is also the key form the request must be signed with. A key of
    /// `Some("")` addresses the bucket itself with a trailing slash.
    #[must_use]
    pub fn object_url(
        &self,
        bucket: &str,
        key: Option<&str>,
        suffix: Option<&str>,
    ) -> (String, Option<String>) {
        let mut url = String::with_capacity(256);
        url.push_str(&self.base);
        url.push_str(bucket);

        match key {
            Some(key) => {
                url.push('/');
                let mut escaped = escape(key);
                if let Some(suffix) = suffix {
                    escaped.push_str(suffix);
                }
                url.push_str(&escaped);
                (url, Some(escaped))
            }
            None => (url, None),
        }
    }
}

/// Append `?key=value` / `&key=value` to a URL.
///
/// The key is a controlled literal and is not escaped; the value always is.
/// `first` tracks whether the next separator is `?`.
pub fn append_query(url: &mut String, key: &str, value: Option<&str>, first: &mut bool) {
    let Some(value) = value else { return };

    url.push(if *first { '?' } else { '&' });
    url.push_str(key);
    url.push('=');
    url.push_str(&escape(value));
    *first = false;
}

/// The path-and-query portion of an absolute URL.
#[must_use]
pub fn path_and_query(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    match after_scheme.find('/') {
        Some(index) => &after_scheme[index..],
        None => "/",
    }
}

fn extract_region(host: &str) -> String {
    let Some(rest) = host.strip_prefix("s3-") else {
        return String::new();
    };
    match rest.find(".amazonaws.com") {
        Some(index) => rest[..index].to_owned(),
        None => String::new(),
    }
}
