//! Per-operation response handling.
//!
//! Each operation that receives XML installs a visitor dispatched by the
//! scanner in `stratus-xml`. The visitors mirror the documents S3 and Walrus
//! actually send, including the Walrus deviations: its listing nodes sit one
//! level deeper, and its `<CommonPrefixes>/<Prefix>` values are relative to
//! the request prefix.

use bytes::Bytes;
use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::Writer;
use stratus_core::error::{StorError, StorResult};
use stratus_core::response::{ResponseDetails, ResponseStatus};
use stratus_core::types::{
    Bucket, MultipartUpload, ObjectConsumer, ObjectSummary, PutResponse, UploadConsumer,
};
use stratus_xml::{ResponseTag, ResponseVisitor, TagStack};

/// Fill response details from the status line and headers.
pub(crate) fn details_from_parts(
    name: &str,
    url: &str,
    parts: &http::response::Parts,
) -> ResponseDetails {
    let mut details = ResponseDetails::named(name);
    details.url = url.to_owned();
    details.status = ResponseStatus::classify(parts.status);
    details.http_status = match parts.status.canonical_reason() {
        Some(reason) => format!("{} {reason}", parts.status.as_u16()),
        None => parts.status.as_u16().to_string(),
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    };

    // Amazon quotes the ETag header, Walrus does not.
    details.etag = header("etag").trim_matches('"').to_owned();
    details.http_date = header("date").to_owned();
    details.amazon_id = header("x-amz-id-2").to_owned();
    details.request_id = header("x-amz-request-id").to_owned();
    details.http_content_type = header("content-type").to_owned();
    details.http_content_length = header("content-length").parse().unwrap_or(-1);

    details
}

/// Strip the quotes S3 puts around etag values in XML bodies.
fn push_etag_text(target: &mut String, text: &str) {
    target.push_str(text.trim_matches('"'));
}

/// Visitor for `list_all_buckets`.
#[derive(Debug, Default)]
pub(crate) struct ListBucketsVisitor {
    current: Bucket,
    pub buckets: Vec<Bucket>,
}

impl ListBucketsVisitor {
    /// `ListAllMyBucketsResult/Buckets/Bucket`; Walrus nests one deeper.
    fn is_bucket_node(stack: &TagStack) -> bool {
        (stack.depth() == 3 || stack.depth() == 4) && stack.top() == Some(ResponseTag::Bucket)
    }
}

impl ResponseVisitor for ListBucketsVisitor {
    fn expects_xml(&self) -> bool {
        true
    }

    fn on_start(&mut self, stack: &TagStack) -> bool {
        if Self::is_bucket_node(stack) {
            self.current = Bucket::default();
        }
        true
    }

    fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
        if stack.depth() < 3 {
            return true;
        }
        match stack.top() {
            Some(ResponseTag::Name) => self.current.name = text.to_owned(),
            Some(ResponseTag::CreationDate) => self.current.creation_date = text.to_owned(),
            _ => {}
        }
        true
    }

    fn on_end(&mut self, stack: &TagStack) -> bool {
        if Self::is_bucket_node(stack) {
            self.buckets.push(std::mem::take(&mut self.current));
        }
        true
    }
}

/// Visitor for `list_objects`.
pub(crate) struct ListObjectsVisitor<'a> {
    consumer: &'a mut dyn ObjectConsumer,
    is_walrus: bool,
    current: ObjectSummary,
    /// Request-level `<Prefix>`, captured on Walrus to absolutize the
    /// relative `<CommonPrefixes>` values it returns.
    walrus_prefix: String,
    last_key: String,
    next_marker: String,
    pub is_truncated: bool,
}

impl<'a> ListObjectsVisitor<'a> {
    pub fn new(consumer: &'a mut dyn ObjectConsumer, is_walrus: bool) -> Self {
        Self {
            consumer,
            is_walrus,
            current: ObjectSummary::default(),
            walrus_prefix: String::new(),
            last_key: String::new(),
            next_marker: String::new(),
            is_truncated: false,
        }
    }

    /// The marker for the next page: `<NextMarker>` when the server sent
    /// one, otherwise the last key seen (Walrus never sends the former).
    pub fn next_marker(&self) -> &str {
        if self.next_marker.is_empty() {
            &self.last_key
        } else {
            &self.next_marker
        }
    }

    fn is_object_node(&self, stack: &TagStack) -> bool {
        if self.is_walrus {
            (stack.depth() == 3 && stack.top() == Some(ResponseTag::Contents))
                || (stack.depth() == 4
                    && stack.top() == Some(ResponseTag::Prefix)
                    && stack.parent() == Some(ResponseTag::CommonPrefixes))
        } else {
            stack.depth() == 2
                && matches!(
                    stack.top(),
                    Some(ResponseTag::Contents | ResponseTag::CommonPrefixes)
                )
        }
    }
}

impl ResponseVisitor for ListObjectsVisitor<'_> {
    fn expects_xml(&self) -> bool {
        true
    }

    fn on_start(&mut self, stack: &TagStack) -> bool {
        if self.is_object_node(stack) {
            self.current = ObjectSummary::default();
        }
        true
    }

    fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
        if stack.depth() < 2 {
            return true;
        }
        match stack.top() {
            Some(ResponseTag::IsTruncated) => self.is_truncated = text == "true",
            // Key and ETag text can arrive in chunks; append.
            Some(ResponseTag::Key) => self.current.key.push_str(text),
            Some(ResponseTag::LastModified) => self.current.last_modified = text.to_owned(),
            Some(ResponseTag::ETag) => push_etag_text(&mut self.current.etag, text),
            Some(ResponseTag::Size) => self.current.size = text.parse().unwrap_or(0),
            Some(ResponseTag::Prefix) => {
                if stack.parent() == Some(ResponseTag::CommonPrefixes) {
                    if self.is_walrus {
                        self.current.key.push_str(&self.walrus_prefix);
                    }
                    self.current.key.push_str(text);
                    self.current.is_dir = true;
                    self.current.size = -1;
                } else if self.is_walrus {
                    self.walrus_prefix = text.to_owned();
                }
            }
            Some(ResponseTag::NextMarker) => self.next_marker = text.to_owned(),
            _ => {}
        }
        true
    }

    fn on_end(&mut self, stack: &TagStack) -> bool {
        if self.is_object_node(stack) {
            self.last_key.clone_from(&self.current.key);
            return self.consumer.on_object(std::mem::take(&mut self.current));
        }
        true
    }
}

/// Visitor for `list_multipart_uploads`.
pub(crate) struct ListUploadsVisitor<'a> {
    consumer: &'a mut dyn UploadConsumer,
    current: MultipartUpload,
    pub last: MultipartUpload,
    pub is_truncated: bool,
}

impl<'a> ListUploadsVisitor<'a> {
    pub fn new(consumer: &'a mut dyn UploadConsumer) -> Self {
        Self {
            consumer,
            current: MultipartUpload::default(),
            last: MultipartUpload::default(),
            is_truncated: false,
        }
    }

    fn is_upload_node(stack: &TagStack) -> bool {
        stack.depth() == 2
            && matches!(
                stack.top(),
                Some(ResponseTag::Upload | ResponseTag::CommonPrefixes)
            )
    }
}

impl ResponseVisitor for ListUploadsVisitor<'_> {
    fn expects_xml(&self) -> bool {
        true
    }

    fn on_start(&mut self, stack: &TagStack) -> bool {
        if Self::is_upload_node(stack) {
            self.current = MultipartUpload::default();
        }
        true
    }

    fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
        if stack.depth() < 2 {
            return true;
        }
        match stack.top() {
            Some(ResponseTag::IsTruncated) => self.is_truncated = text == "true",
            Some(ResponseTag::Key) => self.current.key.push_str(text),
            Some(ResponseTag::UploadId) => self.current.upload_id = text.to_owned(),
            Some(ResponseTag::Prefix) => {
                if stack.parent() == Some(ResponseTag::CommonPrefixes) {
                    self.current.key.push_str(text);
                    self.current.is_dir = true;
                }
            }
            _ => {}
        }
        true
    }

    fn on_end(&mut self, stack: &TagStack) -> bool {
        if Self::is_upload_node(stack) {
            self.last = self.current.clone();
            return self.consumer.on_upload(std::mem::take(&mut self.current));
        }
        true
    }
}

/// Visitor for `initiate_multipart_upload`.
#[derive(Debug, Default)]
pub(crate) struct InitiateUploadVisitor {
    pub upload_id: String,
}

impl ResponseVisitor for InitiateUploadVisitor {
    fn expects_xml(&self) -> bool {
        true
    }

    fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
        if stack.depth() == 2 && stack.top() == Some(ResponseTag::UploadId) {
            self.upload_id = text.to_owned();
        }
        true
    }
}

/// Visitor for `complete_multipart_upload`.
#[derive(Debug, Default)]
pub(crate) struct CompleteUploadVisitor {
    pub etag: String,
}

impl ResponseVisitor for CompleteUploadVisitor {
    fn expects_xml(&self) -> bool {
        true
    }

    fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
        if stack.depth() == 2 && stack.top() == Some(ResponseTag::ETag) {
            push_etag_text(&mut self.etag, text);
        }
        true
    }
}

/// Build the `CompleteMultipartUpload` request body.
pub(crate) fn complete_upload_body(parts: &[PutResponse]) -> StorResult<Bytes> {
    let mut buf = Vec::with_capacity(1024);
    let mut writer = Writer::new(&mut buf);

    let result: std::io::Result<()> = (|| {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer
            .create_element("CompleteMultipartUpload")
            .write_inner_content(|w| {
                for part in parts {
                    w.create_element("Part").write_inner_content(|w| {
                        w.create_element("PartNumber")
                            .write_text_content(BytesText::new(&part.part_number.to_string()))?;
                        // The server expects the quoted etag form here.
                        w.create_element("ETag")
                            .write_text_content(BytesText::new(&format!("\"{}\"", part.etag)))?;
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
        Ok(())
    })();

    result.map_err(|_| StorError::Unexpected)?;
    Ok(buf.into())
}

/// Build the `CreateBucketConfiguration` request body for a region-pinned
/// bucket; an empty region means no body.
pub(crate) fn create_bucket_body(region: &str) -> StorResult<Bytes> {
    if region.is_empty() {
        return Ok(Bytes::new());
    }

    let mut buf = Vec::with_capacity(256);
    let mut writer = Writer::new(&mut buf);

    let result: std::io::Result<()> = writer
        .create_element("CreateBucketConfiguration")
        .write_inner_content(|w| {
            w.create_element("LocationConstraint")
                .write_text_content(BytesText::new(region))?;
            Ok(())
        })
        .map(|_| ());

    result.map_err(|_| StorError::Unexpected)?;
    Ok(buf.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::types::{ObjectCollector, UploadCollector};
    use stratus_xml::scan;

    async fn run_scan(xml: &str, visitor: &mut dyn ResponseVisitor) -> ResponseDetails {
        let mut details = ResponseDetails::default();
        scan(xml.as_bytes(), visitor, &mut details)
            .await
            .expect("scan");
        details
    }

    #[tokio::test]
    async fn test_should_parse_bucket_listing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListAllMyBucketsResult>
              <Owner><ID>abc</ID><DisplayName>me</DisplayName></Owner>
              <Buckets>
                <Bucket><Name>first</Name><CreationDate>2011-05-06T18:35:18.000Z</CreationDate></Bucket>
                <Bucket><Name>second</Name><CreationDate>2012-01-01T00:00:00.000Z</CreationDate></Bucket>
              </Buckets>
            </ListAllMyBucketsResult>"#;

        let mut visitor = ListBucketsVisitor::default();
        run_scan(xml, &mut visitor).await;

        assert_eq!(visitor.buckets.len(), 2);
        assert_eq!(visitor.buckets[0].name, "first");
        assert_eq!(visitor.buckets[0].creation_date, "2011-05-06T18:35:18.000Z");
        assert_eq!(visitor.buckets[1].name, "second");
    }

    #[tokio::test]
    async fn test_should_parse_object_listing_with_directories() {
        let xml = r#"<ListBucketResult>
              <Name>b</Name>
              <Prefix>tmp/</Prefix>
              <IsTruncated>false</IsTruncated>
              <Contents>
                <Key>tmp/a.dat</Key>
                <LastModified>2012-02-01T01:02:03.000Z</LastModified>
                <ETag>&quot;0123abcd&quot;</ETag>
                <Size>42</Size>
              </Contents>
              <CommonPrefixes><Prefix>tmp/f1/</Prefix></CommonPrefixes>
              <CommonPrefixes><Prefix>tmp/f2/</Prefix></CommonPrefixes>
            </ListBucketResult>"#;

        let mut collector = ObjectCollector::default();
        let mut visitor = ListObjectsVisitor::new(&mut collector, false);
        run_scan(xml, &mut visitor).await;

        assert!(!visitor.is_truncated);
        assert_eq!(visitor.next_marker(), "tmp/f2/");
        drop(visitor);
        let objects = collector.objects;
        assert_eq!(objects.len(), 3);

        assert_eq!(objects[0].key, "tmp/a.dat");
        assert_eq!(objects[0].etag, "0123abcd");
        assert_eq!(objects[0].size, 42);
        assert!(!objects[0].is_dir);

        assert_eq!(objects[1].key, "tmp/f1/");
        assert_eq!(objects[1].size, -1);
        assert!(objects[1].is_dir);
        assert_eq!(objects[2].key, "tmp/f2/");
    }

    #[tokio::test]
    async fn test_should_prefer_next_marker_over_last_key() {
        let xml = r#"<ListBucketResult>
              <IsTruncated>true</IsTruncated>
              <Contents><Key>k1</Key><Size>1</Size></Contents>
              <NextMarker>k9</NextMarker>
            </ListBucketResult>"#;

        let mut collector = ObjectCollector::default();
        let mut visitor = ListObjectsVisitor::new(&mut collector, false);
        run_scan(xml, &mut visitor).await;

        assert!(visitor.is_truncated);
        assert_eq!(visitor.next_marker(), "k9");
    }

    #[tokio::test]
    async fn test_should_absolutize_walrus_common_prefixes() {
        // Walrus: nodes one level deeper, request prefix echoed at depth 2,
        // and relative CommonPrefixes values.
        let xml = r#"<ListBucketResponse>
              <ListBucketResult>
                <Prefix>tmp/</Prefix>
                <IsTruncated>false</IsTruncated>
                <Contents>
                  <Key>tmp/a.dat</Key>
                  <ETag>77add1d5f41223d5582fca736a5cb335</ETag>
                  <Size>7</Size>
                </Contents>
                <CommonPrefixes><Prefix>f1/</Prefix></CommonPrefixes>
              </ListBucketResult>
            </ListBucketResponse>"#;

        let mut collector = ObjectCollector::default();
        let mut visitor = ListObjectsVisitor::new(&mut collector, true);
        run_scan(xml, &mut visitor).await;

        assert_eq!(visitor.next_marker(), "tmp/f1/");
        drop(visitor);
        let objects = collector.objects;
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "tmp/a.dat");
        assert_eq!(objects[0].etag, "77add1d5f41223d5582fca736a5cb335");
        assert_eq!(objects[1].key, "tmp/f1/");
        assert!(objects[1].is_dir);
        assert_eq!(objects[1].size, -1);
    }

    #[tokio::test]
    async fn test_should_stop_listing_when_consumer_declines() {
        let xml = r#"<ListBucketResult>
              <Contents><Key>k1</Key><Size>1</Size></Contents>
              <Contents><Key>k2</Key><Size>1</Size></Contents>
            </ListBucketResult>"#;

        let seen = std::sync::atomic::AtomicUsize::new(0);
        let mut consumer = |_: ObjectSummary| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            false
        };
        let mut visitor = ListObjectsVisitor::new(&mut consumer, false);
        let mut details = ResponseDetails::default();
        let err = scan(xml.as_bytes(), &mut visitor, &mut details)
            .await
            .expect_err("consumer stopped");
        assert!(matches!(err.into_stor_error(), StorError::Parser));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_should_parse_multipart_upload_listing() {
        let xml = r#"<ListMultipartUploadsResult>
              <IsTruncated>true</IsTruncated>
              <Upload><Key>big1</Key><UploadId>id-1</UploadId></Upload>
              <Upload><Key>big2</Key><UploadId>id-2</UploadId></Upload>
              <CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>
            </ListMultipartUploadsResult>"#;

        let mut collector = UploadCollector::default();
        let mut visitor = ListUploadsVisitor::new(&mut collector);
        run_scan(xml, &mut visitor).await;

        assert!(visitor.is_truncated);
        assert_eq!(visitor.last.key, "dir/");
        drop(visitor);
        let uploads = collector.uploads;
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0].key, "big1");
        assert_eq!(uploads[0].upload_id, "id-1");
        assert!(uploads[2].is_dir);
        assert_eq!(uploads[2].key, "dir/");
    }

    #[tokio::test]
    async fn test_should_extract_upload_id_on_initiate() {
        let xml = r#"<InitiateMultipartUploadResult>
              <Bucket>b</Bucket><Key>k</Key>
              <UploadId>VXBsb2FkSWQ2</UploadId>
            </InitiateMultipartUploadResult>"#;

        let mut visitor = InitiateUploadVisitor::default();
        run_scan(xml, &mut visitor).await;
        assert_eq!(visitor.upload_id, "VXBsb2FkSWQ2");
    }

    #[tokio::test]
    async fn test_should_extract_etag_on_complete() {
        let xml = r#"<CompleteMultipartUploadResult>
              <Location>http://b.s3.amazonaws.com/k</Location>
              <Bucket>b</Bucket><Key>k</Key>
              <ETag>&quot;3858f62230ac3c915f300c664312c11f-2&quot;</ETag>
            </CompleteMultipartUploadResult>"#;

        let mut visitor = CompleteUploadVisitor::default();
        run_scan(xml, &mut visitor).await;
        assert_eq!(visitor.etag, "3858f62230ac3c915f300c664312c11f-2");
    }

    #[test]
    fn test_should_build_complete_upload_body() {
        let parts = vec![
            PutResponse {
                etag: "e1".to_owned(),
                part_number: 1,
            },
            PutResponse {
                etag: "e2".to_owned(),
                part_number: 2,
            },
        ];
        let body = complete_upload_body(&parts).expect("body");
        let text = std::str::from_utf8(&body).expect("utf8");

        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<CompleteMultipartUpload>"));
        assert!(text.contains("<Part><PartNumber>1</PartNumber>"));
        assert!(text.contains("e1"));
        assert!(text.contains("<Part><PartNumber>2</PartNumber>"));
        assert!(text.ends_with("</CompleteMultipartUpload>"));
    }

    #[test]
    fn test_should_build_create_bucket_body_only_with_region() {
        assert!(create_bucket_body("").expect("empty").is_empty());

        let body = create_bucket_body("us-west-2").expect("body");
        assert_eq!(
            std::str::from_utf8(&body).expect("utf8"),
            "<CreateBucketConfiguration><LocationConstraint>us-west-2</LocationConstraint></CreateBucketConfiguration>"
        );
    }

    #[test]
    fn test_should_fill_details_from_response_parts() {
        let (parts, ()) = http::Response::builder()
            .status(http::StatusCode::OK)
            .header("ETag", "\"abc123\"")
            .header("Date", "Sat, 01 Aug 2026 12:00:00 GMT")
            .header("x-amz-id-2", "host-token")
            .header("x-amz-request-id", "req-1")
            .header("Content-Type", "application/xml")
            .header("Content-Length", "120")
            .body(())
            .expect("response")
            .into_parts();

        let details = details_from_parts("k", "http://h/b/k", &parts);
        assert_eq!(details.status, ResponseStatus::Success);
        assert_eq!(details.http_status, "200 OK");
        assert_eq!(details.etag, "abc123");
        assert_eq!(details.http_date, "Sat, 01 Aug 2026 12:00:00 GMT");
        assert_eq!(details.amazon_id, "host-token");
        assert_eq!(details.request_id, "req-1");
        assert_eq!(details.http_content_type, "application/xml");
        assert_eq!(details.http_content_length, 120);
    }

    #[test]
    fn test_should_keep_unquoted_etag_headers() {
        // Walrus sends the ETag header without quotes.
        let (parts, ()) = http::Response::builder()
            .status(http::StatusCode::OK)
            .header("ETag", "abc123")
            .body(())
            .expect("response")
            .into_parts();

        let details = details_from_parts("k", "u", &parts);
        assert_eq!(details.etag, "abc123");
        assert_eq!(details.http_content_length, -1);
    }
}
