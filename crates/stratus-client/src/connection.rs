//! The storage connection and its operation surface.
//!
//! A [`Connection`] binds one transport handle to one account for its whole
//! life. Inline operations run to completion on the caller's task; `pend_*`
//! moves the prepared request and the transport handle into a task on the
//! [`AsyncDriver`](crate::driver::AsyncDriver), and the matching `complete_*`
//! joins it and hands the handle back. At most one pended operation may be
//! outstanding per connection.

use std::ops::Range;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http::header;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use tokio_util::io::StreamReader;
use tracing::debug;

use stratus_auth::SignParams;
use stratus_core::config::StorageConfig;
use stratus_core::error::{StorError, StorResult};
use stratus_core::response::{ResponseDetails, ResponseStatus};
use stratus_core::types::{
    Bucket, BufferSink, GetResponse, GetSink, ListObjectsResponse, ListUploadsResponse,
    ObjectCollector, ObjectConsumer, PutOptions, PutResponse, PutSource, UploadCollector,
    UploadConsumer,
};
use stratus_transport::{with_deadline, OutboundBody, TransportHandle};
use stratus_xml::scanner::NoXmlVisitor;
use stratus_xml::{scan, ResponseVisitor};

use crate::driver::{AsyncDriver, CompletionEvent, FinishedOp, FinishedPayload, OpKind, PendingOp};
use crate::request::{
    complete_upload_body, create_bucket_body, details_from_parts, CompleteUploadVisitor,
    InitiateUploadVisitor, ListBucketsVisitor, ListObjectsVisitor, ListUploadsVisitor,
};
use crate::url::{self, append_query, UrlBuilder};

const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
const CONTENT_TYPE_XML: &str = "application/xml";

/// Everything needed to format and sign one request.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    verb: http::Method,
    url: String,
    sign_bucket: String,
    sign_key: Option<String>,
    content_type: Option<String>,
    content_md5: Option<String>,
    make_public: bool,
    server_side_encrypt: bool,
    range: Option<Range<u64>>,
    /// Operation subject carried into error messages, usually the key.
    name: String,
}

/// A connection to one storage account.
#[derive(Debug)]
pub struct Connection {
    config: StorageConfig,
    urls: UrlBuilder,
    transport: Option<TransportHandle>,
    pending: Option<PendingOp>,
}

impl Connection {
    /// Create a connection for the given configuration.
    ///
    /// The transport handle is prepared eagerly so a bad TLS or proxy
    /// configuration fails here rather than on the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`StorError::Transport`] for an unusable trust source or
    /// proxy string.
    pub fn new(config: StorageConfig) -> StorResult<Self> {
        let urls = UrlBuilder::new(&config);
        let transport = TransportHandle::new(&config)?;
        Ok(Self {
            config,
            urls,
            transport: Some(transport),
            pending: None,
        })
    }

    /// The base URL requests are composed against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.urls.base()
    }

    // ---------------------------------------------------------------------
    // Bucket operations
    // ---------------------------------------------------------------------

    /// Create a bucket, pinned to the endpoint's region when one is encoded
    /// in the host name.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn create_bucket(&mut self, bucket: &str, make_public: bool) -> StorResult<()> {
        debug!(bucket, make_public, "create_bucket");
        self.create_bucket_inner(bucket, make_public)
            .await
            .map_err(|err| err.summarize("create_bucket", bucket))
    }

    async fn create_bucket_inner(&mut self, bucket: &str, make_public: bool) -> StorResult<()> {
        let body = if self.config.is_walrus {
            Bytes::new()
        } else {
            create_bucket_body(self.urls.region())?
        };

        let (url, _) = self.urls.object_url(bucket, None, None);
        let spec = RequestSpec {
            verb: http::Method::PUT,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key: None,
            content_type: None,
            content_md5: None,
            make_public,
            server_side_encrypt: false,
            range: None,
            name: bucket.to_owned(),
        };

        let mut visitor = NoXmlVisitor;
        let details = self
            .run(spec, OutboundBody::from_bytes(body), &mut visitor, None)
            .await?;
        StorError::check_details(&details)
    }

    /// Delete a bucket.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn delete_bucket(&mut self, bucket: &str) -> StorResult<()> {
        debug!(bucket, "delete_bucket");
        self.del_inner(bucket, "", None)
            .await
            .map_err(|err| err.summarize("delete_bucket", bucket))
    }

    /// List every bucket the account owns.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn list_all_buckets(&mut self) -> StorResult<Vec<Bucket>> {
        debug!("list_all_buckets");
        self.list_all_buckets_inner()
            .await
            .map_err(|err| err.summarize("list_all_buckets", ""))
    }

    async fn list_all_buckets_inner(&mut self) -> StorResult<Vec<Bucket>> {
        let (url, _) = self.urls.object_url("", None, None);
        let spec = RequestSpec {
            verb: http::Method::GET,
            url,
            sign_bucket: String::new(),
            sign_key: None,
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range: None,
            name: String::new(),
        };

        let mut visitor = ListBucketsVisitor::default();
        let details = self
            .run(spec, OutboundBody::empty(), &mut visitor, None)
            .await?;
        StorError::check_details(&details)?;
        Ok(visitor.buckets)
    }

    // ---------------------------------------------------------------------
    // Object operations
    // ---------------------------------------------------------------------

    /// Store an object from an in-memory buffer.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn put(
        &mut self,
        bucket: &str,
        key: &str,
        data: &[u8],
        options: &PutOptions,
    ) -> StorResult<PutResponse> {
        debug!(bucket, key, size = data.len(), "put");
        self.put_bytes(bucket, key, Bytes::copy_from_slice(data), None, options)
            .await
            .map_err(|err| err.summarize("put", key))
    }

    /// Store an object streamed from a source; `total_size` is sent as
    /// `Content-Length` and the source must deliver exactly that many bytes.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn put_streaming(
        &mut self,
        bucket: &str,
        key: &str,
        source: Box<dyn PutSource + Send>,
        total_size: u64,
        options: &PutOptions,
    ) -> StorResult<PutResponse> {
        debug!(bucket, key, total_size, "put_streaming");
        let spec = self.put_spec(bucket, key, None, options);
        let result = async {
            let mut visitor = NoXmlVisitor;
            let details = self
                .run(
                    spec,
                    OutboundBody::from_source(source, total_size),
                    &mut visitor,
                    None,
                )
                .await?;
            finish_put(details)
        }
        .await;
        result.map_err(|err| err.summarize("put", key))
    }

    /// Fetch an object into a sink, optionally restricted to the half-open
    /// byte range `[range.start, range.end)`.
    ///
    /// A missing key is reported as success with
    /// `loaded_content_length == -1`.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn get(
        &mut self,
        bucket: &str,
        key: &str,
        sink: &mut dyn GetSink,
        range: Option<Range<u64>>,
    ) -> StorResult<GetResponse> {
        debug!(bucket, key, range = ?range, "get");
        self.get_inner(bucket, key, sink, range)
            .await
            .map_err(|err| err.summarize("get", key))
    }

    async fn get_inner(
        &mut self,
        bucket: &str,
        key: &str,
        sink: &mut dyn GetSink,
        range: Option<Range<u64>>,
    ) -> StorResult<GetResponse> {
        let (url, sign_key) = self.urls.object_url(bucket, Some(key), None);
        let spec = RequestSpec {
            verb: http::Method::GET,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range,
            name: key.to_owned(),
        };

        let mut visitor = NoXmlVisitor;
        let details = self
            .run(spec, OutboundBody::empty(), &mut visitor, Some(sink))
            .await?;
        finish_get(details)
    }

    /// Fetch an object into a fixed buffer; bytes beyond the buffer set
    /// `is_truncated` and abort the transfer.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn get_into(
        &mut self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        range: Option<Range<u64>>,
    ) -> StorResult<GetResponse> {
        struct SliceSink<'a> {
            buf: &'a mut [u8],
            filled: usize,
        }

        impl GetSink for SliceSink<'_> {
            fn on_load(&mut self, chunk: &[u8], _total_hint: u64) -> usize {
                let left = self.buf.len() - self.filled;
                let to_copy = chunk.len().min(left);
                self.buf[self.filled..self.filled + to_copy].copy_from_slice(&chunk[..to_copy]);
                self.filled += to_copy;
                to_copy
            }
        }

        let mut sink = SliceSink { buf, filled: 0 };
        self.get(bucket, key, &mut sink, range).await
    }

    /// Delete an object. Deleting a missing key is success, also on Walrus.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn del(&mut self, bucket: &str, key: &str) -> StorResult<()> {
        debug!(bucket, key, "del");
        self.del_inner(bucket, key, None)
            .await
            .map_err(|err| err.summarize("del", key))
    }

    async fn del_inner(
        &mut self,
        bucket: &str,
        key: &str,
        suffix: Option<&str>,
    ) -> StorResult<()> {
        let (url, sign_key) = self.urls.object_url(bucket, Some(key), suffix);
        let spec = RequestSpec {
            verb: http::Method::DELETE,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range: None,
            name: key.to_owned(),
        };

        let mut visitor = NoXmlVisitor;
        let details = self
            .run(spec, OutboundBody::empty(), &mut visitor, None)
            .await?;
        finish_del(details)
    }

    /// Delete every object under a prefix, paging with `max_keys_in_batch`
    /// per listing request (0 means the server default).
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn del_all(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        max_keys_in_batch: u32,
    ) -> StorResult<()> {
        debug!(bucket, prefix, "del_all");
        let mut marker = String::new();
        loop {
            let mut batch = ObjectCollector::default();
            let response = self
                .list_objects(
                    bucket,
                    prefix,
                    Some(&marker),
                    None,
                    max_keys_in_batch,
                    &mut batch,
                )
                .await?;

            for object in batch.objects {
                self.del(bucket, &object.key).await?;
            }

            if !response.is_truncated {
                return Ok(());
            }
            marker = response.next_marker;
        }
    }

    // ---------------------------------------------------------------------
    // Listing
    // ---------------------------------------------------------------------

    /// List one page of objects, streaming entries into `consumer`.
    /// `max_keys == 0` leaves the page size to the server.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn list_objects(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: u32,
        consumer: &mut dyn ObjectConsumer,
    ) -> StorResult<ListObjectsResponse> {
        debug!(bucket, prefix, marker, delimiter, max_keys, "list_objects");
        self.list_objects_inner(bucket, prefix, marker, delimiter, max_keys, consumer)
            .await
            .map_err(|err| err.summarize("list_objects", bucket))
    }

    async fn list_objects_inner(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: u32,
        consumer: &mut dyn ObjectConsumer,
    ) -> StorResult<ListObjectsResponse> {
        // Walrus mishandles an empty marker; a single space stands in.
        let marker = if self.config.is_walrus && marker.is_none_or(str::is_empty) {
            Some(" ")
        } else {
            marker
        };

        let (mut fetch_url, _) = self.urls.object_url(bucket, Some(""), None);
        let mut first = true;
        let max_keys_text;
        let max_keys_value = if max_keys == 0 {
            None
        } else {
            max_keys_text = max_keys.to_string();
            Some(max_keys_text.as_str())
        };
        append_query(&mut fetch_url, "delimiter", delimiter, &mut first);
        append_query(&mut fetch_url, "marker", marker, &mut first);
        append_query(&mut fetch_url, "max-keys", max_keys_value, &mut first);
        append_query(&mut fetch_url, "prefix", prefix, &mut first);

        let spec = RequestSpec {
            verb: http::Method::GET,
            url: fetch_url,
            sign_bucket: bucket.to_owned(),
            sign_key: Some(String::new()),
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range: None,
            name: bucket.to_owned(),
        };

        let mut visitor = ListObjectsVisitor::new(consumer, self.config.is_walrus);
        let details = self
            .run(spec, OutboundBody::empty(), &mut visitor, None)
            .await?;
        StorError::check_details(&details)?;

        Ok(ListObjectsResponse {
            next_marker: visitor.next_marker().to_owned(),
            is_truncated: visitor.is_truncated,
        })
    }

    /// Page through `list_objects` until the listing is exhausted.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn list_all_objects(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        max_keys_in_batch: u32,
        consumer: &mut dyn ObjectConsumer,
    ) -> StorResult<()> {
        let mut marker = String::new();
        loop {
            let response = self
                .list_objects(
                    bucket,
                    prefix,
                    Some(&marker),
                    delimiter,
                    max_keys_in_batch,
                    consumer,
                )
                .await?;
            if !response.is_truncated {
                return Ok(());
            }
            marker = response.next_marker;
        }
    }

    // ---------------------------------------------------------------------
    // Multipart upload
    // ---------------------------------------------------------------------

    /// Start a multipart upload and return its upload id.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn initiate_multipart_upload(
        &mut self,
        bucket: &str,
        key: &str,
        options: &PutOptions,
    ) -> StorResult<String> {
        debug_assert!(!self.config.is_walrus, "Walrus has no multipart upload");
        debug!(bucket, key, "initiate_multipart_upload");

        let (url, sign_key) = self.urls.object_url(bucket, Some(key), Some("?uploads"));
        let spec = RequestSpec {
            verb: http::Method::POST,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: Some(
                options
                    .content_type
                    .clone()
                    .unwrap_or_else(|| CONTENT_TYPE_BINARY.to_owned()),
            ),
            content_md5: None,
            make_public: options.make_public,
            server_side_encrypt: options.server_side_encrypt,
            range: None,
            name: key.to_owned(),
        };

        let result = async {
            let mut visitor = InitiateUploadVisitor::default();
            let details = self
                .run(spec, OutboundBody::empty(), &mut visitor, None)
                .await?;
            StorError::check_details(&details)?;
            Ok(visitor.upload_id)
        }
        .await;
        result.map_err(|err: StorError| err.summarize("initiate_multipart_upload", key))
    }

    /// Upload one part. Part numbers start at 1; the ACL and encryption
    /// choices were fixed at initiate time, so none are sent here.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn put_part(
        &mut self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> StorResult<PutResponse> {
        debug_assert!(!self.config.is_walrus, "Walrus has no multipart upload");
        debug_assert!(part_number > 0, "part numbers start at 1");
        debug!(bucket, key, upload_id, part_number, size = data.len(), "put_part");

        self.put_bytes(
            bucket,
            key,
            Bytes::copy_from_slice(data),
            Some((upload_id, part_number)),
            &PutOptions::default(),
        )
        .await
        .map_err(|err| err.summarize("put_part", key))
    }

    /// Finish a multipart upload from the recorded part etags; returns the
    /// etag of the assembled object.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn complete_multipart_upload(
        &mut self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PutResponse],
    ) -> StorResult<String> {
        debug_assert!(!self.config.is_walrus, "Walrus has no multipart upload");
        debug!(bucket, key, upload_id, parts = parts.len(), "complete_multipart_upload");

        let result = async {
            let body = complete_upload_body(parts)?;
            let suffix = format!("?uploadId={upload_id}");
            let (url, sign_key) = self.urls.object_url(bucket, Some(key), Some(&suffix));
            let spec = RequestSpec {
                verb: http::Method::POST,
                url,
                sign_bucket: bucket.to_owned(),
                sign_key,
                content_type: Some(CONTENT_TYPE_BINARY.to_owned()),
                content_md5: None,
                make_public: false,
                server_side_encrypt: false,
                range: None,
                name: key.to_owned(),
            };

            let mut visitor = CompleteUploadVisitor::default();
            let details = self
                .run(spec, OutboundBody::from_bytes(body), &mut visitor, None)
                .await?;
            StorError::check_details(&details)?;
            Ok(visitor.etag)
        }
        .await;
        result.map_err(|err: StorError| err.summarize("complete_multipart_upload", key))
    }

    /// Abort a multipart upload, discarding its parts.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn abort_multipart_upload(
        &mut self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorResult<()> {
        debug_assert!(!self.config.is_walrus, "Walrus has no multipart upload");
        debug!(bucket, key, upload_id, "abort_multipart_upload");

        let suffix = format!("?uploadId={upload_id}");
        self.del_inner(bucket, key, Some(&suffix))
            .await
            .map_err(|err| err.summarize("abort_multipart_upload", key))
    }

    /// List one page of in-progress multipart uploads.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_multipart_uploads(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        key_marker: Option<&str>,
        upload_id_marker: Option<&str>,
        delimiter: Option<&str>,
        max_uploads: u32,
        consumer: &mut dyn UploadConsumer,
    ) -> StorResult<ListUploadsResponse> {
        debug_assert!(!self.config.is_walrus, "Walrus has no multipart upload");
        debug!(bucket, prefix, key_marker, "list_multipart_uploads");

        self.list_multipart_uploads_inner(
            bucket,
            prefix,
            key_marker,
            upload_id_marker,
            delimiter,
            max_uploads,
            consumer,
        )
        .await
        .map_err(|err| err.summarize("list_multipart_uploads", prefix.unwrap_or("")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn list_multipart_uploads_inner(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        key_marker: Option<&str>,
        upload_id_marker: Option<&str>,
        delimiter: Option<&str>,
        max_uploads: u32,
        consumer: &mut dyn UploadConsumer,
    ) -> StorResult<ListUploadsResponse> {
        let mut fetch_url = format!("{}{bucket}/?uploads", self.urls.base());
        // `?uploads` already opened the query string.
        let mut first = false;
        let max_uploads_text;
        let max_uploads_value = if max_uploads == 0 {
            None
        } else {
            max_uploads_text = max_uploads.to_string();
            Some(max_uploads_text.as_str())
        };
        append_query(&mut fetch_url, "delimiter", delimiter, &mut first);
        append_query(&mut fetch_url, "key-marker", key_marker, &mut first);
        append_query(&mut fetch_url, "max-uploads", max_uploads_value, &mut first);
        append_query(&mut fetch_url, "prefix", prefix, &mut first);
        append_query(&mut fetch_url, "upload-id-marker", upload_id_marker, &mut first);

        let spec = RequestSpec {
            verb: http::Method::GET,
            url: fetch_url,
            sign_bucket: bucket.to_owned(),
            sign_key: Some("?uploads".to_owned()),
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range: None,
            name: prefix.unwrap_or("").to_owned(),
        };

        let mut visitor = ListUploadsVisitor::new(consumer);
        let details = self
            .run(spec, OutboundBody::empty(), &mut visitor, None)
            .await?;
        StorError::check_details(&details)?;

        Ok(ListUploadsResponse {
            next_key_marker: visitor.last.key.clone(),
            next_upload_id_marker: visitor.last.upload_id.clone(),
            is_truncated: visitor.is_truncated,
        })
    }

    /// Page through `list_multipart_uploads` until the listing is exhausted.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn list_all_multipart_uploads(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        max_uploads_in_batch: u32,
        consumer: &mut dyn UploadConsumer,
    ) -> StorResult<()> {
        let mut key_marker = String::new();
        let mut upload_id_marker = String::new();
        loop {
            let response = self
                .list_multipart_uploads(
                    bucket,
                    prefix,
                    Some(&key_marker),
                    Some(&upload_id_marker),
                    delimiter,
                    max_uploads_in_batch,
                    consumer,
                )
                .await?;
            if !response.is_truncated {
                return Ok(());
            }
            key_marker = response.next_key_marker;
            upload_id_marker = response.next_upload_id_marker;
        }
    }

    /// Abort every in-progress upload under a prefix.
    ///
    /// # Errors
    ///
    /// Fails with a summary error wrapping the underlying kind.
    pub async fn abort_all_multipart_uploads(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        max_uploads_in_batch: u32,
    ) -> StorResult<()> {
        debug!(bucket, prefix, "abort_all_multipart_uploads");
        let mut key_marker = String::new();
        let mut upload_id_marker = String::new();
        loop {
            let mut batch = UploadCollector::default();
            let response = self
                .list_multipart_uploads(
                    bucket,
                    prefix,
                    Some(&key_marker),
                    Some(&upload_id_marker),
                    None,
                    max_uploads_in_batch,
                    &mut batch,
                )
                .await?;

            for upload in batch.uploads {
                self.abort_multipart_upload(bucket, &upload.key, &upload.upload_id)
                    .await?;
            }

            if !response.is_truncated {
                return Ok(());
            }
            key_marker = response.next_key_marker;
            upload_id_marker = response.next_upload_id_marker;
        }
    }

    // ---------------------------------------------------------------------
    // Pended operations
    // ---------------------------------------------------------------------

    /// Start an asynchronous put on the driver and return immediately.
    ///
    /// # Errors
    ///
    /// Fails when another operation is already pending or the transport
    /// cannot be prepared.
    pub fn pend_put(
        &mut self,
        driver: &AsyncDriver,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        options: &PutOptions,
    ) -> StorResult<()> {
        debug!(bucket, key, size = data.len(), "pend_put");
        let spec = self.put_spec(bucket, key, None, options);
        self.pend(driver, OpKind::Put, spec, move |transport, config, spec| async move {
            let mut transport = transport;
            let mut visitor = NoXmlVisitor;
            let outcome = execute(
                &mut transport,
                &config,
                &spec,
                OutboundBody::from_bytes(Bytes::from(data)),
                &mut visitor,
                None,
            )
            .await;
            FinishedOp {
                transport,
                outcome,
                payload: FinishedPayload::None,
            }
        })
        .map_err(|err| err.summarize("pend_put", key))
    }

    /// Start an asynchronous get into an owned buffer. With an offset the
    /// request carries `Range: bytes=offset-(offset+buf.len()-1)`. The
    /// buffer is handed back by [`Connection::complete_get`].
    ///
    /// # Errors
    ///
    /// Fails when another operation is already pending or the transport
    /// cannot be prepared.
    pub fn pend_get(
        &mut self,
        driver: &AsyncDriver,
        bucket: &str,
        key: &str,
        buf: Vec<u8>,
        offset: Option<u64>,
    ) -> StorResult<()> {
        debug!(bucket, key, size = buf.len(), offset, "pend_get");
        let range = offset.map(|offset| offset..offset + buf.len() as u64);
        let (url, sign_key) = self.urls.object_url(bucket, Some(key), None);
        let spec = RequestSpec {
            verb: http::Method::GET,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range,
            name: key.to_owned(),
        };

        self.pend(driver, OpKind::Get, spec, move |transport, config, spec| async move {
            let mut transport = transport;
            let mut visitor = NoXmlVisitor;
            let mut sink = BufferSink::from_vec(buf);
            let outcome = execute(
                &mut transport,
                &config,
                &spec,
                OutboundBody::empty(),
                &mut visitor,
                Some(&mut sink),
            )
            .await;
            let (buf, _) = sink.into_parts();
            FinishedOp {
                transport,
                outcome,
                payload: FinishedPayload::Buffer(buf),
            }
        })
        .map_err(|err| err.summarize("pend_get", key))
    }

    /// Start an asynchronous delete.
    ///
    /// # Errors
    ///
    /// Fails when another operation is already pending or the transport
    /// cannot be prepared.
    pub fn pend_del(
        &mut self,
        driver: &AsyncDriver,
        bucket: &str,
        key: &str,
    ) -> StorResult<()> {
        debug!(bucket, key, "pend_del");
        let (url, sign_key) = self.urls.object_url(bucket, Some(key), None);
        let spec = RequestSpec {
            verb: http::Method::DELETE,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: None,
            content_md5: None,
            make_public: false,
            server_side_encrypt: false,
            range: None,
            name: key.to_owned(),
        };

        self.pend(driver, OpKind::Del, spec, move |transport, config, spec| async move {
            let mut transport = transport;
            let mut visitor = NoXmlVisitor;
            let outcome = execute(
                &mut transport,
                &config,
                &spec,
                OutboundBody::empty(),
                &mut visitor,
                None,
            )
            .await;
            FinishedOp {
                transport,
                outcome,
                payload: FinishedPayload::None,
            }
        })
        .map_err(|err| err.summarize("pend_del", key))
    }

    fn pend<F, Fut>(
        &mut self,
        driver: &AsyncDriver,
        kind: OpKind,
        spec: RequestSpec,
        task: F,
    ) -> StorResult<()>
    where
        F: FnOnce(TransportHandle, StorageConfig, RequestSpec) -> Fut,
        Fut: std::future::Future<Output = FinishedOp> + Send + 'static,
    {
        if self.pending.is_some() {
            // One outstanding operation per connection.
            return Err(StorError::Unexpected);
        }

        let transport = self.take_transport()?;
        let config = self.config.clone();
        let name = spec.name.clone();
        let event = CompletionEvent::new();
        let task_event = event.clone();

        let future = task(transport, config, spec);
        let task = driver.spawn(async move {
            let finished = future.await;
            task_event.set();
            finished
        });

        self.pending = Some(PendingOp {
            kind,
            name,
            event,
            task,
        });
        Ok(())
    }

    /// Join a pended put.
    ///
    /// # Errors
    ///
    /// Fails when no put is pending, or with the operation's failure.
    pub async fn complete_put(&mut self) -> StorResult<PutResponse> {
        let (name, outcome, _) = self.join_pending(OpKind::Put, "complete_put").await?;
        outcome
            .and_then(finish_put)
            .map_err(|err| err.summarize("complete_put", name))
    }

    /// Join a pended get; returns the response and the buffer passed to
    /// [`Connection::pend_get`].
    ///
    /// # Errors
    ///
    /// Fails when no get is pending, or with the operation's failure.
    pub async fn complete_get(&mut self) -> StorResult<(GetResponse, Vec<u8>)> {
        let (name, outcome, payload) = self.join_pending(OpKind::Get, "complete_get").await?;
        let buf = match payload {
            FinishedPayload::Buffer(buf) => buf,
            FinishedPayload::None => Vec::new(),
        };
        match outcome.and_then(finish_get) {
            Ok(response) => Ok((response, buf)),
            Err(err) => Err(err.summarize("complete_get", name)),
        }
    }

    /// Join a pended delete.
    ///
    /// # Errors
    ///
    /// Fails when no delete is pending, or with the operation's failure.
    pub async fn complete_del(&mut self) -> StorResult<()> {
        let (name, outcome, _) = self.join_pending(OpKind::Del, "complete_del").await?;
        outcome
            .and_then(finish_del)
            .map_err(|err| err.summarize("complete_del", name))
    }

    async fn join_pending(
        &mut self,
        kind: OpKind,
        op: &'static str,
    ) -> StorResult<(String, StorResult<ResponseDetails>, FinishedPayload)> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Err(StorError::Unexpected.summarize(op, "")),
        };
        debug_assert_eq!(pending.kind, kind, "completion does not match the pended verb");

        let name = pending.name;
        match pending.task.await {
            Ok(finished) => {
                // The transport handle comes home with the task.
                self.transport = Some(finished.transport);
                Ok((name, finished.outcome, finished.payload))
            }
            Err(_) => Err(StorError::Unexpected.summarize(op, name)),
        }
    }

    /// Abort a pended operation. Infallible, and a no-op when nothing is
    /// pending; the connection stays usable and re-dials on the next
    /// operation.
    pub fn cancel_async(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(name = %pending.name, "cancel_async");
            pending.task.abort();
        }
    }

    /// Whether a pended operation is outstanding.
    #[must_use]
    pub fn is_async_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the outstanding pended operation has finished.
    #[must_use]
    pub fn is_async_completed(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.event.is_set())
    }

    pub(crate) fn completion_event(&self) -> Option<CompletionEvent> {
        self.pending.as_ref().map(|pending| pending.event.clone())
    }

    // ---------------------------------------------------------------------
    // Shared machinery
    // ---------------------------------------------------------------------

    fn take_transport(&mut self) -> StorResult<TransportHandle> {
        match self.transport.take() {
            Some(handle) => Ok(handle),
            // The previous handle left with a cancelled operation.
            None => TransportHandle::new(&self.config),
        }
    }

    fn put_spec(
        &self,
        bucket: &str,
        key: &str,
        upload: Option<(&str, u32)>,
        options: &PutOptions,
    ) -> RequestSpec {
        let suffix = upload.map(|(upload_id, part_number)| {
            format!("?partNumber={part_number}&uploadId={upload_id}")
        });
        let (url, sign_key) = self.urls.object_url(bucket, Some(key), suffix.as_deref());

        RequestSpec {
            verb: http::Method::PUT,
            url,
            sign_bucket: bucket.to_owned(),
            sign_key,
            content_type: Some(
                options
                    .content_type
                    .clone()
                    .unwrap_or_else(|| CONTENT_TYPE_BINARY.to_owned()),
            ),
            content_md5: options.content_md5.clone(),
            make_public: options.make_public,
            server_side_encrypt: options.server_side_encrypt,
            range: None,
            name: key.to_owned(),
        }
    }

    async fn put_bytes(
        &mut self,
        bucket: &str,
        key: &str,
        data: Bytes,
        upload: Option<(&str, u32)>,
        options: &PutOptions,
    ) -> StorResult<PutResponse> {
        let part_number = upload.map_or(0, |(_, part_number)| part_number);
        let spec = self.put_spec(bucket, key, upload, options);

        let mut visitor = NoXmlVisitor;
        let details = self
            .run(spec, OutboundBody::from_bytes(data), &mut visitor, None)
            .await?;
        let mut response = finish_put(details)?;
        response.part_number = part_number;
        Ok(response)
    }

    async fn run(
        &mut self,
        spec: RequestSpec,
        body: OutboundBody,
        visitor: &mut dyn ResponseVisitor,
        sink: Option<&mut dyn GetSink>,
    ) -> StorResult<ResponseDetails> {
        debug_assert!(self.pending.is_none(), "an async operation is outstanding");

        let mut transport = self.take_transport()?;
        let result = execute(&mut transport, &self.config, &spec, body, visitor, sink).await;
        self.transport = Some(transport);
        result
    }
}

/// Run one request over the handle under the operation deadline.
pub(crate) async fn execute(
    transport: &mut TransportHandle,
    config: &StorageConfig,
    spec: &RequestSpec,
    body: OutboundBody,
    visitor: &mut dyn ResponseVisitor,
    sink: Option<&mut dyn GetSink>,
) -> StorResult<ResponseDetails> {
    let timeout = transport.total_timeout();
    let result = with_deadline(
        timeout,
        run_request(transport, config, spec, body, visitor, sink),
    )
    .await;

    if result.is_err() {
        // The connection state after a failed or timed-out transfer is
        // unknown; the next operation re-dials.
        transport.invalidate();
    }
    result
}

async fn run_request(
    transport: &mut TransportHandle,
    config: &StorageConfig,
    spec: &RequestSpec,
    body: OutboundBody,
    visitor: &mut dyn ResponseVisitor,
    sink: Option<&mut dyn GetSink>,
) -> StorResult<ResponseDetails> {
    let request = build_request(transport, config, spec, body)?;
    debug!(verb = %spec.verb, url = %spec.url, "sending request");

    let response = transport.send(request).await?;
    let (parts, incoming) = response.into_parts();

    let mut details = details_from_parts(&spec.name, &spec.url, &parts);
    consume_body(transport, &mut details, visitor, sink, incoming).await?;
    Ok(details)
}

fn build_request(
    transport: &TransportHandle,
    config: &StorageConfig,
    spec: &RequestSpec,
    body: OutboundBody,
) -> StorResult<http::Request<OutboundBody>> {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    let authorization = stratus_auth::authorization_header(
        &config.access_key,
        &config.secret_key,
        &SignParams {
            verb: spec.verb.as_str(),
            content_md5: spec.content_md5.as_deref(),
            content_type: spec.content_type.as_deref(),
            date: &date,
            make_public: spec.make_public,
            server_side_encrypt: spec.server_side_encrypt,
            bucket: Some(spec.sign_bucket.as_str()),
            key: spec.sign_key.as_deref(),
            is_walrus: config.is_walrus,
        },
    );

    // Proxied plain-HTTP requests carry the absolute URL as the target.
    let target = if transport.uses_absolute_form() {
        spec.url.clone()
    } else {
        url::path_and_query(&spec.url).to_owned()
    };

    let mut host = config.effective_host().to_owned();
    if let Some(port) = config.url_port() {
        host.push(':');
        host.push_str(&port.to_string());
    }

    let has_body = spec.verb == http::Method::PUT || spec.verb == http::Method::POST;
    let content_length = body.content_length();

    let mut builder = http::Request::builder()
        .method(spec.verb.clone())
        .version(http::Version::HTTP_10)
        .uri(target)
        .header(header::HOST, host);

    if let Some(content_md5) = &spec.content_md5 {
        builder = builder.header("Content-MD5", content_md5.as_str());
    }
    if let Some(content_type) = &spec.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type.as_str());
    }
    builder = builder.header(header::DATE, date.as_str());
    if spec.make_public {
        builder = builder.header("x-amz-acl", "public-read");
    }
    if spec.server_side_encrypt {
        builder = builder.header("x-amz-server-side-encryption", "AES256");
    }
    if let Some(range) = &spec.range {
        debug_assert!(range.end > range.start, "empty byte range");
        builder = builder.header(
            header::RANGE,
            format!("bytes={}-{}", range.start, range.end - 1),
        );
    }
    builder = builder
        .header(header::AUTHORIZATION, authorization)
        .header(header::CONNECTION, "Keep-Alive");
    if has_body {
        builder = builder.header(header::CONTENT_LENGTH, content_length);
    }

    builder.body(body).map_err(|_| StorError::Unexpected)
}

async fn consume_body(
    transport: &mut TransportHandle,
    details: &mut ResponseDetails,
    visitor: &mut dyn ResponseVisitor,
    sink: Option<&mut dyn GetSink>,
    body: Incoming,
) -> StorResult<()> {
    let success = details.status == ResponseStatus::Success;

    if success && visitor.expects_xml() {
        return scan_xml_body(body, visitor, details).await;
    }

    if success {
        if let Some(sink) = sink {
            return load_binary_body(transport, details, sink, body).await;
        }
    } else if details.http_content_length != 0 && details.http_content_type == CONTENT_TYPE_XML {
        // Error conditions may carry details in an XML envelope.
        let mut envelope = NoXmlVisitor;
        return scan_xml_body(body, &mut envelope, details).await;
    }

    drain_body(transport, body).await;
    Ok(())
}

async fn scan_xml_body(
    body: Incoming,
    visitor: &mut dyn ResponseVisitor,
    details: &mut ResponseDetails,
) -> StorResult<()> {
    let stream = BodyStream::new(body).map(|frame| match frame {
        Ok(frame) => Ok(frame.into_data().unwrap_or_default()),
        Err(err) => Err(std::io::Error::other(err)),
    });

    scan(StreamReader::new(stream), visitor, details)
        .await
        .map_err(stratus_xml::ScanError::into_stor_error)
}

async fn load_binary_body(
    transport: &mut TransportHandle,
    details: &mut ResponseDetails,
    sink: &mut dyn GetSink,
    body: Incoming,
) -> StorResult<()> {
    let hint = u64::try_from(details.http_content_length).unwrap_or(0);
    let mut stream = BodyStream::new(body);

    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|err| StorError::Transport(err.to_string()))?;
        let Some(chunk) = frame.data_ref() else { continue };
        if chunk.is_empty() {
            continue;
        }

        let accepted = sink.on_load(chunk, hint).min(chunk.len());
        details.loaded_content_length += accepted as i64;

        if accepted < chunk.len() {
            // The sink refused bytes: the transfer is truncated and the rest
            // of the response is abandoned along with the connection.
            details.is_truncated = true;
            drop(stream);
            transport.invalidate();
            return Ok(());
        }
    }

    Ok(())
}

async fn drain_body(transport: &mut TransportHandle, body: Incoming) {
    let mut stream = BodyStream::new(body);
    while let Some(frame) = stream.next().await {
        if frame.is_err() {
            drop(stream);
            transport.invalidate();
            return;
        }
    }
}

fn finish_put(details: ResponseDetails) -> StorResult<PutResponse> {
    StorError::check_details(&details)?;
    Ok(PutResponse {
        etag: details.etag,
        part_number: 0,
    })
}

fn finish_get(mut details: ResponseDetails) -> StorResult<GetResponse> {
    // A missing key is success with a sentinel length: NoSuchKey from
    // Amazon, NoSuchEntity from Walrus.
    if details.status == ResponseStatus::FailureWithDetails
        && (details.error_code == "NoSuchKey" || details.error_code == "NoSuchEntity")
    {
        details.status = ResponseStatus::Success;
        details.loaded_content_length = -1;
    }

    StorError::check_details(&details)?;
    Ok(GetResponse {
        loaded_content_length: details.loaded_content_length,
        is_truncated: details.is_truncated,
        etag: details.etag,
    })
}

fn finish_del(mut details: ResponseDetails) -> StorResult<()> {
    // Walrus reports deleting a missing key as NoSuchEntity; Amazon treats
    // that as success, so align the two.
    if details.status == ResponseStatus::FailureWithDetails && details.error_code == "NoSuchEntity"
    {
        details.status = ResponseStatus::Success;
    }
    StorError::check_details(&details)
}
