//! Public data model and payload callbacks.
//!
//! Listing operations stream entries into an [`ObjectConsumer`] /
//! [`UploadConsumer`] so that arbitrarily large result sets never have to be
//! buffered; `Vec`-collecting conveniences are layered on top by the client.
//!
//! Transfer payloads flow through [`GetSink`] and [`PutSource`]. Both are
//! infallible by construction: they report how many bytes they accepted or
//! produced, and a short return aborts the transfer without unwinding through
//! the HTTP engine.

use serde::{Deserialize, Serialize};

/// A bucket owned by the account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name.
    pub name: String,
    /// Creation date, as the server reported it.
    pub creation_date: String,
}

/// One entry from a list-objects response.
///
/// A synthetic directory entry (from `<CommonPrefixes>`) has `is_dir = true`
/// and `size = -1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Last-modified timestamp, as the server reported it.
    pub last_modified: String,
    /// ETag without surrounding quotes.
    pub etag: String,
    /// Object size in bytes; -1 for a synthetic directory entry.
    pub size: i64,
    /// Whether this entry is a synthetic directory.
    pub is_dir: bool,
}

impl Default for ObjectSummary {
    fn default() -> Self {
        Self {
            key: String::new(),
            last_modified: String::new(),
            etag: String::new(),
            size: 0,
            is_dir: false,
        }
    }
}

/// One entry from a list-multipart-uploads response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    /// Object key the upload targets.
    pub key: String,
    /// Server-assigned upload id.
    pub upload_id: String,
    /// Whether this entry is a synthetic directory.
    pub is_dir: bool,
}

/// Response of a put or put-part operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// ETag of the stored object or part, without surrounding quotes.
    pub etag: String,
    /// Part number; meaningful only for part uploads.
    pub part_number: u32,
}

/// Response of a get operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    /// Bytes accepted by the sink; -1 means the key does not exist.
    pub loaded_content_length: i64,
    /// True when the sink refused part of the body.
    pub is_truncated: bool,
    /// ETag of the object, without surrounding quotes.
    pub etag: String,
}

impl GetResponse {
    /// Whether the key was missing (treated as success with a sentinel).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.loaded_content_length == -1
    }
}

/// Pagination state of a list-objects response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListObjectsResponse {
    /// Marker to pass to the next page request.
    pub next_marker: String,
    /// True when more results are available.
    pub is_truncated: bool,
}

/// Pagination state of a list-multipart-uploads response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUploadsResponse {
    /// Key marker to pass to the next page request.
    pub next_key_marker: String,
    /// Upload-id marker to pass to the next page request.
    pub next_upload_id_marker: String,
    /// True when more results are available.
    pub is_truncated: bool,
}

/// Options shared by put-style operations.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Request a `public-read` canned ACL.
    pub make_public: bool,
    /// Request AES256 server-side encryption.
    pub server_side_encrypt: bool,
    /// Content-Type header; defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// Optional precomputed Content-MD5 header value.
    pub content_md5: Option<String>,
}

/// Receives one listed object at a time; return `false` to stop the listing.
pub trait ObjectConsumer: Send {
    /// Called for every object or synthetic directory entry.
    fn on_object(&mut self, object: ObjectSummary) -> bool;
}

impl<F: FnMut(ObjectSummary) -> bool + Send> ObjectConsumer for F {
    fn on_object(&mut self, object: ObjectSummary) -> bool {
        self(object)
    }
}

/// An [`ObjectConsumer`] that collects every entry into a vector.
#[derive(Debug, Default)]
pub struct ObjectCollector {
    /// The collected entries, in listing order.
    pub objects: Vec<ObjectSummary>,
}

impl ObjectConsumer for ObjectCollector {
    fn on_object(&mut self, object: ObjectSummary) -> bool {
        self.objects.push(object);
        true
    }
}

/// Receives one listed multipart upload at a time; return `false` to stop.
pub trait UploadConsumer: Send {
    /// Called for every in-progress upload or synthetic directory entry.
    fn on_upload(&mut self, upload: MultipartUpload) -> bool;
}

impl<F: FnMut(MultipartUpload) -> bool + Send> UploadConsumer for F {
    fn on_upload(&mut self, upload: MultipartUpload) -> bool {
        self(upload)
    }
}

/// An [`UploadConsumer`] that collects every entry into a vector.
#[derive(Debug, Default)]
pub struct UploadCollector {
    /// The collected entries, in listing order.
    pub uploads: Vec<MultipartUpload>,
}

impl UploadConsumer for UploadCollector {
    fn on_upload(&mut self, upload: MultipartUpload) -> bool {
        self.uploads.push(upload);
        true
    }
}

/// Receives response body bytes in bounded chunks.
///
/// Returns the number of bytes accepted. Accepting fewer bytes than offered
/// marks the transfer truncated and aborts it.
pub trait GetSink: Send {
    /// Handle one chunk. `total_hint` is the HTTP Content-Length when known,
    /// 0 otherwise.
    fn on_load(&mut self, chunk: &[u8], total_hint: u64) -> usize;
}

/// Produces request body bytes in bounded chunks.
///
/// Fills `buf` and returns the number of bytes written; returning 0 before
/// the announced total size aborts the transfer.
pub trait PutSource {
    /// Produce the next chunk into `buf`.
    fn on_upload(&mut self, buf: &mut [u8]) -> usize;
}

/// A [`GetSink`] that copies into an owned buffer and drops the rest.
#[derive(Debug)]
pub struct BufferSink {
    buf: Vec<u8>,
    filled: usize,
}

impl BufferSink {
    /// Create a sink with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            filled: 0,
        }
    }

    /// Wrap an existing buffer; its length is the sink's capacity.
    #[must_use]
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, filled: 0 }
    }

    /// The filled prefix of the buffer.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Consume the sink, returning the backing buffer and the filled length.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, usize) {
        (self.buf, self.filled)
    }
}

impl GetSink for BufferSink {
    fn on_load(&mut self, chunk: &[u8], total_hint: u64) -> usize {
        let left = self.buf.len() - self.filled;
        if left == 0 {
            return 0;
        }

        let to_copy = chunk.len().min(left);
        self.buf[self.filled..self.filled + to_copy].copy_from_slice(&chunk[..to_copy]);
        self.filled += to_copy;

        tracing::trace!(left = left - to_copy, hint = total_hint, "sink accepted chunk");

        to_copy
    }
}

/// A [`PutSource`] that reads out of an in-memory buffer.
#[derive(Debug)]
pub struct BufferSource {
    data: Vec<u8>,
    offset: usize,
}

impl BufferSource {
    /// Create a source over the given bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    /// Total number of bytes this source will produce.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the source is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PutSource for BufferSource {
    fn on_upload(&mut self, buf: &mut [u8]) -> usize {
        let left = self.data.len() - self.offset;
        let to_copy = buf.len().min(left);

        buf[..to_copy].copy_from_slice(&self.data[self.offset..self.offset + to_copy]);
        self.offset += to_copy;

        tracing::trace!(offset = self.offset, total = self.data.len(), "source produced chunk");

        to_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_fill_buffer_sink_and_truncate() {
        let mut sink = BufferSink::new(4);
        assert_eq!(sink.on_load(b"ab", 6), 2);
        // The second chunk overflows the buffer; only part of it is accepted.
        assert_eq!(sink.on_load(b"cdef", 6), 2);
        assert_eq!(sink.bytes(), b"abcd");
        // A full sink accepts nothing.
        assert_eq!(sink.on_load(b"gh", 6), 0);
    }

    #[test]
    fn test_should_drain_buffer_source_in_chunks() {
        let mut source = BufferSource::new(b"FOObar".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(source.on_upload(&mut buf), 4);
        assert_eq!(&buf, b"FOOb");
        assert_eq!(source.on_upload(&mut buf), 2);
        assert_eq!(&buf[..2], b"ar");
        assert_eq!(source.on_upload(&mut buf), 0);
    }

    #[test]
    fn test_should_collect_objects_with_collector() {
        let mut collector = ObjectCollector::default();
        let entry = ObjectSummary {
            key: "tmp/a".to_owned(),
            size: 3,
            ..ObjectSummary::default()
        };
        assert!(collector.on_object(entry.clone()));
        assert_eq!(collector.objects, vec![entry]);
    }

    #[test]
    fn test_should_stop_listing_from_closure_consumer() {
        let mut stop = |_: ObjectSummary| false;
        assert!(!stop.on_object(ObjectSummary::default()));
    }

    #[test]
    fn test_should_detect_missing_key_sentinel() {
        let response = GetResponse {
            loaded_content_length: -1,
            ..GetResponse::default()
        };
        assert!(response.is_not_found());
        assert!(!GetResponse::default().is_not_found());
    }
}
