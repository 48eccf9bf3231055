//! S3/Walrus client with pipelined asynchronous I/O.
//!
//! A [`Connection`] binds one keep-alive transport handle to one storage
//! account and exposes the object, bucket, and multipart operations. Many
//! connections can be driven concurrently through an [`AsyncDriver`]:
//! `pend_*` starts an operation and returns immediately, [`wait_any`]
//! selects a completed connection, and `complete_*` joins the result, so a
//! single task can keep dozens of transfers in flight and saturate the link.
//!
//! ```no_run
//! use stratus_client::{Connection, StorageConfig};
//!
//! # async fn demo() -> stratus_core::StorResult<()> {
//! let config = StorageConfig::from_env();
//! let mut connection = Connection::new(config)?;
//!
//! connection.put("logs", "day/part-0", b"payload", &Default::default()).await?;
//! let mut buf = vec![0u8; 16];
//! let response = connection.get_into("logs", "day/part-0", &mut buf, None).await?;
//! assert_eq!(response.loaded_content_length, 7);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`url`] - Base URL composition, key escaping, query parameters
//! - [`request`] - Per-operation response visitors and request bodies
//! - [`connection`] - The connection and its operation surface
//! - [`driver`] - The async driver, completion events, and `wait_any`

pub mod connection;
pub mod driver;
pub mod request;
pub mod url;

pub use connection::Connection;
pub use driver::{wait_any, AsyncDriver, MAX_WAIT_ANY};
pub use url::UrlBuilder;

pub use stratus_core::{
    Bucket, BufferSink, BufferSource, CaCerts, GetResponse, GetSink, ListObjectsResponse,
    ListUploadsResponse, MultipartUpload, ObjectCollector, ObjectConsumer, ObjectSummary,
    PutOptions, PutResponse, PutSource, StorError, StorResult, StorageConfig, UploadCollector,
    UploadConsumer,
};
