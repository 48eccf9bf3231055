//! Core types for the stratus S3/Walrus client.
//!
//! This crate carries everything the other stratus crates share: connection
//! configuration, the public data model (buckets, objects, multipart uploads,
//! operation responses), the payload sink/source traits, the per-request
//! [`ResponseDetails`] with its outcome classification, and the
//! [`StorError`] taxonomy.
//!
//! # Modules
//!
//! - [`config`] - Connection configuration and CA certificate source
//! - [`types`] - Public data model and payload sink/source traits
//! - [`response`] - Per-request response details and outcome classification
//! - [`error`] - The error taxonomy surfaced by every operation

pub mod config;
pub mod error;
pub mod response;
pub mod types;

pub use config::{CaCerts, StorageConfig};
pub use error::{StorError, StorResult};
pub use response::{ResponseDetails, ResponseStatus};
pub use types::{
    Bucket, BufferSink, BufferSource, GetResponse, GetSink, ListObjectsResponse,
    ListUploadsResponse, MultipartUpload, ObjectCollector, ObjectConsumer, ObjectSummary,
    PutOptions, PutResponse, PutSource, UploadCollector, UploadConsumer,
};
