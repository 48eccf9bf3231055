//! AWS Signature Version 2 request signing for stratus.
//!
//! SigV2 is the legacy S3 signing mechanism based on HMAC-SHA1. The
//! `Authorization` header has the format:
//!
//! ```text
//! AWS <AWSAccessKeyId>:<Signature>
//! ```
//!
//! Where `Signature = Base64(HMAC-SHA1(SecretKey, StringToSign))`. This crate
//! implements the signing side: given the parts of an outgoing request, it
//! produces the header value the server will verify.

pub mod sigv2;

pub use sigv2::{authorization_header, string_to_sign, SignParams};
