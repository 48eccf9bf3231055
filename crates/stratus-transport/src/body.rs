//! The streaming outbound request body.
//!
//! Upload payloads are pulled from a [`PutSource`] in bounded chunks, so a
//! part of any size streams through a fixed amount of memory. The body
//! advertises an exact size; together with HTTP/1.0 framing this guarantees
//! a plain `Content-Length` upload with no chunked transfer-encoding.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use stratus_core::types::PutSource;

/// Upload chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

enum Kind {
    Empty,
    Buffer(Bytes),
    Source {
        source: Box<dyn PutSource + Send>,
        remaining: u64,
    },
}

/// Request body for an outgoing operation.
pub struct OutboundBody {
    kind: Kind,
    total: u64,
}

impl OutboundBody {
    /// An empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            kind: Kind::Empty,
            total: 0,
        }
    }

    /// A body emitting the given bytes.
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        let total = data.len() as u64;
        Self {
            kind: Kind::Buffer(data),
            total,
        }
    }

    /// A body pulling `total` bytes from the source in bounded chunks.
    #[must_use]
    pub fn from_source(source: Box<dyn PutSource + Send>, total: u64) -> Self {
        Self {
            kind: Kind::Source { source, remaining: total },
            total,
        }
    }

    /// The exact number of bytes this body will produce, for the
    /// `Content-Length` header.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.total
    }
}

impl std::fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Empty => f.debug_struct("OutboundBody::Empty").finish(),
            Kind::Buffer(data) => f
                .debug_struct("OutboundBody::Buffer")
                .field("len", &data.len())
                .finish(),
            Kind::Source { remaining, .. } => f
                .debug_struct("OutboundBody::Source")
                .field("total", &self.total)
                .field("remaining", remaining)
                .finish(),
        }
    }
}

impl Body for OutboundBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match &mut this.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Buffer(data) => {
                if data.is_empty() {
                    Poll::Ready(None)
                } else {
                    let chunk = std::mem::take(data);
                    Poll::Ready(Some(Ok(Frame::data(chunk))))
                }
            }
            Kind::Source { source, remaining } => {
                if *remaining == 0 {
                    return Poll::Ready(None);
                }

                let want = CHUNK_SIZE.min(usize::try_from(*remaining).unwrap_or(CHUNK_SIZE));
                let mut buf = vec![0u8; want];
                let written = source.on_upload(&mut buf);

                if written == 0 {
                    // The source announced more bytes than it produced;
                    // aborting beats sending a short body the server would
                    // wait on.
                    return Poll::Ready(Some(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "upload source ended before the announced size",
                    ))));
                }

                let written = written.min(want);
                buf.truncate(written);
                *remaining -= written as u64;
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(buf)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Buffer(data) => data.is_empty(),
            Kind::Source { remaining, .. } => *remaining == 0,
        }
    }

    fn size_hint(&self) -> SizeHint {
        let left = match &self.kind {
            Kind::Empty => 0,
            Kind::Buffer(data) => data.len() as u64,
            Kind::Source { remaining, .. } => *remaining,
        };
        SizeHint::with_exact(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use stratus_core::types::BufferSource;

    struct ShortSource {
        produced: bool,
    }

    impl PutSource for ShortSource {
        fn on_upload(&mut self, buf: &mut [u8]) -> usize {
            if self.produced {
                0
            } else {
                self.produced = true;
                buf[..3].copy_from_slice(b"abc");
                3
            }
        }
    }

    #[tokio::test]
    async fn test_should_emit_buffer_in_one_frame() {
        let body = OutboundBody::from_bytes(Bytes::from_static(b"FOObar"));
        assert_eq!(body.content_length(), 6);
        let collected = body.collect().await.expect("collect");
        assert_eq!(collected.to_bytes().as_ref(), b"FOObar");
    }

    #[tokio::test]
    async fn test_should_stream_source_to_announced_size() {
        let data = vec![0x5a; 200 * 1024];
        let source = BufferSource::new(data.clone());
        let body = OutboundBody::from_source(Box::new(source), data.len() as u64);
        assert_eq!(body.content_length(), data.len() as u64);

        let collected = body.collect().await.expect("collect");
        assert_eq!(collected.to_bytes().len(), data.len());
    }

    #[tokio::test]
    async fn test_should_fail_when_source_ends_early() {
        let body = OutboundBody::from_source(Box::new(ShortSource { produced: false }), 10);
        let err = body.collect().await.expect_err("source under-delivers");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_should_advertise_exact_size() {
        let body = OutboundBody::empty();
        assert!(body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(0));

        let body = OutboundBody::from_bytes(Bytes::from_static(b"xy"));
        assert!(!body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(2));
    }
}
