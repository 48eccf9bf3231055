//! The scan loop driving a [`ResponseVisitor`] over a streaming XML body.
//!
//! The scanner consumes the body incrementally through an async buffered
//! reader, so chunks are parsed as they arrive from the socket and nothing
//! larger than one XML event is ever buffered. The standard S3 `<Error>`
//! envelope (`<Code>`, `<Message>`, `<RequestId>`, `<HostId>` at depth two)
//! is extracted here for every operation; any populated field upgrades the
//! response classification to a detailed failure.

use quick_xml::events::Event;
use quick_xml::Reader;
use stratus_core::error::StorError;
use stratus_core::response::ResponseDetails;
use tokio::io::AsyncBufRead;
use tracing::trace;

use crate::tags::{ResponseTag, TagStack};

/// Failures of the XML scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Malformed XML from the underlying parser, or a body read error.
    #[error("XML processing error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// The document nests deeper than the fixed stack allows.
    #[error("element nesting exceeds the supported depth")]
    DepthExceeded,

    /// An end tag arrived with no matching start tag.
    #[error("unbalanced element nesting")]
    Unbalanced,

    /// A visitor hook stopped the scan.
    #[error("visitor stopped the scan")]
    Stopped,
}

impl ScanError {
    /// Map a scan failure onto the public taxonomy: body read failures are
    /// transport errors, everything else is a parser error.
    #[must_use]
    pub fn into_stor_error(self) -> StorError {
        match self {
            Self::Xml(quick_xml::Error::Io(err)) => StorError::Transport(err.to_string()),
            _ => StorError::Parser,
        }
    }
}

/// Per-operation hooks the scan dispatches to.
///
/// `on_end` runs while the closing element is still on the stack, matching
/// the order the stack-based field dispatch expects. Returning `false` from
/// any hook aborts the scan (and with it the transfer).
pub trait ResponseVisitor: Send {
    /// Whether a successful response body is XML for this operation.
    fn expects_xml(&self) -> bool {
        false
    }

    /// An element opened.
    fn on_start(&mut self, _stack: &TagStack) -> bool {
        true
    }

    /// Text content arrived for the innermost element.
    fn on_text(&mut self, _stack: &TagStack, _text: &str) -> bool {
        true
    }

    /// The innermost element is closing.
    fn on_end(&mut self, _stack: &TagStack) -> bool {
        true
    }
}

/// A visitor for operations whose success body is opaque or empty.
#[derive(Debug, Default)]
pub struct NoXmlVisitor;

impl ResponseVisitor for NoXmlVisitor {}

/// Fill the shared `<Error>` envelope fields and upgrade the classification.
fn apply_error_envelope(stack: &TagStack, text: &str, details: &mut ResponseDetails) {
    if stack.depth() != 2 || stack.at(0) != ResponseTag::Error {
        return;
    }

    match stack.at(1) {
        ResponseTag::Code => details.error_code = text.to_owned(),
        ResponseTag::Message => details.error_message = text.to_owned(),
        ResponseTag::RequestId => details.request_id = text.to_owned(),
        ResponseTag::HostId => details.host_id = text.to_owned(),
        _ => {}
    }

    details.upgrade_to_detailed_failure();
}

/// Scan an XML body, dispatching to `visitor` and filling the error envelope
/// fields of `details`.
///
/// # Errors
///
/// Returns a [`ScanError`] on malformed XML, a body read failure, nesting
/// beyond the fixed depth, or a visitor that stopped the scan.
pub async fn scan<R>(
    reader: R,
    visitor: &mut dyn ResponseVisitor,
    details: &mut ResponseDetails,
) -> Result<(), ScanError>
where
    R: AsyncBufRead + Unpin,
{
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut stack = TagStack::default();
    let mut buf = Vec::with_capacity(4 * 1024);

    loop {
        let event = xml.read_event_into_async(&mut buf).await?;
        match event {
            Event::Start(e) => {
                let tag = ResponseTag::lookup(e.local_name().as_ref());
                if !stack.push(tag) {
                    return Err(ScanError::DepthExceeded);
                }
                trace!(tag = tag.name(), depth = stack.depth(), "element start");
                if !visitor.on_start(&stack) {
                    return Err(ScanError::Stopped);
                }
            }
            Event::Empty(e) => {
                let tag = ResponseTag::lookup(e.local_name().as_ref());
                if !stack.push(tag) {
                    return Err(ScanError::DepthExceeded);
                }
                if !visitor.on_start(&stack) || !visitor.on_end(&stack) {
                    return Err(ScanError::Stopped);
                }
                if !stack.pop() {
                    return Err(ScanError::Unbalanced);
                }
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                apply_error_envelope(&stack, &text, details);
                if !visitor.on_text(&stack, &text) {
                    return Err(ScanError::Stopped);
                }
            }
            Event::End(_) => {
                if stack.depth() == 0 {
                    return Err(ScanError::Unbalanced);
                }
                if !visitor.on_end(&stack) {
                    return Err(ScanError::Stopped);
                }
                if !stack.pop() {
                    return Err(ScanError::Unbalanced);
                }
            }
            Event::Eof => return Ok(()),
            // Declarations, comments, processing instructions, CDATA.
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::response::ResponseStatus;
    use tokio::io::AsyncWriteExt;

    /// Records the (depth, tag, text) triples the scan produced.
    #[derive(Debug, Default)]
    struct RecordingVisitor {
        texts: Vec<(usize, ResponseTag, String)>,
        stop_on: Option<ResponseTag>,
    }

    impl ResponseVisitor for RecordingVisitor {
        fn expects_xml(&self) -> bool {
            true
        }

        fn on_text(&mut self, stack: &TagStack, text: &str) -> bool {
            let top = stack.top().expect("text inside an element");
            if self.stop_on == Some(top) {
                return false;
            }
            self.texts.push((stack.depth(), top, text.to_owned()));
            true
        }
    }

    async fn scan_bytes(
        xml: &str,
        visitor: &mut dyn ResponseVisitor,
        details: &mut ResponseDetails,
    ) -> Result<(), ScanError> {
        scan(xml.as_bytes(), visitor, details).await
    }

    #[tokio::test]
    async fn test_should_dispatch_text_with_stack_context() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <InitiateMultipartUploadResult>
              <Bucket>b</Bucket>
              <Key>k</Key>
              <UploadId>VXBsb2FkSWQ</UploadId>
            </InitiateMultipartUploadResult>"#;

        let mut visitor = RecordingVisitor::default();
        let mut details = ResponseDetails::default();
        scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect("scan");

        assert_eq!(
            visitor.texts,
            vec![
                (2, ResponseTag::Bucket, "b".to_owned()),
                (2, ResponseTag::Key, "k".to_owned()),
                (2, ResponseTag::UploadId, "VXBsb2FkSWQ".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_should_fill_error_envelope_and_upgrade() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <Error>
              <Code>NoSuchKey</Code>
              <Message>The specified key does not exist.</Message>
              <RequestId>4442587FB7D0A2F9</RequestId>
              <HostId>aGlkZGVu</HostId>
            </Error>"#;

        let mut visitor = NoXmlVisitor;
        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::HttpResourceNotFound;
        scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect("scan");

        assert_eq!(details.error_code, "NoSuchKey");
        assert_eq!(details.error_message, "The specified key does not exist.");
        assert_eq!(details.request_id, "4442587FB7D0A2F9");
        assert_eq!(details.host_id, "aGlkZGVu");
        assert_eq!(details.status, ResponseStatus::FailureWithDetails);
    }

    #[tokio::test]
    async fn test_should_ignore_error_fields_outside_envelope_depth() {
        // <Code> nested deeper than <Error>/<Code> must not populate the
        // envelope.
        let xml = "<Result><Inner><Code>NotAnError</Code></Inner></Result>";

        let mut visitor = NoXmlVisitor;
        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::HttpOrAwsFailure;
        scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect("scan");

        assert!(details.error_code.is_empty());
        assert_eq!(details.status, ResponseStatus::HttpOrAwsFailure);
    }

    #[tokio::test]
    async fn test_should_fail_on_depth_overflow() {
        let xml = "<a><b><c><d><e><f><g><h><i>deep</i></h></g></f></e></d></c></b></a>";

        let mut visitor = NoXmlVisitor;
        let mut details = ResponseDetails::default();
        let err = scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect_err("nesting beyond the stack");
        assert!(matches!(err, ScanError::DepthExceeded));
        assert!(matches!(err.into_stor_error(), StorError::Parser));
    }

    #[tokio::test]
    async fn test_should_fail_on_malformed_xml() {
        let xml = "<Result><Key>unclosed";

        let mut visitor = NoXmlVisitor;
        let mut details = ResponseDetails::default();
        let err = scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect_err("truncated document");
        assert!(matches!(err.into_stor_error(), StorError::Parser));
    }

    #[tokio::test]
    async fn test_should_stop_when_visitor_declines() {
        let xml = "<Result><Key>a</Key><Size>3</Size></Result>";

        let mut visitor = RecordingVisitor {
            stop_on: Some(ResponseTag::Size),
            ..RecordingVisitor::default()
        };
        let mut details = ResponseDetails::default();
        let err = scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect_err("visitor stopped");
        assert!(matches!(err, ScanError::Stopped));
        // Everything before the stop was still delivered.
        assert_eq!(visitor.texts.len(), 1);
    }

    #[tokio::test]
    async fn test_should_parse_across_arbitrary_chunk_splits() {
        // Feed the document through a duplex pipe in 7-byte chunks so events
        // span read boundaries.
        let xml = r#"<Error><Code>SlowDown</Code><Message>Reduce &amp; retry</Message></Error>"#;

        let (mut tx, rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            for chunk in xml.as_bytes().chunks(7) {
                tx.write_all(chunk).await.expect("pipe write");
            }
        });

        let mut visitor = NoXmlVisitor;
        let mut details = ResponseDetails::default();
        details.status = ResponseStatus::HttpOrAwsFailure;
        scan(tokio::io::BufReader::new(rx), &mut visitor, &mut details)
            .await
            .expect("scan");
        writer.await.expect("writer task");

        assert_eq!(details.error_code, "SlowDown");
        assert_eq!(details.error_message, "Reduce & retry");
        assert_eq!(details.status, ResponseStatus::FailureWithDetails);
    }

    #[tokio::test]
    async fn test_should_handle_self_closing_elements() {
        let xml = "<Result><Prefix/><Key>k</Key></Result>";

        let mut visitor = RecordingVisitor::default();
        let mut details = ResponseDetails::default();
        scan_bytes(xml, &mut visitor, &mut details)
            .await
            .expect("scan");
        assert_eq!(visitor.texts, vec![(2, ResponseTag::Key, "k".to_owned())]);
    }
}
