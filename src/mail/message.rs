//! Raw inbound message and RFC 822 parsing.

use chrono::{DateTime, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders};
use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;

/// Reference to an attachment; contents stay in the raw message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    pub file_name: Option<String>,
    pub content_type: String,
    pub size: usize,
}

/// A fetched message. Immutable for the duration of a pipeline run.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Stable identity, e.g. the Message-ID header.
    pub id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    /// Preferred body part, markup included.
    pub body: Vec<u8>,
    pub attachments: Vec<AttachmentRef>,
    pub received_at: DateTime<Utc>,
    /// The exact bytes as delivered, for archival.
    pub raw: Vec<u8>,
}

impl RawMessage {
    /// Build a message from already-separated parts. `raw` is set to `body`.
    pub fn from_parts(id: impl Into<String>, sender: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            id: id.into(),
            sender: sender.into(),
            recipients: Vec::new(),
            subject: None,
            raw: body.clone(),
            body,
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Parse an RFC 822 message.
    ///
    /// A missing Message-ID is replaced by a UUID v5 of the raw bytes so a
    /// redelivered copy keeps the same identity.
    pub fn parse(bytes: &[u8]) -> Result<Self, PipelineError> {
        let parsed = MessageParser::default()
            .parse(bytes)
            .ok_or_else(|| PipelineError::Parse("not an RFC 822 message".into()))?;

        let id = parsed
            .message_id()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, bytes)));

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let mut recipients = addresses(parsed.to());
        recipients.extend(addresses(parsed.cc()));

        let body = parsed
            .html_part(0)
            .or_else(|| parsed.text_part(0))
            .map(|part| part.contents().to_vec())
            .unwrap_or_else(|| parsed.root_part().contents().to_vec());

        let attachments = parsed
            .attachments()
            .map(|part| AttachmentRef {
                file_name: part.attachment_name().map(str::to_string),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".into()),
                size: part.contents().len(),
            })
            .collect();

        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            id,
            sender,
            recipients,
            subject: parsed.subject().map(str::to_string),
            body,
            attachments,
            received_at,
            raw: bytes.to_vec(),
        })
    }
}

fn addresses(addr: Option<&Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Message-ID: <abc123@allowed.com>\r\n\
From: Alice <alice@allowed.com>\r\n\
To: inbox@example.org\r\n\
Cc: Bob <bob@example.org>\r\n\
Subject: Research digest\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Novel compound X inhibits Y</p>\r\n";

    #[test]
    fn parses_headers_and_body() {
        let msg = RawMessage::parse(SIMPLE).unwrap();
        assert_eq!(msg.id, "abc123@allowed.com");
        assert_eq!(msg.sender, "alice@allowed.com");
        assert_eq!(msg.recipients, vec!["inbox@example.org", "bob@example.org"]);
        assert_eq!(msg.subject.as_deref(), Some("Research digest"));
        let body = String::from_utf8(msg.body.clone()).unwrap();
        assert!(body.contains("<p>Novel compound X inhibits Y</p>"));
        assert_eq!(msg.received_at.to_rfc3339(), "2025-07-01T10:00:00+00:00");
        assert_eq!(msg.raw, SIMPLE);
    }

    #[test]
    fn missing_message_id_is_stable() {
        let bytes = b"From: bob@blocked.com\r\nSubject: hi\r\n\r\nhello there\r\n";
        let a = RawMessage::parse(bytes).unwrap();
        let b = RawMessage::parse(bytes).unwrap();
        assert!(a.id.starts_with("gen-"));
        assert_eq!(a.id, b.id);
        assert_eq!(String::from_utf8(a.body).unwrap().trim(), "hello there");
    }

    #[test]
    fn multipart_prefers_html_and_lists_attachments() {
        let bytes = b"Message-ID: <m1@x.com>\r\n\
From: alice@allowed.com\r\n\
Subject: parts\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain version\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>html version</b>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"paper.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--outer--\r\n";
        let msg = RawMessage::parse(bytes).unwrap();
        let body = String::from_utf8(msg.body).unwrap();
        assert!(body.contains("<b>html version</b>"), "{body}");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].file_name.as_deref(), Some("paper.pdf"));
        assert_eq!(msg.attachments[0].content_type, "application/pdf");
        assert_eq!(msg.attachments[0].size, 5);
    }

    #[test]
    fn from_parts_keeps_raw() {
        let msg = RawMessage::from_parts("id-1", "a@b.com", "body").with_subject("s");
        assert_eq!(msg.raw, b"body");
        assert_eq!(msg.subject.as_deref(), Some("s"));
    }
}
