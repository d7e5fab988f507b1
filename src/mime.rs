//! MIME decoding: headers, the plain-text body, and the attachment list.
//!
//! The `mail-parser` part table is first folded into a [`PartNode`] tree
//! (leaves and multipart containers), which is then walked in document order.

use std::fmt;
use std::io::Cursor;

use chrono::{DateTime, Utc};
use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use mail_parser::{Addr, Address, Encoding, MessageParser, MessagePart, MimeHeaders, PartType};
use tokio::io::AsyncRead;

use crate::error::ParseError;
use crate::mailbox::RawMessage;

/// Maximum multipart nesting accepted before the message is rejected.
const MAX_DEPTH: usize = 32;

/// Single-pass byte source for one attachment.
pub type AttachmentStream = Box<dyn AsyncRead + Send + Unpin>;

/// One attachment extracted from a message, consumed by the writer.
pub struct AttachmentPart {
    /// Declared file name. May be absent or empty.
    pub name: Option<String>,
    pub content_type: String,
    stream: AttachmentStream,
}

impl AttachmentPart {
    pub fn new(name: Option<String>, content_type: impl Into<String>, stream: AttachmentStream) -> Self {
        Self {
            name,
            content_type: content_type.into(),
            stream,
        }
    }

    /// Attachment backed by an in-memory buffer.
    pub fn from_bytes(name: Option<&str>, content_type: &str, bytes: Vec<u8>) -> Self {
        Self::new(
            name.map(str::to_string),
            content_type,
            Box::new(Cursor::new(bytes)),
        )
    }

    /// The declared name, if present and non-empty.
    pub fn file_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    /// Give up the byte stream. The part is spent afterwards.
    pub fn into_stream(self) -> AttachmentStream {
        self.stream
    }
}

impl fmt::Debug for AttachmentPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentPart")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Decoded view of one message. Lives for a single processing cycle.
#[derive(Debug)]
pub struct ParsedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// First `text/plain` body part, if any.
    pub plain_body: Option<String>,
    /// First `text/html` body part, if any.
    pub html_body: Option<String>,
    /// Attachments in document order.
    pub attachments: Vec<AttachmentPart>,
}

/// A node of the message part tree.
#[derive(Debug)]
enum PartNode {
    Leaf(LeafPart),
    Container(Vec<PartNode>),
}

#[derive(Debug)]
struct LeafPart {
    content_type: String,
    name: Option<String>,
    disposition_attachment: bool,
    text: Option<String>,
    bytes: Vec<u8>,
}

impl LeafPart {
    /// Explicitly marked as an attachment, or carries a file name.
    fn is_attachment(&self) -> bool {
        self.disposition_attachment || self.name.is_some()
    }
}

/// Parses raw messages into [`ParsedMessage`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MimeDecoder;

impl MimeDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, raw: &RawMessage) -> Result<ParsedMessage, ParseError> {
        let id = raw.id.to_string();
        if raw.content.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::Empty { id });
        }

        let malformed = |reason: &str| ParseError::Malformed {
            id: id.clone(),
            reason: reason.to_string(),
        };

        let message = MessageParser::default()
            .parse(raw.content.as_slice())
            .ok_or_else(|| malformed("not a valid RFC 5322 message"))?;

        let root = message
            .parts
            .first()
            .ok_or_else(|| malformed("message has no parts"))?;
        if root.headers.is_empty() {
            return Err(malformed("message has no header section"));
        }

        let tree = build_tree(&message.parts, &raw.content, 0, 0).map_err(|reason| malformed(&reason))?;

        let mut parsed = ParsedMessage {
            from: format_addresses(message.from()).join(", "),
            to: format_addresses(message.to()),
            subject: message.subject().unwrap_or_default().to_string(),
            message_id: message.message_id().map(str::to_string),
            date: message
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
            plain_body: None,
            html_body: None,
            attachments: Vec::new(),
        };
        collect(tree, &mut parsed);
        Ok(parsed)
    }
}

/// Fold the flat part table into a tree rooted at `id`.
fn build_tree(
    parts: &[MessagePart<'_>],
    raw: &[u8],
    id: usize,
    depth: usize,
) -> Result<PartNode, String> {
    if depth > MAX_DEPTH {
        return Err(format!("multipart nesting deeper than {MAX_DEPTH}"));
    }
    let part = parts
        .get(id)
        .ok_or_else(|| format!("dangling part reference {id}"))?;

    match &part.body {
        PartType::Multipart(children) => children
            .iter()
            .map(|&child| build_tree(parts, raw, child as usize, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(PartNode::Container),
        body => Ok(PartNode::Leaf(LeafPart {
            content_type: content_type_of(part),
            name: part.attachment_name().map(str::to_string),
            disposition_attachment: part
                .content_disposition()
                .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment")),
            text: match body {
                PartType::Text(text) | PartType::Html(text) => Some(text.to_string()),
                _ => None,
            },
            bytes: body_bytes(part, raw),
        })),
    }
}

/// Body bytes with only the transfer encoding undone.
///
/// `mail-parser` converts `text/*` bodies to UTF-8, so the body is re-read
/// from the raw message to keep the declared charset intact.
fn body_bytes(part: &MessagePart<'_>, raw: &[u8]) -> Vec<u8> {
    let body = raw.get(part.raw_body_offset() as usize..part.raw_end_offset() as usize);
    let decoded = match (body, part.encoding) {
        _ if part.is_encoding_problem => None,
        (Some(body), Encoding::Base64) => base64_decode(body),
        (Some(body), Encoding::QuotedPrintable) => quoted_printable_decode(body),
        (Some(body), Encoding::None) => Some(body.to_vec()),
        (None, _) => None,
    };
    decoded.unwrap_or_else(|| part.contents().to_vec())
}

/// Depth-first walk in document order.
fn collect(node: PartNode, parsed: &mut ParsedMessage) {
    match node {
        PartNode::Container(children) => {
            for child in children {
                collect(child, parsed);
            }
        }
        PartNode::Leaf(leaf) if leaf.is_attachment() => {
            parsed.attachments.push(AttachmentPart::new(
                leaf.name,
                leaf.content_type,
                Box::new(Cursor::new(leaf.bytes)),
            ));
        }
        PartNode::Leaf(leaf) => match leaf.content_type.as_str() {
            "text/plain" if parsed.plain_body.is_none() => parsed.plain_body = leaf.text,
            "text/html" if parsed.html_body.is_none() => parsed.html_body = leaf.text,
            _ => {}
        },
    }
}

fn content_type_of(part: &MessagePart<'_>) -> String {
    part.content_type()
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .map(|ct| ct.to_ascii_lowercase())
        .unwrap_or_else(|| "text/plain".to_string())
}

/// Render an address header as `Name <addr>` / `addr` strings.
fn format_addresses(addr: Option<&Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        Address::List(addrs) => addrs.iter().filter_map(format_addr).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(format_addr))
            .collect(),
    }
}

fn format_addr(addr: &Addr<'_>) -> Option<String> {
    match (addr.name.as_deref(), addr.address.as_deref()) {
        (Some(name), Some(email)) if !name.is_empty() => Some(format!("{name} <{email}>")),
        (_, Some(email)) => Some(email.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}
