//! Framed-markup codec
//!
//! Each frame is a 4-byte big-endian length followed by a UTF-8 markup
//! document. The root element's `name` attribute identifies the message:
//!
//! ```text
//! <command name="login"><name>alice</name></command>
//! <command name="message"><message>hi</message><name>alice</name></command>
//! <event name="userlist"><user>alice</user><user>bob</user></event>
//! <event name="history"><item><sender>alice</sender><text>hi</text></item></event>
//! ```
//!
//! Every payload string is escaped for `& < > " '`. History is split into
//! pages of [`HISTORY_PAGE_SIZE`] items, one frame per page. Malformed
//! documents and unknown names are logged and skipped so the connection
//! keeps going. A well-formed document missing a required child decodes
//! to `Message::Error` carrying an `Invalid <name> format` reason.

use std::collections::BTreeSet;

use bytes::BytesMut;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::codec::frame::{self, MAX_FRAME_LEN};
use crate::error::CodecError;
use crate::message::{HistoryEntry, Message};

/// Number of history items carried by one `history` frame
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Which side of the connection this codec encodes for
///
/// Only affects the root element written by the encoder; the decoder
/// accepts either root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → server documents (`<command>`)
    ToServer,
    /// Server → client documents (`<event>`)
    ToClient,
}

impl Direction {
    fn root_tag(self) -> &'static str {
        match self {
            Direction::ToServer => "command",
            Direction::ToClient => "event",
        }
    }
}

/// Length-prefixed markup document codec
#[derive(Debug, Clone)]
pub struct MarkupCodec {
    direction: Direction,
    page_size: usize,
    max_frame_len: usize,
}

impl MarkupCodec {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            page_size: HISTORY_PAGE_SIZE,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Codec used by the server: writes `<event>` documents
    pub fn server() -> Self {
        Self::new(Direction::ToClient)
    }

    /// Codec used by the client: writes `<command>` documents
    pub fn client() -> Self {
        Self::new(Direction::ToServer)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Decoder for MarkupCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            let Some(payload) = frame::take_frame(src, self.max_frame_len)? else {
                return Ok(None);
            };

            let document = match std::str::from_utf8(&payload) {
                Ok(document) => document,
                Err(e) => {
                    warn!("Discarding markup frame that is not UTF-8: {}", e);
                    continue;
                }
            };

            match parse_document(document) {
                Ok(message) => return Ok(Some(message)),
                // Answered rather than skipped, so the peer learns what was wrong
                Err(CodecError::MissingField { command, .. }) => {
                    return Ok(Some(Message::Error {
                        reason: format!("Invalid {} format", command),
                    }));
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Discarding markup frame: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Encoder<Message> for MarkupCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        for document in render(&item, self.direction, self.page_size) {
            frame::put_frame(dst, document.as_bytes(), self.max_frame_len)?;
        }
        Ok(())
    }
}

/// Render a message as one or more markup documents.
///
/// Every variant yields exactly one document except `History`, which yields
/// one document per page (at least one, even when empty).
pub fn render(message: &Message, direction: Direction, page_size: usize) -> Vec<String> {
    let root = direction.root_tag();
    match message {
        Message::Login { username } => {
            vec![document(root, message.name(), |out| push_field(out, "name", username))]
        }
        Message::Chat { sender, text } => vec![document(root, message.name(), |out| {
            push_field(out, "message", text);
            push_field(out, "name", sender);
        })],
        Message::Logout | Message::ListUsers => vec![document(root, message.name(), |_| {})],
        Message::UserEvent { username, .. } => {
            vec![document(root, message.name(), |out| push_field(out, "name", username))]
        }
        Message::UserList { usernames } => vec![document(root, message.name(), |out| {
            for user in usernames {
                push_field(out, "user", user);
            }
        })],
        Message::History { entries } => {
            if entries.is_empty() {
                return vec![document(root, message.name(), |_| {})];
            }
            entries
                .chunks(page_size.max(1))
                .map(|page| {
                    document(root, message.name(), |out| {
                        for entry in page {
                            out.push_str("<item>");
                            push_field(out, "sender", &entry.sender);
                            push_field(out, "text", &entry.text);
                            out.push_str("</item>");
                        }
                    })
                })
                .collect()
        }
        Message::Success { session } => vec![document(root, message.name(), |out| {
            if let Some(session) = session {
                push_field(out, "session", session);
            }
        })],
        Message::Error { reason } => {
            vec![document(root, message.name(), |out| push_field(out, "message", reason))]
        }
    }
}

fn document(root: &str, name: &str, body: impl FnOnce(&mut String)) -> String {
    let mut out = String::with_capacity(64);
    out.push('<');
    out.push_str(root);
    out.push_str(" name=\"");
    out.push_str(name);
    out.push_str("\">");
    body(&mut out);
    out.push_str("</");
    out.push_str(root);
    out.push('>');
    out
}

fn push_field(out: &mut String, tag: &str, value: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&escape(value));
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// Parse one markup document into a message.
///
/// Fails with `CodecError::Parse` for malformed markup, with
/// `CodecError::MissingField` when a required child is absent, and with
/// `CodecError::UnknownCommand` for an unrecognized name.
pub fn parse_document(document: &str) -> Result<Message, CodecError> {
    let root = Element::parse(document)?;
    let name = root
        .name
        .as_deref()
        .ok_or_else(|| CodecError::Parse(format!("<{}> has no name attribute", root.tag)))?;

    let required = |element: &Element, field: &str| -> Result<String, CodecError> {
        element
            .child_text(field)
            .map(str::to_string)
            .ok_or_else(|| CodecError::MissingField {
                command: name.to_string(),
                field: field.to_string(),
            })
    };

    let message = match name {
        "login" => Message::Login {
            username: required(&root, "name")?,
        },
        "message" => Message::Chat {
            sender: root.child_text("name").unwrap_or_default().to_string(),
            text: required(&root, "message")?,
        },
        "logout" => Message::Logout,
        "list" => Message::ListUsers,
        "userlogin" | "userlogout" => Message::UserEvent {
            username: required(&root, "name")?,
            is_login: name == "userlogin",
        },
        "userlist" => Message::UserList {
            usernames: root
                .children_named("user")
                .map(|user| user.text.clone())
                .filter(|user| !user.is_empty())
                .collect::<BTreeSet<_>>(),
        },
        "history" => Message::History {
            entries: root
                .children_named("item")
                .map(|item| {
                    Ok(HistoryEntry {
                        sender: required(item, "sender")?,
                        text: required(item, "text")?,
                    })
                })
                .collect::<Result<Vec<_>, CodecError>>()?,
        },
        "success" => Message::Success {
            session: root.child_text("session").map(str::to_string),
        },
        "error" => Message::Error {
            reason: root.child_text("message").unwrap_or_default().to_string(),
        },
        other => return Err(CodecError::UnknownCommand(other.to_string())),
    };
    Ok(message)
}

/// Minimal element tree: tag, `name` attribute, unescaped text, children
#[derive(Debug, Default)]
struct Element {
    tag: String,
    name: Option<String>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> Result<Self, CodecError> {
        let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let name = match start.try_get_attribute("name").map_err(parse_error)? {
            Some(attr) => Some(attr.unescape_value().map_err(parse_error)?.into_owned()),
            None => None,
        };
        Ok(Self {
            tag,
            name,
            ..Self::default()
        })
    }

    fn parse(document: &str) -> Result<Self, CodecError> {
        let mut reader = Reader::from_str(document);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(parse_error)? {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(CodecError::Parse("content after root element".into()));
                    }
                    stack.push(Element::open(&start)?);
                }
                Event::Empty(start) => {
                    let element = Element::open(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| CodecError::Parse("unexpected closing tag".into()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(parse_error)?;
                    match stack.last_mut() {
                        Some(element) => element.text.push_str(&text),
                        None if text.trim().is_empty() => {}
                        None => {
                            return Err(CodecError::Parse("text outside the root element".into()))
                        }
                    }
                }
                Event::CData(data) => {
                    let text = std::str::from_utf8(&data).map_err(parse_error)?;
                    match stack.last_mut() {
                        Some(element) => element.text.push_str(text),
                        None => {
                            return Err(CodecError::Parse("CDATA outside the root element".into()))
                        }
                    }
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(CodecError::Parse(format!("unclosed <{}>", open.tag)));
        }
        root.ok_or_else(|| CodecError::Parse("empty document".into()))
    }

    fn children_named<'a>(&'a self, tag: &'static str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.tag == tag)
    }

    fn child_text<'a>(&'a self, tag: &str) -> Option<&'a str> {
        self.children
            .iter()
            .find(|child| child.tag == tag)
            .map(|child| child.text.as_str())
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), CodecError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(CodecError::Parse("more than one root element".into()));
    }
    Ok(())
}

fn parse_error(err: impl std::fmt::Display) -> CodecError {
    CodecError::Parse(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(codec: &mut MarkupCodec, messages: Vec<Message>) -> BytesMut {
        let mut buf = BytesMut::new();
        for msg in messages {
            codec.encode(msg, &mut buf).unwrap();
        }
        buf
    }

    fn raw_frame(document: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        frame::put_frame(&mut buf, document.as_bytes(), MAX_FRAME_LEN).unwrap();
        buf
    }

    fn history(count: usize) -> Vec<HistoryEntry> {
        (1..=count)
            .map(|i| HistoryEntry::new(format!("user{}", i % 3), format!("e{}", i)))
            .collect()
    }

    #[test]
    fn test_round_trip_every_variant() {
        let samples = vec![
            Message::Login {
                username: "alice".into(),
            },
            Message::Chat {
                sender: "alice".into(),
                text: "hello there".into(),
            },
            Message::Logout,
            Message::ListUsers,
            Message::UserEvent {
                username: "bob".into(),
                is_login: true,
            },
            Message::UserEvent {
                username: "bob".into(),
                is_login: false,
            },
            Message::UserList {
                usernames: BTreeSet::from(["a&b".to_string(), "<carol>".to_string()]),
            },
            Message::History {
                entries: history(3),
            },
            Message::History { entries: vec![] },
            Message::Success {
                session: Some("8d1c".into()),
            },
            Message::Success { session: None },
            Message::Error {
                reason: "Username 'alice' is already taken".into(),
            },
        ];

        for direction in [Direction::ToServer, Direction::ToClient] {
            let mut codec = MarkupCodec::new(direction);
            let mut buf = encode_all(&mut codec, samples.clone());
            for expected in &samples {
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(&decoded, expected);
            }
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
    }

    #[test]
    fn test_escaping_recovers_original_text() {
        let mut codec = MarkupCodec::server();
        let original = Message::Chat {
            sender: "al\"ice'".into(),
            text: "<b>&\"'".into(),
        };

        let docs = render(&original, Direction::ToClient, HISTORY_PAGE_SIZE);
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].contains("<b>"));
        assert!(docs[0].contains("&lt;b&gt;&amp;"));

        let mut buf = encode_all(&mut codec, vec![original.clone()]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), original);
    }

    #[test]
    fn test_history_pagination() {
        let entries = history(120);
        let mut codec = MarkupCodec::server();
        let mut buf = encode_all(
            &mut codec,
            vec![Message::History {
                entries: entries.clone(),
            }],
        );

        let mut pages = Vec::new();
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            match msg {
                Message::History { entries } => pages.push(entries),
                other => panic!("Wrong variant: {:?}", other),
            }
        }

        let sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        let rejoined: Vec<HistoryEntry> = pages.into_iter().flatten().collect();
        assert_eq!(rejoined, entries);
    }

    #[test]
    fn test_empty_history_is_one_frame() {
        let docs = render(&Message::History { entries: vec![] }, Direction::ToClient, 50);
        assert_eq!(docs, vec![r#"<event name="history"></event>"#.to_string()]);
    }

    #[test]
    fn test_logout_has_no_fields() {
        let docs = render(&Message::Logout, Direction::ToServer, 50);
        assert_eq!(docs, vec![r#"<command name="logout"></command>"#.to_string()]);
    }

    #[test]
    fn test_malformed_markup_is_parse_error() {
        for bad in [
            "",
            "hello",
            r#"<command name="login"><name>x</command>"#,
            r#"<command name="login"><name>x</name>"#,
            r#"<command><name>x</name></command>"#,
            r#"<command name="list"></command><command name="list"></command>"#,
        ] {
            let err = parse_document(bad).unwrap_err();
            assert!(matches!(err, CodecError::Parse(_)), "{:?} gave {:?}", bad, err);
        }
    }

    #[test]
    fn test_missing_required_child() {
        for (doc, command, field) in [
            (r#"<command name="login"></command>"#, "login", "name"),
            (r#"<command name="message"><name>bob</name></command>"#, "message", "message"),
            (r#"<event name="history"><item><text>hi</text></item></event>"#, "history", "sender"),
        ] {
            match parse_document(doc).unwrap_err() {
                CodecError::MissingField { command: c, field: f } => {
                    assert_eq!((c.as_str(), f.as_str()), (command, field));
                }
                other => panic!("{:?} gave {:?}", doc, other),
            }
        }
    }

    #[test]
    fn test_decoder_answers_missing_child() {
        let mut codec = MarkupCodec::server();
        let mut buf = raw_frame(r#"<command name="login"></command>"#);
        buf.unsplit(raw_frame(r#"<command name="message"></command>"#));

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Error {
                reason: "Invalid login format".into()
            })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Error {
                reason: "Invalid message format".into()
            })
        );
    }

    #[test]
    fn test_unknown_command() {
        let err = parse_document(r#"<command name="dance"/>"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownCommand(ref name) if name == "dance"));
    }

    #[test]
    fn test_accepts_foreign_layout() {
        let doc = "<?xml version=\"1.0\"?>\n<command name=\"message\">\n  <name>bob</name>\n  <message><![CDATA[a < b]]></message>\n</command>";
        assert_eq!(
            parse_document(doc).unwrap(),
            Message::Chat {
                sender: "bob".into(),
                text: "a < b".into(),
            }
        );
    }

    #[test]
    fn test_decoder_skips_bad_frames() {
        let mut codec = MarkupCodec::server();
        let mut buf = raw_frame("<command name=");
        buf.unsplit(raw_frame(r#"<command name="dance"></command>"#));
        let mut invalid_utf8 = BytesMut::new();
        frame::put_frame(&mut invalid_utf8, &[0xC3, 0x28], MAX_FRAME_LEN).unwrap();
        buf.unsplit(invalid_utf8);
        buf.unsplit(raw_frame(r#"<command name="list"></command>"#));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::ListUsers));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_length_prefix_is_fatal() {
        let mut codec = MarkupCodec::server();
        let mut buf = BytesMut::from(&[0x7Fu8, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Protocol(_))));
    }
}
