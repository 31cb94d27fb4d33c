//! The owned XML element model and the framed stream codec.
//!
//! Every protocol message is one small top-level element; the codec never
//! builds trees larger than a single message.
use crate::{Error, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::str::FromStr;

/// One XML element: name, attributes, character data and child elements.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XmlElement {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    /// Returns an element named `name` with no content.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds an attribute; builder style.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.push((name.into(), value.to_string()));
        self
    }

    /// Appends a child element; builder style.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Sets the character data; builder style.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// The element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concatenated character data.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The child elements in document order.
    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    /// The first child named `name`.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The value of attribute `name`, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The value of attribute `name`, or a protocol error naming it.
    pub fn req_attr(&self, name: &str) -> Result<&str> {
        self.attr(name)
            .ok_or_else(|| Error::MissingAttribute(name.to_owned(), self.name.clone()))
    }

    /// Parses attribute `name` into `T`, or a protocol error.
    pub fn parse_attr<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.req_attr(name)?;
        value.parse().map_err(|err| {
            Error::BadAttribute(name.to_owned(), format!("{:?}: {}", value, err))
        })
    }

    /// Parses attribute `name` into `T` if present.
    pub fn parse_opt_attr<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.attr(name) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|err| {
                Error::BadAttribute(name.to_owned(), format!("{:?}: {}", value, err))
            }),
        }
    }

    /// Serialises the element, escaping text and attribute values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.write_into(&mut writer);
        writer.into_inner().into_inner()
    }

    fn write_into(&self, writer: &mut Writer<Cursor<Vec<u8>>>) {
        let mut start = BytesStart::new(self.name.as_str());
        for (name, value) in &self.attrs {
            start.push_attribute((name.as_str(), value.as_str()));
        }
        if self.text.is_empty() && self.children.is_empty() {
            // Infallible for an in-memory cursor.
            let _ = writer.write_event(Event::Empty(start));
            return;
        }
        let _ = writer.write_event(Event::Start(start));
        if !self.text.is_empty() {
            let _ = writer.write_event(Event::Text(BytesText::new(self.text.as_str())));
        }
        for child in &self.children {
            child.write_into(writer);
        }
        let _ = writer.write_event(Event::End(BytesEnd::new(self.name.as_str())));
    }

    /// Parses one complete element from `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<XmlElement> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut stack: Vec<XmlElement> = Vec::new();
        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|err| Error::Xml(err.to_string()))?;
            match event {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|err| Error::Xml(err.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.text.push_str(&text);
                    } else if !text.trim().is_empty() {
                        return Err(Error::Xml("text outside of any element".into()));
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced end tag".into()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Eof => {
                    return Err(Error::Xml("truncated element".into()));
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {
                    return Err(Error::Xml("unexpected markup in message".into()));
                }
                Event::CData(_) => {
                    return Err(Error::Xml("cdata is not part of the protocol".into()));
                }
            }
            buf.clear();
        }
    }
}

fn element_from_start(start: &BytesStart) -> Result<XmlElement> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|err| Error::Xml(err.to_string()))?
        .to_owned();
    let mut element = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| Error::Xml(err.to_string()))?;
        let name = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| Error::Xml(err.to_string()))?
            .to_owned();
        let raw = std::str::from_utf8(&attr.value)
            .map_err(|err| Error::Xml(err.to_string()))?;
        let value = quick_xml::escape::unescape(raw)
            .map_err(|err| Error::Xml(err.to_string()))?
            .into_owned();
        element.attrs.push((name, value));
    }
    Ok(element)
}

impl std::fmt::Display for XmlElement {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Incremental framer: buffers raw bytes and yields complete top-level
/// elements as they arrive on the stream.
#[derive(Debug, Default)]
pub struct XmlStream {
    buffer: Vec<u8>,
}

impl XmlStream {
    /// Returns an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every message completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<XmlElement>> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        loop {
            // Leading whitespace between messages is insignificant.
            let start = self
                .buffer
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..start);
            match frame_end(&self.buffer)? {
                Some(end) => {
                    let element = XmlElement::parse(&self.buffer[..end])?;
                    self.buffer.drain(..end);
                    messages.push(element);
                }
                None => break,
            }
        }
        Ok(messages)
    }

    /// Bytes buffered but not yet forming a complete message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Scans for the byte length of the first complete top-level element, or
/// `None` if more input is needed.
fn frame_end(buffer: &[u8]) -> Result<Option<usize>> {
    if buffer.is_empty() {
        return Ok(None);
    }
    if buffer[0] != b'<' {
        return Err(Error::Xml("expected element start".into()));
    }
    let mut depth = 0usize;
    let mut pos = 0usize;
    while pos < buffer.len() {
        match buffer[pos] {
            b'<' => {
                let closing = buffer.get(pos + 1) == Some(&b'!')
                    || buffer.get(pos + 1) == Some(&b'?');
                if closing {
                    return Err(Error::Xml("unexpected markup in stream".into()));
                }
                let is_end = buffer.get(pos + 1) == Some(&b'/');
                // Find the matching '>' outside of quotes.
                let mut quote: Option<u8> = None;
                let mut close = None;
                let mut self_closing = false;
                for (offset, &byte) in buffer[pos..].iter().enumerate() {
                    match (quote, byte) {
                        (Some(q), b) if b == q => quote = None,
                        (Some(_), _) => {}
                        (None, b'"') | (None, b'\'') => quote = Some(byte),
                        (None, b'>') => {
                            self_closing = offset >= 1 && buffer[pos + offset - 1] == b'/';
                            close = Some(pos + offset);
                            break;
                        }
                        (None, _) => {}
                    }
                }
                let Some(close) = close else {
                    return Ok(None);
                };
                if is_end {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        Error::Xml("unbalanced end tag".into())
                    })?;
                } else if !self_closing {
                    depth += 1;
                }
                pos = close + 1;
                if depth == 0 {
                    return Ok(Some(pos));
                }
            }
            _ => pos += 1,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_roundtrips_through_bytes() {
        let element = XmlElement::new("request")
            .with_attr("user", 3)
            .with_attr("time", "1:2 2:1")
            .with_child(
                XmlElement::new("insert")
                    .with_attr("pos", 5)
                    .with_text("a < b & \"c\""),
            );
        let bytes = element.to_bytes();
        let parsed = XmlElement::parse(&bytes).unwrap();
        assert_eq!(parsed, element);
        assert_eq!(parsed.child("insert").unwrap().text(), "a < b & \"c\"");
    }

    #[test]
    fn req_attr_reports_missing_attribute() {
        let element = XmlElement::new("user-join");
        assert!(matches!(
            element.req_attr("name"),
            Err(Error::MissingAttribute(..))
        ));
        assert_eq!(
            element.with_attr("name", "alice").req_attr("name").unwrap(),
            "alice"
        );
    }

    #[test]
    fn parse_attr_reports_bad_values() {
        let element = XmlElement::new("insert").with_attr("pos", "twelve");
        assert!(matches!(
            element.parse_attr::<usize>("pos"),
            Err(Error::BadAttribute(..))
        ));
    }

    #[test]
    fn stream_yields_messages_across_chunk_boundaries() {
        let mut stream = XmlStream::new();
        let first = stream.feed(b"<group name=\"g\"><messa").unwrap();
        assert!(first.is_empty());
        assert!(stream.pending() > 0);
        let second = stream
            .feed(b"ge type=\"normal\">hi</message></group><sync-ack/>")
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].name(), "group");
        assert_eq!(second[0].children()[0].text(), "hi");
        assert_eq!(second[1].name(), "sync-ack");
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn stream_rejects_malformed_input() {
        let mut stream = XmlStream::new();
        assert!(stream.feed(b"plain text").is_err());
        let mut stream = XmlStream::new();
        assert!(stream.feed(b"</lonely>").is_err());
    }

    #[test]
    fn quoted_angle_brackets_do_not_end_tags() {
        let mut stream = XmlStream::new();
        let messages = stream.feed(b"<note label=\"a>b\">x</note>").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attr("label"), Some("a>b"));
        assert_eq!(messages[0].text(), "x");
    }

    #[test]
    fn empty_elements_serialise_self_closed() {
        let bytes = XmlElement::new("sync-ack").to_bytes();
        assert_eq!(bytes, b"<sync-ack/>");
    }
}
