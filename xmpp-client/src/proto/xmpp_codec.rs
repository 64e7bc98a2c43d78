// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP stream framing on top of tokio's codec machinery.
//!
//! Top-level elements are delimited with a streaming quick-xml pass and
//! then handed to minidom, parsed in the context of the stream root so
//! that the `stream:` prefix and the default namespace resolve.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::io;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};

use super::ns;
use crate::minidom::Element;

const STREAM_TAG: &[u8] = b"stream:stream";
const STREAM_END: &[u8] = b"</stream:stream>";

/// Anything that can be sent or received on an XMPP/XML stream
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `<stream:stream>` start tag, with its attributes
    StreamStart(BTreeMap<String, String>),
    /// A complete top-level element
    Stanza(Element),
    /// Raw data, sent as-is
    Text(String),
    /// `</stream:stream>` closing tag
    StreamEnd,
}

/// Direction of observed traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    /// Bytes received from the server
    Read,
    /// Bytes sent to the server
    Written,
}

/// Observer for the plaintext XML passing through a codec
pub type TraceHook = Arc<dyn Fn(Traffic, &[u8]) + Send + Sync>;

/// Framing failure
#[derive(Debug)]
pub enum CodecError {
    /// I/O failure of the underlying transport
    Io(io::Error),
    /// The peer sent data which is not well-formed XML
    Parse(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "I/O error: {}", e),
            CodecError::Parse(e) => write!(f, "XML error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

enum Frame {
    StreamStart(BTreeMap<String, String>),
    StreamEnd,
    Element { start: usize, end: usize },
}

fn header_attributes(tag: &BytesStart) -> Result<BTreeMap<String, String>, CodecError> {
    let mut attrs = BTreeMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| CodecError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| CodecError::Parse(e.to_string()))?;
        attrs.insert(key, value.into_owned());
    }
    Ok(attrs)
}

/// Locate the next complete frame at the start of `buffer`.
///
/// Returns the frame and the number of bytes it spans, or `None` when more
/// data is needed.
fn find_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, CodecError> {
    let Some(first) = buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok(None);
    };
    if buffer[first..].starts_with(STREAM_END) {
        return Ok(Some((Frame::StreamEnd, first + STREAM_END.len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut element_start = 0;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(XmlEvent::Decl(_))
            | Ok(XmlEvent::PI(_))
            | Ok(XmlEvent::Comment(_))
            | Ok(XmlEvent::DocType(_))
            | Ok(XmlEvent::Text(_))
            | Ok(XmlEvent::CData(_)) => (),
            Ok(XmlEvent::Start(tag)) => {
                if depth == 0 && tag.name().as_ref() == STREAM_TAG {
                    let attrs = header_attributes(&tag)?;
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamStart(attrs), end)));
                }
                if depth == 0 {
                    element_start = pos;
                }
                depth += 1;
            }
            Ok(XmlEvent::Empty(_)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Element { start: pos, end }, end)));
                }
            }
            Ok(XmlEvent::End(tag)) => {
                if depth == 0 {
                    return Err(CodecError::Parse(format!(
                        "unbalanced closing tag </{}>",
                        String::from_utf8_lossy(tag.name().as_ref())
                    )));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Element {
                            start: element_start,
                            end,
                        },
                        end,
                    )));
                }
            }
            Ok(XmlEvent::Eof) => return Ok(None),
            // Markup cut off at the end of the buffer.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(CodecError::Parse(e.to_string())),
        }
    }
}

/// Stateless codec between bytes and [`Packet`]s
pub struct XmppCodec {
    ns: String,
    trace: Option<TraceHook>,
}

impl XmppCodec {
    /// Codec for a `jabber:client` stream
    pub fn new() -> Self {
        XmppCodec {
            ns: ns::JABBER_CLIENT.to_owned(),
            trace: None,
        }
    }

    /// Report every byte read or written to `hook`
    pub fn with_trace(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    fn trace(&self, direction: Traffic, data: &[u8]) {
        if let Some(hook) = &self.trace {
            if !data.is_empty() {
                hook(direction, data);
            }
        }
    }

    fn parse_element(&self, raw: &[u8]) -> Result<Element, CodecError> {
        let text = std::str::from_utf8(raw).map_err(|e| CodecError::Parse(e.to_string()))?;
        let wrapped = format!(
            "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
            self.ns,
            ns::STREAM,
            text
        );
        let root: Element = wrapped
            .parse()
            .map_err(|e: crate::minidom::Error| CodecError::Parse(e.to_string()))?;
        root.children()
            .next()
            .cloned()
            .ok_or_else(|| CodecError::Parse("empty frame".to_owned()))
    }
}

impl Default for XmppCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for XmppCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("XmppCodec")
            .field("ns", &self.ns)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match find_frame(buf)? {
            None => {
                // Whitespace keepalives between frames.
                let blank = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                if blank > 0 && blank == buf.len() {
                    let data = buf.split_to(blank);
                    self.trace(Traffic::Read, &data);
                }
                Ok(None)
            }
            Some((frame, consumed)) => {
                let data = buf.split_to(consumed);
                self.trace(Traffic::Read, &data);
                let packet = match frame {
                    Frame::StreamStart(attrs) => Packet::StreamStart(attrs),
                    Frame::StreamEnd => Packet::StreamEnd,
                    Frame::Element { start, end } => {
                        Packet::Stanza(self.parse_element(&data[start..end])?)
                    }
                };
                Ok(Some(packet))
            }
        }
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match item {
            Packet::StreamStart(attrs) => {
                let mut header = String::from("<?xml version='1.0'?><stream:stream");
                let _ = write!(
                    header,
                    " xmlns='{}' xmlns:stream='{}'",
                    self.ns,
                    ns::STREAM
                );
                for (name, value) in attrs {
                    let _ = write!(header, " {}='{}'", name, escape(value.as_str()));
                }
                header.push('>');
                dst.put_slice(header.as_bytes());
            }
            Packet::Stanza(element) => {
                let mut out = Vec::new();
                element
                    .write_to(&mut out)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                dst.put_slice(&out);
            }
            Packet::Text(text) => dst.put_slice(text.as_bytes()),
            Packet::StreamEnd => dst.put_slice(STREAM_END),
        }
        self.trace(Traffic::Written, &dst[start..]);
        Ok(())
    }
}
