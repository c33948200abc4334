//! Minimal SOAP envelope construction and response parsing for the vim25 API.
//!
//! Requests are built as strings with escaped values. Responses are parsed
//! into a small element tree so polymorphic values (such as the import spec
//! returned by `CreateImportSpec`) can be written back verbatim into the next
//! request.

use std::borrow::Cow;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

use super::ManagedObjectRef;

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    "<soapenv:Body>"
);

const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Incrementally builds the body of one vim25 method call.
#[derive(Debug)]
pub(crate) struct Request {
    method: &'static str,
    body: String,
}

impl Request {
    /// Start a call of `method` on the managed object `this`.
    pub(crate) fn new(method: &'static str, this: &ManagedObjectRef) -> Self {
        let mut request = Self {
            method,
            body: String::new(),
        };
        request.push_ref("_this", this);
        request
    }

    pub(crate) fn method(&self) -> &'static str {
        self.method
    }

    /// Append `<name>text</name>`.
    pub(crate) fn push_text(&mut self, name: &str, text: &str) -> &mut Self {
        self.body.push_str(&element(name, text));
        self
    }

    /// Append a managed object reference element.
    pub(crate) fn push_ref(&mut self, name: &str, reference: &ManagedObjectRef) -> &mut Self {
        self.body.push_str(&ref_element(name, reference));
        self
    }

    /// Append pre-built XML.
    pub(crate) fn push_raw(&mut self, xml: &str) -> &mut Self {
        self.body.push_str(xml);
        self
    }

    /// Wrap the body in a SOAP envelope.
    pub(crate) fn into_envelope(self) -> String {
        format!(
            "{ENVELOPE_OPEN}<{m} xmlns=\"urn:vim25\">{body}</{m}>{ENVELOPE_CLOSE}",
            m = self.method,
            body = self.body
        )
    }
}

/// `<name>escaped text</name>`.
pub(crate) fn element(name: &str, text: &str) -> String {
    format!("<{name}>{}</{name}>", escape(text))
}

/// `<name type="Kind">value</name>`.
pub(crate) fn ref_element(name: &str, reference: &ManagedObjectRef) -> String {
    format!(
        "<{name} type=\"{}\">{}</{name}>",
        escape(reference.kind.as_str()),
        escape(reference.value.as_str())
    )
}

/// An element of a parsed response.
///
/// Element and attribute names keep their prefix in `qname` so the subtree
/// can be serialized again; lookups go by local name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    /// Qualified element name as it appeared in the document.
    pub qname: String,
    /// Attributes as `(qualified name, value)`.
    pub attributes: Vec<(String, String)>,
    /// Concatenated, unescaped text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Name without namespace prefix.
    pub fn local_name(&self) -> &str {
        strip_prefix(&self.qname)
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    /// All children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// Text of the first child with the given local name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Attribute value by local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| strip_prefix(k) == name)
            .map(|(_, v)| v.as_str())
    }

    /// Interpret this element as a managed object reference.
    pub fn as_ref_value(&self) -> Option<ManagedObjectRef> {
        // The unprefixed attribute; `xsi:type` names the schema type.
        let kind = self
            .attributes
            .iter()
            .find(|(k, _)| k == "type")
            .map(|(_, v)| v.as_str())?;
        Some(ManagedObjectRef::new(kind, self.text.trim()))
    }

    /// Serialize the subtree under a new element name, dropping namespace
    /// declarations and element prefixes so it fits a `urn:vim25` body.
    pub fn to_xml_as(&self, name: &str) -> String {
        let mut out = String::new();
        self.write_as(name, &mut out);
        out
    }

    fn write_as(&self, name: &str, out: &mut String) {
        out.push('<');
        out.push_str(name);
        for (key, value) in &self.attributes {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_as(child.local_name(), out);
        }
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

fn strip_prefix(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

/// Parse an XML document into its root element.
pub fn parse_document(text: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::soap(format!("malformed XML at byte {}: {e}", reader.buffer_position())))?;

        match event {
            Event::Start(e) => stack.push(start_node(&e)?),
            Event::Empty(e) => {
                let node = start_node(&e)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::soap("unbalanced end tag"))?;
                attach(&mut stack, &mut root, node);
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::soap(format!("bad text content: {e}")))?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::soap("document ended inside an element"));
    }
    root.ok_or_else(|| Error::soap("empty document"))
}

fn start_node(e: &BytesStart<'_>) -> Result<XmlNode> {
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::soap(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value: Cow<'_, str> = attr
            .unescape_value()
            .map_err(|err| Error::soap(format!("bad attribute value: {err}")))?;
        attributes.push((key, value.into_owned()));
    }
    Ok(XmlNode {
        qname: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        attributes,
        ..XmlNode::default()
    })
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

/// Extract the `<method>Response` element from a SOAP reply.
///
/// A SOAP fault becomes [`Error::HostRejected`] for `method`.
pub fn parse_response(text: &str, method: &str) -> Result<XmlNode> {
    let envelope = parse_document(text)?;
    let body = envelope
        .child("Body")
        .ok_or_else(|| Error::soap(format!("{method}: reply has no SOAP body")))?;

    if let Some(fault) = body.child("Fault") {
        return Err(Error::host_rejected(method, fault_message(fault)));
    }

    let expected = format!("{method}Response");
    body.child(&expected)
        .cloned()
        .ok_or_else(|| Error::soap(format!("{method}: reply has no <{expected}>")))
}

/// Human-readable text of a SOAP fault.
fn fault_message(fault: &XmlNode) -> String {
    let fault_string = fault.child_text("faultstring").unwrap_or_default().trim();
    let detail_kind = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .map(|d| d.attr("type").unwrap_or_else(|| d.local_name()).to_string());

    match (fault_string.is_empty(), detail_kind) {
        (false, Some(kind)) => format!("{fault_string} ({kind})"),
        (false, None) => fault_string.to_string(),
        (true, Some(kind)) => kind,
        (true, None) => "unspecified fault".to_string(),
    }
}

/// Text of a `LocalizedMethodFault`: its localized message or fault type.
pub fn localized_fault(node: &XmlNode) -> String {
    if let Some(message) = node.child_text("localizedMessage") {
        if !message.trim().is_empty() {
            return message.trim().to_string();
        }
    }
    node.child("fault")
        .and_then(|f| f.attr("type"))
        .unwrap_or("unknown fault")
        .to_string()
}
