//! Minimal mixed-content element tree for the backend's wire format.
//!
//! The stream coming out of the backend is a sequence of sibling elements
//! with no enclosing root, so [`parse_forest`] wraps its input in a
//! synthetic root before handing it to `quick-xml`.

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Tag of the synthetic element wrapping a parsed forest.
pub const FOREST_ROOT: &str = "coqtoproot";

/// Errors from parsing wire text into an [`Element`] tree.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error(transparent)]
    Syntax(#[from] quick_xml::Error),

    #[error(transparent)]
    Attribute(#[from] AttrError),

    /// Input ended with elements still open.
    #[error("unexpected end of input inside <{0}>")]
    Incomplete(String),

    #[error("closing tag </{found}> does not match <{expected}>")]
    Mismatch { expected: String, found: String },

    #[error("input contains no element")]
    Empty,
}

/// A child of an element: either a nested element or a run of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set the `val` attribute, the protocol's discriminant slot.
    pub fn with_val(mut self, val: impl Into<String>) -> Self {
        self.set_attr("val", val);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children
            .extend(children.into_iter().map(Node::Element));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
        self
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `val` attribute.
    pub fn val(&self) -> Option<&str> {
        self.attr("val")
    }

    /// Child elements in document order, skipping text runs.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_element(&self) -> Option<&Element> {
        self.elements().next()
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Text directly inside this element, excluding nested elements.
    pub fn own_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// All descendant text in document order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Remove every descendant element named `name`, at any depth.
    ///
    /// Text surrounding a removed element is kept in place.
    pub fn remove_descendants(&mut self, name: &str) {
        self.children.retain(|node| match node {
            Node::Element(e) => e.name != name,
            Node::Text(_) => true,
        });
        for node in &mut self.children {
            if let Node::Element(e) = node {
                e.remove_descendants(name);
            }
        }
    }

    /// Serialize this element and its subtree.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    /// Serialize only the children, without this element's own tags.
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        self.write_children(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&quick_xml::escape::escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        self.write_children(out);
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    fn write_children(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(&quick_xml::escape::escape(t.as_str())),
                Node::Element(e) => e.write_xml(out),
            }
        }
    }
}

/// Parse a single element from `input`.
pub fn parse(input: &str) -> Result<Element, XmlError> {
    let root = parse_forest(input)?;
    let first = root.elements().next().cloned();
    first.ok_or(XmlError::Empty)
}

/// Parse a sequence of sibling elements under a synthetic [`FOREST_ROOT`].
///
/// Returns [`XmlError::Incomplete`] (or a syntax error) while the input is
/// a truncated prefix of a well-formed stream.
pub fn parse_forest(input: &str) -> Result<Element, XmlError> {
    let wrapped = format!("<{FOREST_ROOT}>{input}</{FOREST_ROOT}>");
    let mut root = None;
    read_elements(&wrapped, |element, _| root = Some(element))?;
    root.ok_or(XmlError::Empty)
}

/// Parse the complete top-level elements at the start of `input`.
///
/// Each element comes with the byte offset just past its end. Parsing stops
/// quietly at the first truncated or malformed element, so a stream prefix
/// yields everything that has fully arrived.
pub fn parse_stream(input: &str) -> Vec<(Element, usize)> {
    let mut elements = Vec::new();
    let _ = read_elements(input, |element, end| elements.push((element, end)));
    elements
}

/// Drive the reader over `input`, handing every completed top-level element
/// to `emit` together with the offset where it ends.
fn read_elements(input: &str, mut emit: impl FnMut(Element, usize)) -> Result<(), XmlError> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        let finished = match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
                None
            }
            Event::Empty(start) => attach(&mut stack, element_from_start(&start)?),
            Event::End(end) => {
                let found = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                let element = stack.pop().ok_or_else(|| XmlError::Mismatch {
                    expected: String::new(),
                    found: found.clone(),
                })?;
                if element.name != found {
                    return Err(XmlError::Mismatch {
                        expected: element.name,
                        found,
                    });
                }
                attach(&mut stack, element)
            }
            Event::Text(text) => {
                push_text(&mut stack, &text.unescape()?);
                None
            }
            Event::CData(data) => {
                push_text(&mut stack, &String::from_utf8_lossy(&data.into_inner()));
                None
            }
            Event::Eof => break,
            _ => None,
        };
        if let Some(element) = finished {
            emit(element, reader.buffer_position() as usize);
        }
    }

    match stack.pop() {
        Some(open) => Err(XmlError::Incomplete(open.name)),
        None => Ok(()),
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Add `element` to its parent, or hand it back if it is top-level.
fn attach(stack: &mut [Element], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            None
        }
        None => Some(element),
    }
}

fn push_text(stack: &mut [Element], text: &str) {
    let Some(parent) = stack.last_mut() else {
        return;
    };
    if text.is_empty() {
        return;
    }
    // Adjacent text and CDATA runs are merged.
    if let Some(Node::Text(prev)) = parent.children.last_mut() {
        prev.push_str(text);
    } else {
        parent.children.push(Node::Text(text.to_string()));
    }
}
