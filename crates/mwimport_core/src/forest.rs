//! Mutable HTML fragment forest.
//!
//! The pipeline operates on an owned tree with lxml-style text semantics:
//! an element carries its leading inner text in `text`, and the text that
//! follows it inside its parent in `tail`. Text runs at the top level of a
//! fragment are separate `Node::Text` roots.

use std::collections::BTreeMap;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};

/// Elements serialized without a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    /// Text inside the element, before its first child.
    pub text: String,
    pub children: Vec<Element>,
    /// Text after the element's closing tag, owned by the parent's content.
    pub tail: String,
    removed: bool,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.insert(name.to_string(), value.to_string());
    }

    /// Class membership by whitespace-split token, never substring.
    pub fn has_class(&self, token: &str) -> bool {
        self.attr("class")
            .map(|classes| classes.split_whitespace().any(|class| class == token))
            .unwrap_or(false)
    }

    /// Two-phase removal: mark now, physically drop at the next sweep.
    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Drops attributes, text, and children; keeps tag and tail.
    pub fn clear(&mut self) {
        self.attrs.clear();
        self.text.clear();
        self.children.clear();
    }

    /// First descendant (not self) matching the predicate, depth first.
    pub fn find_descendant<F>(&self, matches: &F) -> Option<&Element>
    where
        F: Fn(&Element) -> bool,
    {
        for child in &self.children {
            if matches(child) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(matches) {
                return Some(found);
            }
        }
        None
    }

    pub fn any_descendant<F>(&self, matches: &F) -> bool
    where
        F: Fn(&Element) -> bool,
    {
        self.find_descendant(matches).is_some()
    }

    /// Serializes this element (without its tail).
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        serialize_element(self, &mut out);
        out
    }

    /// True when the element has neither text nor live children.
    pub fn is_effectively_empty(&self) -> bool {
        self.text.trim().is_empty() && self.children.iter().all(Element::is_removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Element(Element),
}

/// Ordered sequence of fragment roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forest(pub Vec<Node>);

impl Forest {
    /// Parses an HTML fragment permissively. Comments, doctypes, and
    /// processing instructions are dropped; tags resolve to plain local
    /// names.
    pub fn parse(html: &str) -> Self {
        let wrapped = format!("<!DOCTYPE html><html><head></head><body>{html}</body></html>");
        let dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .one(wrapped.as_bytes());
        let mut roots = Vec::new();
        if let Some(body) = find_element(&dom.document, "body") {
            for child in body.children.borrow().iter() {
                match &child.data {
                    NodeData::Text { contents } => {
                        let run = contents.borrow().to_string();
                        match roots.last_mut() {
                            Some(Node::Element(previous)) => previous.tail.push_str(&run),
                            _ => roots.push(Node::Text(run)),
                        }
                    }
                    NodeData::Element { .. } => {
                        roots.push(Node::Element(convert_element(child)));
                    }
                    _ => {}
                }
            }
        }
        Forest(roots)
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for node in &self.0 {
            match node {
                Node::Text(run) => out.push_str(&html_escape::encode_text(run)),
                Node::Element(element) => {
                    serialize_element(element, &mut out);
                    out.push_str(&html_escape::encode_text(&element.tail));
                }
            }
        }
        out
    }

    /// Drops every element marked for removal, at any depth. Roots marked
    /// for removal leave the forest entirely.
    pub fn sweep(&mut self) {
        self.0.retain(|node| match node {
            Node::Text(_) => true,
            Node::Element(element) => !element.is_removed(),
        });
        for node in &mut self.0 {
            if let Node::Element(element) = node {
                sweep_element(element);
            }
        }
    }

    /// Preorder visit of every element in the forest.
    pub fn visit_elements_mut<F>(&mut self, visit: &mut F)
    where
        F: FnMut(&mut Element),
    {
        for node in &mut self.0 {
            if let Node::Element(element) = node {
                visit_element_mut(element, visit);
            }
        }
    }

    pub fn root_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.0.iter_mut().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }
}

fn visit_element_mut<F>(element: &mut Element, visit: &mut F)
where
    F: FnMut(&mut Element),
{
    visit(element);
    for child in &mut element.children {
        visit_element_mut(child, visit);
    }
}

fn sweep_element(element: &mut Element) {
    element.children.retain(|child| !child.is_removed());
    for child in &mut element.children {
        sweep_element(child);
    }
}

fn find_element(handle: &Handle, name: &str) -> Option<Handle> {
    for child in handle.children.borrow().iter() {
        if let NodeData::Element { name: qual, .. } = &child.data {
            if qual.local.as_ref() == name {
                return Some(child.clone());
            }
        }
        if let Some(found) = find_element(child, name) {
            return Some(found);
        }
    }
    None
}

fn convert_element(handle: &Handle) -> Element {
    let NodeData::Element { name, attrs, .. } = &handle.data else {
        return Element::default();
    };
    let mut element = Element::new(name.local.as_ref());
    for attr in attrs.borrow().iter() {
        element
            .attrs
            .insert(attr.name.local.to_string(), attr.value.to_string());
    }
    for child in handle.children.borrow().iter() {
        match &child.data {
            NodeData::Text { contents } => {
                let run = contents.borrow().to_string();
                match element.children.last_mut() {
                    Some(previous) => previous.tail.push_str(&run),
                    None => element.text.push_str(&run),
                }
            }
            NodeData::Element { .. } => {
                element.children.push(convert_element(child));
            }
            _ => {}
        }
    }
    element
}

fn serialize_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.tag);
    for (name, value) in &element.attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&html_escape::encode_double_quoted_attribute(value));
        out.push('"');
    }
    if VOID_ELEMENTS.contains(&element.tag.as_str()) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    out.push_str(&html_escape::encode_text(&element.text));
    for child in &element.children {
        serialize_element(child, out);
        out.push_str(&html_escape::encode_text(&child.tail));
    }
    out.push_str("</");
    out.push_str(&element.tag);
    out.push('>');
}
