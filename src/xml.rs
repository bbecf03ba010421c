//! Minimal namespace-aware XML tree used by the codec and the interpreter
//!
//! Distribution payloads are small (a response is capped at 50 documents), so
//! a fully materialized tree keeps lookups simple. Element names are stored by
//! local name together with their resolved namespace, which lets callers try a
//! namespaced lookup first and fall back to a bare one.

use quick_xml::NsReader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;

/// How element names are matched during lookups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// Local name must match and the element must live in this namespace
    Namespaced(&'a str),
    /// Local name must match; namespace is ignored
    AnyNamespace,
}

/// A parsed XML element
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    /// Resolved namespace URI, if the element is bound to one
    pub namespace: Option<String>,
    /// Local name (prefix stripped)
    pub name: String,
    /// Attributes by local name, in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated character data directly inside this element
    pub text: String,
    /// Child elements in document order
    pub children: Vec<Element>,
}

impl Element {
    /// Whether this element's name matches under the given lookup
    pub fn matches(&self, name: &str, lookup: Lookup<'_>) -> bool {
        if self.name != name {
            return false;
        }
        match lookup {
            Lookup::Namespaced(ns) => self.namespace.as_deref() == Some(ns),
            Lookup::AnyNamespace => true,
        }
    }

    /// Trimmed character data
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// Attribute value by local name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All descendants in document (pre-)order, excluding `self`
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// First element matching `path`, where the first segment may appear at
    /// any depth below `self` and each following segment is a direct child
    pub fn find(&self, path: &[&str], lookup: Lookup<'_>) -> Option<&Element> {
        let (first, rest) = path.split_first()?;
        self.descendants()
            .filter(|el| el.matches(first, lookup))
            .find_map(|el| el.descend(rest, lookup))
    }

    /// Non-empty trimmed text of the first element matching `path`
    pub fn find_text(&self, path: &[&str], lookup: Lookup<'_>) -> Option<&str> {
        self.find(path, lookup)
            .map(Element::text)
            .filter(|text| !text.is_empty())
    }

    /// Every descendant with the given name
    pub fn find_all<'a>(&'a self, name: &'a str, lookup: Lookup<'a>) -> Vec<&'a Element> {
        self.descendants()
            .filter(|el| el.matches(name, lookup))
            .collect()
    }

    fn descend(&self, rest: &[&str], lookup: Lookup<'_>) -> Option<&Element> {
        match rest.split_first() {
            None => Some(self),
            Some((head, tail)) => self
                .children
                .iter()
                .filter(|child| child.matches(head, lookup))
                .find_map(|child| child.descend(tail, lookup)),
        }
    }
}

/// Pre-order iterator over an element's descendants
pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        self.stack.extend(next.children.iter().rev());
        Some(next)
    }
}

/// Parse a complete document into its root element
pub fn parse(bytes: &[u8]) -> Result<Element, String> {
    let mut reader = NsReader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader
            .read_resolved_event_into(&mut buf)
            .map_err(|e| e.to_string())?
        {
            (resolved, Event::Start(start)) => {
                stack.push(open_element(resolved, &start)?);
            }
            (resolved, Event::Empty(start)) => {
                let element = open_element(resolved, &start)?;
                attach(element, &mut stack, &mut root)?;
            }
            (_, Event::End(_)) => {
                let element = stack.pop().ok_or("unbalanced closing tag")?;
                attach(element, &mut stack, &mut root)?;
            }
            (_, Event::Text(text)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&text.unescape().map_err(|e| e.to_string())?);
                }
            }
            (_, Event::CData(data)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err("unexpected end of document".to_string());
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn open_element(resolved: ResolveResult<'_>, start: &BytesStart<'_>) -> Result<Element, String> {
    let namespace = match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        _ => None,
    };
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        attributes.push((key, value));
    }

    Ok(Element {
        namespace,
        name,
        attributes,
        ..Element::default()
    })
}

fn attach(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err("more than one root element".to_string()),
    }
    Ok(())
}
