//! XML response decoding
//!
//! Converts AWS query / rest-xml responses into `serde_json::Value` so every
//! protocol hands the same shape to checks:
//! - leaf elements become strings
//! - `member` / `item` list wrappers become arrays
//! - repeated sibling elements become arrays
//! - other elements become objects keyed by local name

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::cloud::ProviderError;

struct Node {
    name: String,
    children: Vec<(String, Value)>,
    text: String,
}

impl Node {
    fn new(name: String) -> Self {
        Self {
            name,
            children: Vec::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> (String, Value) {
        if self.children.is_empty() {
            return (self.name, Value::String(self.text.trim().to_string()));
        }

        let is_list = self
            .children
            .iter()
            .all(|(name, _)| name == "member" || name == "item");
        if is_list {
            let items = self.children.into_iter().map(|(_, v)| v).collect();
            return (self.name, Value::Array(items));
        }

        let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
        for (name, value) in self.children {
            match groups.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, values)) => values.push(value),
                None => groups.push((name, vec![value])),
            }
        }

        let map: Map<String, Value> = groups
            .into_iter()
            .map(|(name, mut values)| {
                let value = if values.len() == 1 {
                    values.remove(0)
                } else {
                    Value::Array(values)
                };
                (name, value)
            })
            .collect();
        (self.name, Value::Object(map))
    }
}

/// Parse an XML document, returning the root element's name and content
pub fn parse(xml: &str) -> Result<(String, Value), ProviderError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(Node::new(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let leaf = Node::new(name).into_value();
                attach(&mut stack, &mut root, leaf);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ProviderError::Decode(format!("invalid XML text: {}", e)))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ProviderError::Decode("unbalanced XML end tag".to_string()))?;
                attach(&mut stack, &mut root, node.into_value());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ProviderError::Decode(format!(
                    "invalid XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if !stack.is_empty() {
        return Err(ProviderError::Decode("truncated XML document".to_string()));
    }

    root.ok_or_else(|| ProviderError::Decode("empty XML document".to_string()))
}

fn attach(stack: &mut [Node], root: &mut Option<(String, Value)>, entry: (String, Value)) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(entry),
        None => *root = Some(entry),
    }
}

/// View a value that may hold one element or a list of them as a list
pub fn list_of(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        other => vec![other],
    }
}
