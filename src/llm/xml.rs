//! The structured-memory XML form.
//!
//! `<memory type="T" domain="D"><what/>[<when/>][<do/>][<warn/>]</memory>`,
//! with the body field subset fixed per memory type. Escaping covers `&`,
//! `<`, and `>` only.

use anyhow::{bail, Result};

use crate::memory::types::MemoryType;

/// Body fields of a structured memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    What,
    When,
    Do,
    Warn,
}

impl Field {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::What => "what",
            Self::When => "when",
            Self::Do => "do",
            Self::Warn => "warn",
        }
    }
}

/// The field subset a structured record of the given type may carry.
/// Types outside the table structure like `context`.
pub fn field_subset(memory_type: MemoryType) -> &'static [Field] {
    use Field::*;
    match memory_type {
        MemoryType::Fact | MemoryType::Skill => &[What],
        MemoryType::Pattern => &[What, When, Do, Warn],
        MemoryType::Decision | MemoryType::Preference => &[What, Warn],
        MemoryType::Bug => &[What, Do],
        _ => &[What, When],
    }
}

/// Escape `&`, `<`, `>` for XML body text and attribute values.
pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Reverse of [`escape_xml`].
pub fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// A parsed (or to-be-rendered) structured memory.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMemory {
    pub memory_type: MemoryType,
    pub domain: String,
    pub what: String,
    pub when: Option<String>,
    /// Rendered as `<do>`.
    pub action: Option<String>,
    pub warn: Option<String>,
}

impl StructuredMemory {
    /// Render to the canonical XML form, emitting only the field subset for
    /// the record's type.
    pub fn render(&self) -> String {
        let mut xml = format!(
            "<memory type=\"{}\" domain=\"{}\">",
            self.memory_type.as_str(),
            escape_xml(&self.domain)
        );
        for field in field_subset(self.memory_type) {
            let value = match field {
                Field::What => Some(self.what.as_str()),
                Field::When => self.when.as_deref(),
                Field::Do => self.action.as_deref(),
                Field::Warn => self.warn.as_deref(),
            };
            if let Some(value) = value {
                let tag = field.tag();
                xml.push_str(&format!("<{tag}>{}</{tag}>", escape_xml(value)));
            }
        }
        xml.push_str("</memory>");
        xml
    }
}

/// Parse a structured-memory XML string. Lenient about whitespace, strict
/// about the root element and required attributes.
pub fn parse(xml: &str) -> Result<StructuredMemory> {
    let xml = xml.trim();
    if !xml.starts_with("<memory") || !xml.ends_with("</memory>") {
        bail!("not a structured memory: missing <memory> root");
    }

    let type_value = attr_value(xml, "type")?;
    let memory_type = type_value
        .parse::<MemoryType>()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let domain = unescape_xml(&attr_value(xml, "domain")?);

    let what = match tag_body(xml, "what") {
        Some(body) => unescape_xml(&body),
        None => bail!("structured memory has no <what>"),
    };

    Ok(StructuredMemory {
        memory_type,
        domain,
        what,
        when: tag_body(xml, "when").map(|b| unescape_xml(&b)),
        action: tag_body(xml, "do").map(|b| unescape_xml(&b)),
        warn: tag_body(xml, "warn").map(|b| unescape_xml(&b)),
    })
}

fn attr_value(xml: &str, name: &str) -> Result<String> {
    let marker = format!("{name}=\"");
    let Some(start) = xml.find(&marker) else {
        bail!("structured memory missing required attribute: {name}");
    };
    let rest = &xml[start + marker.len()..];
    let Some(end) = rest.find('"') else {
        bail!("unterminated attribute: {name}");
    };
    Ok(rest[..end].to_string())
}

fn tag_body(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}
