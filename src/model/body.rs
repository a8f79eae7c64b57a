//! MIME body structure.
//!
//! A [`Body`] never owns content bytes. It describes a region of some
//! byte buffer through sizes and offsets that are always relative to the
//! immediate parent's content start; only the store knows where that
//! buffer lives in the mailbox file.

use serde::{Deserialize, Serialize};

/// Primary MIME media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Text,
    Multipart,
    Message,
    Application,
    Audio,
    Image,
    Video,
    /// Anything not in the fixed set, lowercased.
    Other(String),
}

impl MediaType {
    /// Match a type name case-insensitively. Unknown names become [`MediaType::Other`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "multipart" => Self::Multipart,
            "message" => Self::Message,
            "application" => Self::Application,
            "audio" => Self::Audio,
            "image" => Self::Image,
            "video" => Self::Video,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Multipart => "multipart",
            Self::Message => "message",
            Self::Application => "application",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Video => "video",
            Self::Other(name) => name,
        }
    }

    /// Subtype assumed when the header names none.
    pub fn default_subtype(&self) -> Option<&'static str> {
        match self {
            Self::Text => Some("plain"),
            Self::Multipart => Some("mixed"),
            Self::Message => Some("rfc822"),
            Self::Application => Some("octet-stream"),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Content-Transfer-Encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    /// Unrecognised token, lowercased.
    Other(String),
}

impl Encoding {
    /// Header token for this encoding.
    pub fn name(&self) -> &str {
        match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
            Self::Other(name) => name,
        }
    }

    /// Whether a multipart or message container may carry this encoding.
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::SevenBit | Self::EightBit | Self::Other(_))
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One `attribute=value` MIME parameter. Attribute names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub attribute: String,
    pub value: String,
}

impl Param {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into().to_ascii_lowercase(),
            value: value.into(),
        }
    }
}

/// Look up a parameter by name, case-insensitively.
pub fn find_param<'a>(params: &'a [Param], attribute: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|p| p.attribute.eq_ignore_ascii_case(attribute))
        .map(|p| p.value.as_str())
}

/// Content-Disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    /// `inline`, `attachment`, ... lowercased.
    pub kind: String,
    pub params: Vec<Param>,
}

/// Size of a body's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodySize {
    pub bytes: usize,
    /// Line count; only tracked for text and message bodies.
    pub lines: Option<usize>,
}

/// A child of a multipart body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Start of this part (its MIME header) relative to the parent's content start.
    pub offset: usize,
    /// Length of the part's own header block, including the blank line.
    pub header_size: usize,
    pub body: Body,
}

impl Part {
    /// Start of the part's content relative to the parent's content start.
    pub fn content_offset(&self) -> usize {
        self.offset + self.header_size
    }
}

/// An encapsulated message/rfc822.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedMessage {
    pub envelope: super::envelope::Envelope,
    pub body: Body,
    /// Where the nested body starts, relative to the message part's content start.
    pub text_offset: usize,
}

/// What, if anything, a body contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Structure {
    /// A leaf body.
    Single,
    /// Child parts in order. Empty when the container could not be parsed.
    Multipart(Vec<Part>),
    /// The encapsulated message. `None` when the container could not be parsed.
    Message(Option<Box<NestedMessage>>),
}

/// A node of the MIME tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub media_type: MediaType,
    /// Lowercased subtype; `None` only for types with no default.
    pub subtype: Option<String>,
    pub params: Vec<Param>,
    pub encoding: Encoding,
    pub id: Option<String>,
    pub description: Option<String>,
    pub disposition: Option<Disposition>,
    pub size: BodySize,
    pub structure: Structure,
}

/// A body located inside a tree, with its content start relative to the root content.
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    pub body: &'a Body,
    pub start: usize,
}

impl Body {
    /// A leaf body of the given type with the per-type default subtype.
    pub fn new(media_type: MediaType) -> Self {
        let subtype = media_type.default_subtype().map(String::from);
        Self {
            media_type,
            subtype,
            params: Vec::new(),
            encoding: Encoding::SevenBit,
            id: None,
            description: None,
            disposition: None,
            size: BodySize::default(),
            structure: Structure::Single,
        }
    }

    /// `type/subtype`, e.g. `text/plain`.
    pub fn mime_type(&self) -> String {
        match &self.subtype {
            Some(sub) => format!("{}/{}", self.media_type, sub),
            None => self.media_type.to_string(),
        }
    }

    /// Whether the subtype equals `name`, case-insensitively.
    pub fn is_subtype(&self, name: &str) -> bool {
        self.subtype
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(name))
    }

    /// Look up a Content-Type parameter.
    pub fn param(&self, attribute: &str) -> Option<&str> {
        find_param(&self.params, attribute)
    }

    /// Child parts, if this is a multipart.
    pub fn parts(&self) -> &[Part] {
        match &self.structure {
            Structure::Multipart(parts) => parts,
            _ => &[],
        }
    }

    /// Resolve a dot-separated, 1-based section spec such as `"2.1"`.
    ///
    /// A non-multipart body answers to section `1`. Walking into a
    /// message/rfc822 part continues with the encapsulated body.
    pub fn find_section(&self, section: &str) -> Option<Located<'_>> {
        let numbers: Vec<usize> = section
            .split('.')
            .map(|n| n.trim().parse::<usize>().ok().filter(|&n| n > 0))
            .collect::<Option<Vec<_>>>()?;

        let mut current = Located {
            body: self,
            start: 0,
        };
        for (i, &n) in numbers.iter().enumerate() {
            current = match &current.body.structure {
                Structure::Multipart(parts) => {
                    let part = parts.get(n - 1)?;
                    Located {
                        body: &part.body,
                        start: current.start + part.content_offset(),
                    }
                }
                _ if n == 1 => current,
                _ => return None,
            };

            let more = i + 1 < numbers.len();
            if more {
                if let Structure::Message(nested) = &current.body.structure {
                    let nested = nested.as_ref()?;
                    current = Located {
                        body: &nested.body,
                        start: current.start + nested.text_offset,
                    };
                } else if !matches!(current.body.structure, Structure::Multipart(_)) {
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Visit every leaf in depth-first order with its content start
    /// relative to this body's content.
    pub fn for_each_leaf<'a>(&'a self, f: &mut dyn FnMut(Located<'a>)) {
        self.walk_leaves(0, f);
    }

    fn walk_leaves<'a>(&'a self, start: usize, f: &mut dyn FnMut(Located<'a>)) {
        match &self.structure {
            Structure::Single => f(Located { body: self, start }),
            Structure::Multipart(parts) => {
                for part in parts {
                    part.body.walk_leaves(start + part.content_offset(), f);
                }
            }
            Structure::Message(Some(nested)) => {
                nested.body.walk_leaves(start + nested.text_offset, f);
            }
            Structure::Message(None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(bytes: usize) -> Body {
        let mut b = Body::new(MediaType::Text);
        b.size.bytes = bytes;
        b
    }

    fn tree() -> Body {
        // multipart: [text @ 10+20, message @ 100+30 -> multipart [text @ 5+15]]
        let mut inner = Body::new(MediaType::Multipart);
        inner.structure = Structure::Multipart(vec![Part {
            offset: 5,
            header_size: 15,
            body: leaf(7),
        }]);
        let mut msg = Body::new(MediaType::Message);
        msg.structure = Structure::Message(Some(Box::new(NestedMessage {
            envelope: Default::default(),
            body: inner,
            text_offset: 40,
        })));
        let mut root = Body::new(MediaType::Multipart);
        root.structure = Structure::Multipart(vec![
            Part {
                offset: 10,
                header_size: 20,
                body: leaf(3),
            },
            Part {
                offset: 100,
                header_size: 30,
                body: msg,
            },
        ]);
        root
    }

    #[test]
    fn test_media_type_from_name() {
        assert_eq!(MediaType::from_name("TEXT"), MediaType::Text);
        assert_eq!(
            MediaType::from_name("X-Custom"),
            MediaType::Other("x-custom".to_string())
        );
        assert_eq!(MediaType::Image.default_subtype(), None);
    }

    #[test]
    fn test_find_section_top_level_leaf() {
        let body = leaf(12);
        let loc = body.find_section("1").unwrap();
        assert_eq!(loc.start, 0);
        assert!(body.find_section("2").is_none());
    }

    #[test]
    fn test_find_section_nested() {
        let root = tree();
        assert_eq!(root.find_section("1").unwrap().start, 30);
        assert_eq!(root.find_section("2").unwrap().start, 130);
        let deep = root.find_section("2.1").unwrap();
        assert_eq!(deep.start, 130 + 40 + 20);
        assert_eq!(deep.body.size.bytes, 7);
        assert!(root.find_section("3").is_none());
        assert!(root.find_section("1.1").is_none());
        assert!(root.find_section("x").is_none());
        assert!(root.find_section("0").is_none());
    }

    #[test]
    fn test_for_each_leaf_offsets() {
        let root = tree();
        let mut seen = Vec::new();
        root.for_each_leaf(&mut |loc| seen.push((loc.start, loc.body.size.bytes)));
        assert_eq!(seen, vec![(30, 3), (190, 7)]);
    }
}
