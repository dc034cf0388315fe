use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty reference")]
    Empty,

    #[error("invalid reference '{input}': {reason}")]
    Invalid { input: String, reason: String },

    #[error("unterminated '${{' in '{0}'")]
    Unterminated(String),
}

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Parsed interpolation reference: `$root.field[0].other`
///
/// `root` names a step id, the reserved run-input root, or a loop binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub root: String,
    pub path: Vec<PathSegment>,
}

/// Characters allowed in step ids and reference identifiers
pub fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Reference {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.path.push(PathSegment::Field(name.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.path.push(PathSegment::Index(index));
        self
    }

    /// Parse a reference body. A leading `$` is accepted and ignored.
    pub fn parse(src: &str) -> Result<Self, ReferenceError> {
        let body = src.strip_prefix('$').unwrap_or(src);
        if body.is_empty() {
            return Err(ReferenceError::Empty);
        }
        let invalid = |reason: &str| ReferenceError::Invalid {
            input: src.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = body.chars().collect();
        let mut pos = 0;

        let root = take_ident(&chars, &mut pos);
        if root.is_empty() {
            return Err(invalid("expected an identifier"));
        }

        let mut path = Vec::new();
        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    let field = take_ident(&chars, &mut pos);
                    if field.is_empty() {
                        return Err(invalid("expected a field name after '.'"));
                    }
                    path.push(PathSegment::Field(field));
                }
                '[' => {
                    pos += 1;
                    if chars.get(pos) == Some(&'"') {
                        pos += 1;
                        let start = pos;
                        while pos < chars.len() && chars[pos] != '"' {
                            pos += 1;
                        }
                        if pos >= chars.len() {
                            return Err(invalid("unterminated quoted key"));
                        }
                        let key: String = chars[start..pos].iter().collect();
                        pos += 1;
                        path.push(PathSegment::Field(key));
                    } else {
                        let start = pos;
                        while pos < chars.len() && chars[pos].is_ascii_digit() {
                            pos += 1;
                        }
                        let digits: String = chars[start..pos].iter().collect();
                        let index = digits
                            .parse::<usize>()
                            .map_err(|_| invalid("expected an index inside '[]'"))?;
                        path.push(PathSegment::Index(index));
                    }
                    if chars.get(pos) != Some(&']') {
                        return Err(invalid("expected ']'"));
                    }
                    pos += 1;
                }
                other => {
                    return Err(invalid(&format!("unexpected character '{}'", other)));
                }
            }
        }

        Ok(Self { root, path })
    }
}

fn take_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.root)?;
        for segment in &self.path {
            match segment {
                PathSegment::Field(name) if name.chars().all(is_ident_char) => {
                    write!(f, ".{}", name)?
                }
                PathSegment::Field(name) => write!(f, "[\"{}\"]", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}
