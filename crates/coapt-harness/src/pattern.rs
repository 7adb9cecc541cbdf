//! Text patterns awaited on session output.

use std::fmt;

use regex::Regex;

/// What an expectation waits for: a literal substring or a regular expression.
///
/// Regular expressions use the `regex` crate dialect. As with line-oriented
/// terminal tools, `.` does not cross a newline unless the pattern enables
/// the `s` flag.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

/// Location of a pattern inside a haystack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Found {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<Option<String>>,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    /// Compile a regular expression pattern.
    pub fn regex(source: &str) -> Result<Self, regex::Error> {
        Ok(Pattern::Regex(Regex::new(source)?))
    }

    /// The pattern source, used in logs and timeout errors.
    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Literal(text) => text,
            Pattern::Regex(re) => re.as_str(),
        }
    }

    /// Whether the pattern occurs anywhere in `haystack`.
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Literal(text) => haystack.contains(text.as_str()),
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }

    /// The first occurrence of the pattern in `haystack`.
    pub fn find<'h>(&self, haystack: &'h str) -> Option<&'h str> {
        self.find_in(haystack).map(|f| &haystack[f.start..f.end])
    }

    pub(crate) fn find_in(&self, haystack: &str) -> Option<Found> {
        match self {
            Pattern::Literal(text) => haystack.find(text.as_str()).map(|start| Found {
                start,
                end: start + text.len(),
                captures: Vec::new(),
            }),
            Pattern::Regex(re) => {
                let caps = re.captures(haystack)?;
                let whole = caps.get(0)?;
                Some(Found {
                    start: whole.start(),
                    end: whole.end(),
                    captures: caps
                        .iter()
                        .skip(1)
                        .map(|group| group.map(|g| g.as_str().to_string()))
                        .collect(),
                })
            }
        }
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Pattern::Regex(re)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "{text:?}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}
