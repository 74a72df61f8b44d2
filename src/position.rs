use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid position: {text}"))]
    InvalidPosition { text: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One segment of a node position: either a structural name (`do`, `try`,
/// a task name) or an index into an ordered child list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionToken {
    Name(String),
    Index(usize),
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionToken::Name(name) => write!(f, "{name}"),
            PositionToken::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Canonical address of a node inside a workflow tree.
///
/// Rendered as a JSON-pointer-like path (`/do/0/init/try/0/callApi`). Two
/// positions are equal iff their token sequences are equal; the distinguished
/// root position is the empty sequence, rendered as `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodePosition {
    tokens: Vec<PositionToken>,
}

impl NodePosition {
    /// The distinguished root position.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn tokens(&self) -> &[PositionToken] {
        &self.tokens
    }

    /// A new position with `name` appended.
    #[must_use]
    pub fn child_name(&self, name: impl Into<String>) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(PositionToken::Name(name.into()));
        Self { tokens }
    }

    /// A new position with `index` appended.
    #[must_use]
    pub fn child_index(&self, index: usize) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(PositionToken::Index(index));
        Self { tokens }
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = text.strip_prefix('/') else {
            return InvalidPositionSnafu { text }.fail();
        };
        let mut tokens = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return InvalidPositionSnafu { text }.fail();
            }
            match segment.parse::<usize>() {
                Ok(index) => tokens.push(PositionToken::Index(index)),
                Err(_) => tokens.push(PositionToken::Name(segment.to_string())),
            }
        }
        Ok(Self { tokens })
    }
}

impl fmt::Display for NodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tokens.is_empty() {
            return write!(f, "/");
        }
        for token in &self.tokens {
            write!(f, "/{token}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for NodePosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for NodePosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodePosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        NodePosition::parse(&text).map_err(serde::de::Error::custom)
    }
}
