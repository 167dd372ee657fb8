//! State paths: symbolic (`safes[params.safeId].borrowedAmount`) and resolved.

use crate::expr::Expr;
use serde::{Deserialize, Serialize};

/// The binding a path is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    /// State before execution
    Pre,
    /// State after execution
    Post,
    /// Generated action parameters
    Params,
    /// Execution result and named outputs
    Outcome,
    /// Address of the acting account
    Actor,
    /// The snapshot under inspection; used by update targets and entity
    /// sources, written without a root prefix
    State,
    /// A local binding (`key`, `entry`) introduced by a generation filter
    Local(String),
}

impl Root {
    /// Maps a leading identifier onto a root, if it names one.
    pub fn from_ident(ident: &str) -> Option<Root> {
        match ident {
            "pre" => Some(Root::Pre),
            "post" => Some(Root::Post),
            "params" => Some(Root::Params),
            "outcome" => Some(Root::Outcome),
            "actor" => Some(Root::Actor),
            "key" | "entry" => Some(Root::Local(ident.to_string())),
            _ => None,
        }
    }
}

/// One step of a symbolic path.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// `.name`
    Field(String),
    /// `[expr]`; the key is the evaluated expression, never its text
    Index(Expr),
}

/// A symbolic path: a root followed by field and index segments.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePath {
    pub root: Root,
    pub segments: Vec<Segment>,
}

impl StatePath {
    /// Creates a path.
    pub fn new(root: Root, segments: Vec<Segment>) -> Self {
        Self { root, segments }
    }

    /// Name of the first field segment, e.g. the parameter for `params.x`.
    pub fn head_field(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Field(name)) => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = match &self.root {
            Root::Pre => {
                write!(f, "pre")?;
                false
            }
            Root::Post => {
                write!(f, "post")?;
                false
            }
            Root::Params => {
                write!(f, "params")?;
                false
            }
            Root::Outcome => {
                write!(f, "outcome")?;
                false
            }
            Root::Actor => {
                write!(f, "actor")?;
                false
            }
            Root::Local(name) => {
                write!(f, "{}", name)?;
                false
            }
            Root::State => true,
        };
        for segment in &self.segments {
            match segment {
                Segment::Field(name) if first => write!(f, "{}", name)?,
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(expr) => write!(f, "[{}]", expr)?,
            }
            first = false;
        }
        Ok(())
    }
}

/// A fully resolved location in a world state: concrete keys only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    /// Creates a path from keys.
    pub fn new(keys: Vec<String>) -> Self {
        Self(keys)
    }

    /// Returns the keys.
    pub fn keys(&self) -> &[String] {
        &self.0
    }

    /// Returns true if `self` equals `other` or is an ancestor of it.
    pub fn covers(&self, other: &FieldPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Appends a key.
    pub fn child(&self, key: &str) -> FieldPath {
        let mut keys = self.0.clone();
        keys.push(key.to_string());
        FieldPath(keys)
    }

    /// Parses a dotted prefix such as `accounts` or `StableBaseCDP.lastUpdated`.
    pub fn parse_prefix(s: &str) -> FieldPath {
        FieldPath(s.split('.').filter(|k| !k.is_empty()).map(str::to_string).collect())
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i == 0 {
                write!(f, "{}", key)?;
            } else if is_identifier(key) {
                write!(f, ".{}", key)?;
            } else {
                write!(f, "[{}]", key)?;
            }
        }
        Ok(())
    }
}
