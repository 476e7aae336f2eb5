//! Resource hierarchy strings
//!
//! A hierarchy lists resource names from the root of a resource tree down
//! to the leaf that holds (or will hold) the physical file, joined by
//! [`HIERARCHY_DELIMITER`].

use crate::error::{Error, Result};
use std::fmt;

pub const HIERARCHY_DELIMITER: char = '/';

/// Builder and reader for hierarchy strings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HierarchyParser {
    resources: Vec<String>,
}

impl HierarchyParser {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Parse an existing hierarchy string
    pub fn parse(hier: &str) -> Result<Self> {
        let mut parser = Self::new();
        parser.set_string(hier)?;
        Ok(parser)
    }

    /// Replace the contents with a parsed hierarchy string
    pub fn set_string(&mut self, hier: &str) -> Result<()> {
        if hier.is_empty() {
            return Err(Error::InvalidHierarchy("empty hierarchy".into()));
        }
        let mut resources = Vec::new();
        for name in hier.split(HIERARCHY_DELIMITER) {
            if name.is_empty() {
                return Err(Error::InvalidHierarchy(format!(
                    "empty resource name in \"{hier}\""
                )));
            }
            resources.push(name.to_string());
        }
        self.resources = resources;
        Ok(())
    }

    /// Append the next resource down the tree
    pub fn add_child(&mut self, name: &str) {
        self.resources.push(name.to_string());
    }

    #[must_use]
    pub fn first_resc(&self) -> Option<&str> {
        self.resources.first().map(String::as_str)
    }

    #[must_use]
    pub fn last_resc(&self) -> Option<&str> {
        self.resources.last().map(String::as_str)
    }

    /// Resource that follows `current` in the hierarchy
    #[must_use]
    pub fn next(&self, current: &str) -> Option<&str> {
        self.resources
            .iter()
            .position(|name| name == current)
            .and_then(|idx| self.resources.get(idx + 1))
            .map(String::as_str)
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resources.iter().any(|r| r == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(String::as_str)
    }
}

impl fmt::Display for HierarchyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, name) in self.resources.iter().enumerate() {
            if idx > 0 {
                write!(f, "{HIERARCHY_DELIMITER}")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Root resource name of a hierarchy string
#[must_use]
pub fn first_resource(hier: &str) -> &str {
    hier.split(HIERARCHY_DELIMITER).next().unwrap_or(hier)
}

/// Leaf resource name of a hierarchy string
#[must_use]
pub fn last_resource(hier: &str) -> &str {
    hier.rsplit(HIERARCHY_DELIMITER).next().unwrap_or(hier)
}

/// Resource following `current` in a hierarchy string
#[must_use]
pub fn next_resource<'a>(hier: &'a str, current: &str) -> Option<&'a str> {
    let mut names = hier.split(HIERARCHY_DELIMITER);
    names.by_ref().find(|name| *name == current)?;
    names.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_format() {
        let mut parser = HierarchyParser::new();
        parser.add_child("rr");
        parser.add_child("pt");
        parser.add_child("leaf");
        assert_eq!(parser.to_string(), "rr/pt/leaf");
        assert_eq!(parser.num_levels(), 3);
        assert_eq!(parser.first_resc(), Some("rr"));
        assert_eq!(parser.last_resc(), Some("leaf"));
        assert_eq!(parser.next("rr"), Some("pt"));
        assert_eq!(parser.next("leaf"), None);
        assert_eq!(parser.next("missing"), None);
    }

    #[test]
    fn test_parse_rejects_empty_components() {
        assert!(HierarchyParser::parse("").is_err());
        assert!(HierarchyParser::parse("a//b").is_err());
        assert!(HierarchyParser::parse("a/").is_err());
        let parser = HierarchyParser::parse("a/b").unwrap();
        assert!(parser.contains("b"));
        assert_eq!(parser.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(first_resource("a/b/c"), "a");
        assert_eq!(last_resource("a/b/c"), "c");
        assert_eq!(last_resource("single"), "single");
        assert_eq!(next_resource("a/b/c", "b"), Some("c"));
        assert_eq!(next_resource("a/b/c", "c"), None);
        assert_eq!(next_resource("a/b/c", "x"), None);
    }
}
