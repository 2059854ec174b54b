//! Query shapes: the equality filters that identify one watched result set.
//!
//! A shape is part of the registry key, so two shapes that filter the same
//! fields to the same values must compare and hash equal regardless of the
//! order they were built in. A `BTreeMap` gives that for free.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::FieldBag;

/// A set of `field == value` filters. Empty means the whole collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryShape {
    filters: BTreeMap<String, String>,
}

impl QueryShape {
    /// The whole collection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add (or replace) an equality filter.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether a document's fields satisfy every filter.
    ///
    /// Only string-valued fields can match; filters compare as text.
    pub fn matches(&self, fields: &FieldBag) -> bool {
        self.filters.iter().all(|(field, want)| match fields.get(field) {
            Some(Value::String(have)) => have == want,
            _ => false,
        })
    }
}

impl FromIterator<(String, String)> for QueryShape {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            return f.write_str("*");
        }
        for (i, (field, value)) in self.filters.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{field}=={value}")?;
        }
        Ok(())
    }
}
