//! The [`FieldSet`] type, a set of field names used as a backend projection.

use std::collections::btree_set::{self, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::iter::FromIterator;

use serde::{Deserialize, Serialize};

/// A deduplicated set of field names.
///
/// A `FieldSet` is never modified in place once it has been handed out;
/// combining two sets with [`union`](FieldSet::union) produces a new one. The
/// names are kept in sorted order, so iteration (and therefore every log line
/// and every projection sent to a backend) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet {
    fields: BTreeSet<String>,
}

impl FieldSet {
    /// Create an empty field set.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// True if every field in `self` is also in `other`.
    pub fn is_subset(&self, other: &FieldSet) -> bool {
        self.fields.is_subset(&other.fields)
    }

    /// Create a new field set containing every field from both sets.
    pub fn union(&self, other: &FieldSet) -> FieldSet {
        // Avoid rebuilding the tree when one side adds nothing
        if other.is_subset(self) {
            return self.clone();
        }
        if self.is_subset(other) {
            return other.clone();
        }

        FieldSet {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }

    /// Iterate over the field names, in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> + Clone {
        self.fields.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for FieldSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        FieldSet {
            fields: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for FieldSet {
    fn from(fields: [S; N]) -> Self {
        fields.into_iter().collect()
    }
}

impl IntoIterator for FieldSet {
    type Item = String;
    type IntoIter = btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a FieldSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl Display for FieldSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter();
        if let Some(first) = iter.next() {
            f.write_str(first)?;
            for field in iter {
                write!(f, ",{}", field)?;
            }
        }
        Ok(())
    }
}
