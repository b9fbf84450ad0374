//! Field filters shared by the log and trace query paths. A filter names a
//! field (a known field or an attribute key), a condition, and a value;
//! string comparison is ASCII case-insensitive throughout.

use serde::{Deserialize, Serialize};

/// A page of query results plus the total count after filtering.
#[derive(Debug, Clone)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total_item_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals,
    NotEqual,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub condition: FilterCondition,
    pub value: String,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, condition: FilterCondition, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition,
            value: value.into(),
        }
    }

    /// Applies the condition to a candidate field value. A `None` candidate
    /// (the field does not exist on the record) only satisfies `NotEqual`.
    pub fn matches(&self, candidate: Option<&str>) -> bool {
        match candidate {
            Some(actual) => self.condition.apply(actual, &self.value),
            None => self.condition == FilterCondition::NotEqual,
        }
    }
}

impl FilterCondition {
    pub fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            FilterCondition::Equals => actual.eq_ignore_ascii_case(expected),
            FilterCondition::NotEqual => !actual.eq_ignore_ascii_case(expected),
            FilterCondition::Contains => contains_ignore_ascii_case(actual, expected),
        }
    }
}

pub fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}
