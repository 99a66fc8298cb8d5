use cloudmirror_core::ItemType;

use crate::sync::item_store::Item;
use crate::sync::paths::{PathCase, is_same_or_descendant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCondition {
    /// Item is the given path or lies below it.
    PathPrefix(String),
    /// Item name matches a `*`/`?` wildcard pattern.
    NamePattern(String),
    Type(ItemType),
    Offline(bool),
}

impl FilterCondition {
    fn matches(&self, item: &Item, case: PathCase) -> bool {
        match self {
            FilterCondition::PathPrefix(prefix) => is_same_or_descendant(&item.path, prefix, case),
            FilterCondition::NamePattern(pattern) => match case {
                PathCase::Sensitive => wildcard_match(pattern, &item.name),
                PathCase::Insensitive => {
                    wildcard_match(&pattern.to_lowercase(), &item.name.to_lowercase())
                }
            },
            FilterCondition::Type(item_type) => item.item_type == *item_type,
            FilterCondition::Offline(offline) => item.offline == *offline,
        }
    }
}

/// Conjunction of conditions; the empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    conditions: Vec<FilterCondition>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn path_prefix(self, prefix: impl Into<String>) -> Self {
        self.with(FilterCondition::PathPrefix(prefix.into()))
    }

    pub fn name_pattern(self, pattern: impl Into<String>) -> Self {
        self.with(FilterCondition::NamePattern(pattern.into()))
    }

    pub fn item_type(self, item_type: ItemType) -> Self {
        self.with(FilterCondition::Type(item_type))
    }

    pub fn offline(self, offline: bool) -> Self {
        self.with(FilterCondition::Offline(offline))
    }

    pub fn conditions(&self) -> &[FilterCondition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, item: &Item, case: PathCase) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.matches(item, case))
    }
}

/// Glob match supporting `*` (any run) and `?` (one character).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, item_type: ItemType) -> Item {
        Item::placeholder(path, item_type)
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.txt", "notes.txt"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("a*b*c", "axxbyy"));
        assert!(!wildcard_match("?", ""));
        assert!(!wildcard_match("*.txt", "notes.md"));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = QueryFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&item("/x", ItemType::File), PathCase::Sensitive));
    }

    #[test]
    fn conditions_are_conjunctive() {
        let filter = QueryFilter::new()
            .path_prefix("/Docs")
            .name_pattern("*.PDF")
            .item_type(ItemType::File);
        let report = item("/Docs/2024/report.pdf", ItemType::File);
        assert!(!filter.matches(&report, PathCase::Sensitive));
        assert!(filter.matches(&report, PathCase::Insensitive));
        assert!(!filter.matches(&item("/Other/report.pdf", ItemType::File), PathCase::Insensitive));
        assert!(!filter.matches(&item("/Docs/x.pdf", ItemType::Folder), PathCase::Insensitive));
    }

    #[test]
    fn offline_condition() {
        let mut pinned = item("/a", ItemType::File);
        pinned.offline = true;
        let filter = QueryFilter::new().offline(true);
        assert!(filter.matches(&pinned, PathCase::Sensitive));
        assert!(!filter.matches(&item("/b", ItemType::File), PathCase::Sensitive));
    }
}
