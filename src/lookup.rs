//! Local selection over listed objects for data sources.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::ProviderError;

/// An object that data sources can select by name.
pub trait Named {
    /// The object's name.
    fn name(&self) -> &str;

    /// Creation time, used by `most_recent` selection.
    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// How to match names.
#[derive(Debug, Clone)]
pub enum NameFilter {
    /// Exact name.
    Exact(String),
    /// Regular expression over the name.
    Regex(Regex),
}

impl NameFilter {
    /// Build a regex filter, reporting an invalid pattern as a validation error.
    pub fn regex(pattern: &str) -> Result<Self, ProviderError> {
        Ok(NameFilter::Regex(compile_regex(pattern)?))
    }

    /// Whether `name` matches.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Exact(expected) => expected == name,
            NameFilter::Regex(re) => re.is_match(name),
        }
    }

    fn describe(&self) -> String {
        match self {
            NameFilter::Exact(name) => name.clone(),
            NameFilter::Regex(re) => re.as_str().to_string(),
        }
    }
}

/// Compile a user-supplied pattern.
pub fn compile_regex(pattern: &str) -> Result<Regex, ProviderError> {
    Regex::new(pattern)
        .map_err(|e| ProviderError::Validation(format!("invalid name_regex {:?}: {}", pattern, e)))
}

/// Select exactly one object whose name matches `filter`.
///
/// With `most_recent`, several matches resolve to the one created last.
pub fn find_one<T: Named>(
    items: Vec<T>,
    kind: &str,
    filter: &NameFilter,
    most_recent: bool,
) -> Result<T, ProviderError> {
    let mut matches: Vec<T> = items
        .into_iter()
        .filter(|item| filter.matches(item.name()))
        .collect();

    match matches.len() {
        0 => Err(ProviderError::NotFound(format!(
            "no {} found with name {}",
            kind,
            filter.describe()
        ))),
        1 => Ok(matches.remove(0)),
        _ if most_recent => {
            let newest = matches
                .iter()
                .enumerate()
                .max_by_key(|(_, item)| item.created_at())
                .map(|(i, _)| i)
                .unwrap_or(0);
            Ok(matches.swap_remove(newest))
        },
        n => Err(ProviderError::Validation(format!(
            "too many {} found with name {} (found {}, expected 1)",
            kind,
            filter.describe(),
            n
        ))),
    }
}

/// Keep the objects whose names match `filter`, sorted by name.
pub fn filter_by_name<T: Named>(items: Vec<T>, filter: Option<&NameFilter>) -> Vec<T> {
    let mut kept: Vec<T> = match filter {
        Some(filter) => items
            .into_iter()
            .filter(|item| filter.matches(item.name()))
            .collect(),
        None => items,
    };
    kept.sort_by(|a, b| a.name().cmp(b.name()));
    kept
}

/// Parse an RFC 3339 timestamp, treating garbage as absent.
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Snap {
        name: &'static str,
        created: &'static str,
    }

    impl Named for Snap {
        fn name(&self) -> &str {
            self.name
        }

        fn created_at(&self) -> Option<DateTime<Utc>> {
            parse_timestamp(Some(self.created))
        }
    }

    fn snaps() -> Vec<Snap> {
        vec![
            Snap { name: "nightly-1", created: "2024-01-01T00:00:00Z" },
            Snap { name: "nightly-2", created: "2024-03-01T00:00:00Z" },
            Snap { name: "weekly", created: "2024-02-01T00:00:00Z" },
        ]
    }

    #[test]
    fn test_exact_match() {
        let found = find_one(snaps(), "snapshot", &NameFilter::Exact("weekly".into()), false).unwrap();
        assert_eq!(found.name, "weekly");
    }

    #[test]
    fn test_no_match() {
        let err = find_one(snaps(), "snapshot", &NameFilter::Exact("monthly".into()), false).unwrap_err();
        assert_eq!(err.message(), "no snapshot found with name monthly");
    }

    #[test]
    fn test_too_many() {
        let filter = NameFilter::regex("^nightly").unwrap();
        let err = find_one(snaps(), "snapshot", &filter, false).unwrap_err();
        assert_eq!(
            err.message(),
            "too many snapshot found with name ^nightly (found 2, expected 1)"
        );
    }

    #[test]
    fn test_most_recent() {
        let filter = NameFilter::regex("^nightly").unwrap();
        let found = find_one(snaps(), "snapshot", &filter, true).unwrap();
        assert_eq!(found.name, "nightly-2");
    }

    #[test]
    fn test_invalid_regex() {
        assert!(matches!(NameFilter::regex("("), Err(ProviderError::Validation(_))));
    }

    #[test]
    fn test_filter_by_name() {
        let filter = NameFilter::regex("ly").unwrap();
        let kept = filter_by_name(snaps(), Some(&filter));
        assert_eq!(kept.len(), 3);
        let kept = filter_by_name(snaps(), Some(&NameFilter::regex("^week").unwrap()));
        assert_eq!(kept.len(), 1);
        assert_eq!(filter_by_name(snaps(), None)[0].name, "nightly-1");
    }
}
