//! Header table with lookup by name and comma-list iteration
//!
//! Not an HTTP parser; just the access surface the variant matcher and the
//! session handler need.

/// Space or horizontal tab
#[inline]
pub fn issp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// An ordered set of header name/value pairs
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    /// Create an empty header set
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a header; duplicate names are kept and the first wins on lookup
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Look up a header by name, case-insensitive
    ///
    /// The returned value has leading whitespace removed; trailing
    /// whitespace is left for the caller to decide about.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim_start_matches(|c| c == ' ' || c == '\t'))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all (name, value) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Iterate the items of a comma-separated header value, whitespace-trimmed,
/// empty items skipped
pub fn comma_items(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(|item| item.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|item| !item.is_empty())
}
