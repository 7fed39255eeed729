//! Sender allow-list filter.

use std::collections::BTreeSet;

/// Normalized sender allow-list.
///
/// Entries are one of:
/// - `*`: every well-formed sender is accepted
/// - `user@example.com`: exact address match
/// - `example.com` or `@example.com`: the domain and any subdomain
///
/// An empty list accepts nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// Parse a comma-separated list, e.g. `"alice@a.com, b.org"`.
    pub fn from_csv(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Decide whether a message from `sender` may proceed.
///
/// `sender` may be a bare address or a display form like `Alice <alice@a.com>`.
/// Malformed or empty senders are rejected.
pub fn accept(sender: &str, allow_list: &AllowList) -> bool {
    let Some(address) = extract_address(sender) else {
        return false;
    };
    if allow_list.entries.contains("*") {
        return true;
    }
    let Some((_, domain)) = address.rsplit_once('@') else {
        return false;
    };

    allow_list.entries.iter().any(|entry| {
        if let Some(d) = entry.strip_prefix('@') {
            domain_matches(domain, d)
        } else if entry.contains('@') {
            *entry == address
        } else {
            domain_matches(domain, entry)
        }
    })
}

fn domain_matches(domain: &str, allowed: &str) -> bool {
    domain == allowed
        || domain
            .strip_suffix(allowed)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Pull the bare, lowercased address out of a sender header value.
///
/// Returns `None` unless the result has exactly one `@`, a non-empty local
/// part, and a domain that neither starts nor ends with a dot.
pub fn extract_address(sender: &str) -> Option<String> {
    let trimmed = sender.trim();
    let candidate = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    let candidate = candidate.trim().to_lowercase();

    let (local, domain) = candidate.split_once('@')?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || candidate.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
    {
        return None;
    }
    Some(candidate)
}
