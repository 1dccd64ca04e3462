//! Pattern classifier: pulls findings (addresses, credentials, services, ...)
//! out of command output.
//!
//! The patterns are plain data in [`DEFAULT_PATTERNS`]; [`PatternTable`]
//! compiles them once. Classification never fails, a chunk without matches
//! simply adds nothing.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Addresses,
    Ipv6Addresses,
    MacAddresses,
    Urls,
    Emails,
    Usernames,
    Credentials,
    Hashes,
    Ports,
    Services,
    Domains,
    ApiKeys,
    PrivateKeys,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Addresses,
        Category::Ipv6Addresses,
        Category::MacAddresses,
        Category::Urls,
        Category::Emails,
        Category::Usernames,
        Category::Credentials,
        Category::Hashes,
        Category::Ports,
        Category::Services,
        Category::Domains,
        Category::ApiKeys,
        Category::PrivateKeys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Addresses => "addresses",
            Category::Ipv6Addresses => "ipv6_addresses",
            Category::MacAddresses => "mac_addresses",
            Category::Urls => "urls",
            Category::Emails => "emails",
            Category::Usernames => "usernames",
            Category::Credentials => "credentials",
            Category::Hashes => "hashes",
            Category::Ports => "ports",
            Category::Services => "services",
            Category::Domains => "domains",
            Category::ApiKeys => "api_keys",
            Category::PrivateKeys => "private_keys",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// How a match becomes a stored value.
#[derive(Debug, Clone, Copy)]
pub enum Capture {
    Whole,
    Group(usize),
    /// Join several groups, e.g. `22/tcp open ssh` -> `22:ssh`.
    Composite(&'static [usize], &'static str),
}

/// One row of the pattern table.
#[derive(Debug, Clone, Copy)]
pub struct PatternSpec {
    pub category: Category,
    pub pattern: &'static str,
    pub capture: Capture,
    /// Skip this row for chunks containing a false-positive phrase.
    pub guarded: bool,
    pub exclude: &'static [&'static str],
    pub min_len: usize,
    /// Drop values made only of digits and dots (IPs seen as domains).
    pub reject_numeric: bool,
}

impl PatternSpec {
    const fn new(category: Category, pattern: &'static str, capture: Capture) -> Self {
        Self {
            category,
            pattern,
            capture,
            guarded: false,
            exclude: &[],
            min_len: 0,
            reject_numeric: false,
        }
    }

    const fn guarded(mut self) -> Self {
        self.guarded = true;
        self
    }

    const fn excluding(mut self, values: &'static [&'static str]) -> Self {
        self.exclude = values;
        self
    }

    const fn min_len(mut self, len: usize) -> Self {
        self.min_len = len;
        self
    }

    const fn reject_numeric(mut self) -> Self {
        self.reject_numeric = true;
        self
    }
}

/// Phrases that mark a password *prompt* rather than a password value.
pub const FALSE_POSITIVE_PHRASES: &[&str] = &["password:", "enter password", "new password"];

pub const DEFAULT_PATTERNS: &[PatternSpec] = &[
    PatternSpec::new(
        Category::Addresses,
        r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
        Capture::Whole,
    )
    .excluding(&["127.0.0.1", "0.0.0.0"]),
    PatternSpec::new(
        Category::Ipv6Addresses,
        r"(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}",
        Capture::Whole,
    ),
    PatternSpec::new(
        Category::MacAddresses,
        r"(?:[0-9a-f]{2}[:-]){5}[0-9a-f]{2}",
        Capture::Whole,
    ),
    PatternSpec::new(
        Category::Urls,
        r#"https?://[^\s<>"{}|\\^`\[\]]+"#,
        Capture::Whole,
    ),
    PatternSpec::new(
        Category::Emails,
        r"\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
        Capture::Whole,
    ),
    PatternSpec::new(
        Category::Usernames,
        r"(?:user(?:name)?|login|uname)[\s:=]+([a-z0-9._-]+)",
        Capture::Group(1),
    ),
    PatternSpec::new(
        Category::Credentials,
        r"(?:pass(?:word)?|passwd|pwd)[\s:=]+(\S+)",
        Capture::Group(1),
    )
    .guarded(),
    PatternSpec::new(Category::Hashes, r"\b[a-f0-9]{32,128}\b", Capture::Whole),
    PatternSpec::new(
        Category::Ports,
        r"port\s+(\d{1,5})(?:/tcp|/udp)?(?:\s+open)?",
        Capture::Group(1),
    ),
    PatternSpec::new(
        Category::Services,
        r"(\d{1,5})/(?:tcp|udp)\s+open\s+(\S+)",
        Capture::Composite(&[1, 2], ":"),
    ),
    PatternSpec::new(
        Category::Domains,
        r"\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\b",
        Capture::Whole,
    )
    .min_len(4)
    .reject_numeric(),
    PatternSpec::new(
        Category::ApiKeys,
        r"(?:api[_-]?key|apikey|access[_-]?token)[\s:=]+([a-z0-9_-]{20,})",
        Capture::Group(1),
    )
    .guarded(),
    PatternSpec::new(
        Category::PrivateKeys,
        r"-----BEGIN (?:RSA |DSA |EC )?PRIVATE KEY-----",
        Capture::Whole,
    )
    .guarded(),
];

struct CompiledPattern {
    spec: PatternSpec,
    regex: Regex,
}

impl CompiledPattern {
    fn values<'t>(&'t self, text: &'t str) -> impl Iterator<Item = String> + 't {
        self.regex.captures_iter(text).filter_map(move |caps| {
            let value = match self.spec.capture {
                Capture::Whole => caps.get(0)?.as_str().to_string(),
                Capture::Group(i) => caps.get(i)?.as_str().to_string(),
                Capture::Composite(groups, sep) => {
                    let parts: Option<Vec<&str>> =
                        groups.iter().map(|&g| caps.get(g).map(|m| m.as_str())).collect();
                    parts?.join(sep)
                }
            };
            self.keep(&value).then_some(value)
        })
    }

    fn keep(&self, value: &str) -> bool {
        if value.is_empty() || value.chars().count() < self.spec.min_len {
            return false;
        }
        if self.spec.exclude.contains(&value) {
            return false;
        }
        if self.spec.reject_numeric && value.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return false;
        }
        true
    }
}

/// The compiled category table.
pub struct PatternTable {
    patterns: Vec<CompiledPattern>,
    guard_phrases: Vec<String>,
}

static DEFAULT_TABLE: Lazy<PatternTable> = Lazy::new(|| {
    PatternTable::new(DEFAULT_PATTERNS, FALSE_POSITIVE_PHRASES)
        .expect("built-in highlight patterns compile")
});

impl PatternTable {
    pub fn new(specs: &[PatternSpec], guard_phrases: &[&str]) -> Result<Self, regex::Error> {
        let patterns = specs
            .iter()
            .map(|spec| {
                let regex = RegexBuilder::new(spec.pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()?;
                Ok(CompiledPattern { spec: *spec, regex })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            patterns,
            guard_phrases: guard_phrases.iter().map(|p| p.to_lowercase()).collect(),
        })
    }

    pub fn builtin() -> &'static PatternTable {
        &DEFAULT_TABLE
    }

    fn is_guarded_context(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.guard_phrases.iter().any(|p| lower.contains(p.as_str()))
    }

    /// All findings in `text`, in table order.
    pub fn extract(&self, text: &str) -> Vec<(Category, String)> {
        let guarded_context = self.is_guarded_context(text);
        let mut found = Vec::new();
        for pattern in &self.patterns {
            if pattern.spec.guarded && guarded_context {
                continue;
            }
            found.extend(pattern.values(text).map(|v| (pattern.spec.category, v)));
        }
        found
    }

    /// Add the findings of `text` to `set`, returning how many were new.
    pub fn classify_into(&self, text: &str, set: &mut HighlightSet) -> usize {
        self.extract(text)
            .into_iter()
            .filter(|(category, value)| set.insert(*category, value.clone()))
            .count()
    }
}

/// Findings of one engagement, with set semantics per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HighlightSet {
    entries: BTreeMap<Category, BTreeSet<String>>,
}

impl HighlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the value was already present.
    pub fn insert(&mut self, category: Category, value: impl Into<String>) -> bool {
        self.entries.entry(category).or_default().insert(value.into())
    }

    pub fn contains(&self, category: Category, value: &str) -> bool {
        self.entries
            .get(&category)
            .is_some_and(|values| values.contains(value))
    }

    pub fn values(&self, category: Category) -> impl Iterator<Item = &str> {
        self.entries
            .get(&category)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &BTreeSet<String>)> {
        self.entries
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(c, values)| (*c, values))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn merge(&mut self, other: &HighlightSet) -> usize {
        let mut added = 0;
        for (category, values) in other.iter() {
            for value in values {
                if self.insert(category, value.clone()) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
