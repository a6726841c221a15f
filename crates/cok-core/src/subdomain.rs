//! Subdomain label validation.
//!
//! A subdomain selects the tunnel, so it must be a well-formed single DNS
//! label (RFC 1123 shape) and must not collide with operational endpoints of
//! the gateway itself. Validation normalizes first (lowercase, trimmed) and
//! then walks a ladder of checks, returning the first failure.

use std::collections::HashSet;

use cok_protocol::{MAX_SUBDOMAIN_LEN, MIN_SUBDOMAIN_LEN};

/// Labels that name gateway infrastructure and can never be tunnels.
const RESERVED_LABELS: &[&str] = &[
    "admin",
    "api",
    "app",
    "console",
    "dashboard",
    "dns",
    "ftp",
    "gateway",
    "health",
    "internal",
    "localhost",
    "mail",
    "metrics",
    "ns1",
    "ns2",
    "proxy",
    "root",
    "smtp",
    "staging",
    "status",
    "system",
    "www",
];

/// Why a label was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubdomainError {
    /// Nothing left after trimming.
    Empty,
    /// Fewer than the minimum number of characters.
    TooShort { len: usize },
    /// More than a DNS label allows.
    TooLong { len: usize },
    /// Starts or ends with a hyphen.
    EdgeHyphen,
    /// Contains a double hyphen.
    ConsecutiveHyphens,
    /// Contains a character outside `[a-z0-9-]`.
    InvalidCharacter { ch: char },
    /// Collides with a reserved operational label.
    Reserved,
    /// Exact match against the operator's deny list.
    Denied,
}

impl std::fmt::Display for SubdomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubdomainError::Empty => write!(f, "subdomain is empty"),
            SubdomainError::TooShort { len } => {
                write!(
                    f,
                    "subdomain is {} characters, minimum is {}",
                    len, MIN_SUBDOMAIN_LEN
                )
            }
            SubdomainError::TooLong { len } => {
                write!(
                    f,
                    "subdomain is {} characters, maximum is {}",
                    len, MAX_SUBDOMAIN_LEN
                )
            }
            SubdomainError::EdgeHyphen => {
                write!(f, "subdomain cannot start or end with a hyphen")
            }
            SubdomainError::ConsecutiveHyphens => {
                write!(f, "subdomain cannot contain consecutive hyphens")
            }
            SubdomainError::InvalidCharacter { ch } => {
                write!(f, "subdomain contains invalid character {:?}", ch)
            }
            SubdomainError::Reserved => write!(f, "subdomain is reserved"),
            SubdomainError::Denied => write!(f, "subdomain is not allowed"),
        }
    }
}

impl std::error::Error for SubdomainError {}

/// Validates and normalizes requested subdomain labels.
#[derive(Debug, Clone)]
pub struct SubdomainValidator {
    reserved: HashSet<&'static str>,
    deny_list: HashSet<String>,
}

impl SubdomainValidator {
    /// Validator with the built-in reserved set and an empty deny list.
    pub fn new() -> Self {
        SubdomainValidator {
            reserved: RESERVED_LABELS.iter().copied().collect(),
            deny_list: HashSet::new(),
        }
    }

    /// Validator with an operator-supplied deny list (exact matches only,
    /// compared after normalization).
    pub fn with_deny_list<I, S>(deny_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut validator = Self::new();
        validator.deny_list = deny_list
            .into_iter()
            .map(|s| s.into().trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        validator
    }

    /// Validate `input`, returning the normalized label on success.
    pub fn validate(&self, input: &str) -> Result<String, SubdomainError> {
        let label = input.trim().to_ascii_lowercase();

        if label.is_empty() {
            return Err(SubdomainError::Empty);
        }
        let len = label.chars().count();
        if len < MIN_SUBDOMAIN_LEN {
            return Err(SubdomainError::TooShort { len });
        }
        if len > MAX_SUBDOMAIN_LEN {
            return Err(SubdomainError::TooLong { len });
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(SubdomainError::EdgeHyphen);
        }
        if label.contains("--") {
            return Err(SubdomainError::ConsecutiveHyphens);
        }
        if let Some(ch) = label
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(SubdomainError::InvalidCharacter { ch });
        }
        if self.reserved.contains(label.as_str()) {
            return Err(SubdomainError::Reserved);
        }
        if self.deny_list.contains(&label) {
            return Err(SubdomainError::Denied);
        }

        Ok(label)
    }
}

impl Default for SubdomainValidator {
    fn default() -> Self {
        Self::new()
    }
}
