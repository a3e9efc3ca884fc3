//! Document id and query field name utilities.
//!
//! Document ids compare case-insensitively; query field names are emitted
//! verbatim when they are plain identifiers and quoted otherwise.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

/// Normalize a document id for identity lookups (ids are case-insensitive).
#[inline]
pub fn normalize_id(id: &str) -> String {
    id.to_lowercase()
}

/// Whether the id is a prefix the server completes (ends with the separator).
#[inline]
pub fn is_prefix_id(id: &str, separator: char) -> bool {
    id.ends_with(separator)
}

/// Suffix reserved for server-generated identity values.
pub const SERVER_IDENTITY_SUFFIX: char = '|';

/// Field names rendered as-is (function-style pseudo fields).
const PSEUDO_FIELDS: &[&str] = &["id()", "key()", "count()", "score()", "random()"];

/// Escape a field name for query text if it is not a plain identifier.
///
/// A plain identifier starts with a letter, `_` or `@` and continues with
/// letters, digits, `_`, `-`, `@`, `.`, `[` or `]`. Quoted sections (`'…'` or
/// `"…"`) inside the name are left alone. Anything else is wrapped in single
/// quotes with embedded single quotes backslash-escaped.
///
/// # Examples
///
/// ```
/// use docdb_core::escape_field_if_necessary;
///
/// assert_eq!(escape_field_if_necessary("Name"), "Name");
/// assert_eq!(escape_field_if_necessary("Address.City"), "Address.City");
/// assert_eq!(escape_field_if_necessary("Lines[].Price"), "Lines[].Price");
/// assert_eq!(escape_field_if_necessary("First Name"), "'First Name'");
/// assert_eq!(escape_field_if_necessary("1st"), "'1st'");
/// ```
pub fn escape_field_if_necessary(name: &str) -> String {
    if name.is_empty() || PSEUDO_FIELDS.contains(&name) {
        return name.to_string();
    }

    let mut escape = false;
    let mut inside_escaped = false;
    for (i, c) in name.chars().enumerate() {
        if c == '\'' || c == '"' {
            inside_escaped = !inside_escaped;
            continue;
        }
        if inside_escaped {
            continue;
        }
        let legal = if i == 0 {
            c.is_ascii_alphabetic() || c == '_' || c == '@'
        } else {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '@' | '.' | '[' | ']')
        };
        if !legal {
            escape = true;
            break;
        }
    }

    if escape || inside_escaped {
        format!("'{}'", name.replace('\'', "\\'"))
    } else {
        name.to_string()
    }
}

/// Whether an include path must be quoted in the `include` clause.
pub fn include_requires_quotes(path: &str) -> bool {
    path.chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']' | '@')))
}

/// Quote an include path if necessary.
pub fn escape_include(path: &str) -> String {
    if include_requires_quotes(path) {
        format!("'{}'", path.replace('\'', "\\'"))
    } else {
        path.to_string()
    }
}

const PARAMETER_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Thread-safe cache of compiled patterns.
struct RegexCache {
    cache: RwLock<HashMap<&'static str, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &'static str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern, regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check whether `name` is usable as an explicit `$name` query parameter.
pub fn is_valid_parameter_name(name: &str) -> bool {
    match regex_cache().get_or_compile(PARAMETER_NAME_PATTERN) {
        Ok(regex) => regex.is_match(name),
        Err(e) => {
            tracing::warn!(error = %e, "Parameter name pattern failed to compile");
            false
        }
    }
}
