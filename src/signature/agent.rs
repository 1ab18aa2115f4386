//! `Signature-Agent` interpretation.
//!
//! The field tells the verifier where to find the signer's public key. Two
//! wire forms are accepted:
//!
//! - **Legacy**: a single bare URL, optionally wrapped in quotes or angle
//!   brackets (`<…>`).
//! - **Dictionary** (preferred): an RFC 8941 dictionary keyed by signature
//!   label, each member carrying a directory URI string.
//!
//! No further forms are accepted.

use thiserror::Error;

use crate::sfv::{Dictionary, Item, MemberValue};

/// `Signature-Agent` interpretation failure. Surfaces as
/// `invalid_signature_agent`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The field is empty or carries no usable URI.
    #[error("Signature-Agent carries no directory URI")]
    Empty,

    /// Dictionary form without a member for the label being verified.
    #[error("Signature-Agent has no entry for label '{0}'")]
    MissingLabel(String),

    /// Dictionary form whose member for the label is not a string.
    #[error("Signature-Agent entry for label '{0}' is not a string")]
    NotAString(String),
}

/// Resolve the directory URI for `label` from a `Signature-Agent` value.
///
/// Dictionary form is tried first; anything that does not parse as a
/// dictionary falls back to the legacy single-URL form. Surrounding angle
/// brackets and quotes are stripped in either case.
///
/// # Errors
///
/// Returns [`AgentError`] when the field is empty, or when dictionary form
/// lacks a usable member for `label`.
pub fn directory_for_label(value: &str, label: &str) -> Result<String, AgentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AgentError::Empty);
    }

    if let Ok(dict) = Dictionary::parse(trimmed) {
        if looks_like_agent_dictionary(&dict) {
            let member = dict
                .get(label)
                .ok_or_else(|| AgentError::MissingLabel(label.to_string()))?;
            let MemberValue::Item(item) = &member.value else {
                return Err(AgentError::NotAString(label.to_string()));
            };
            let uri = item
                .as_str()
                .ok_or_else(|| AgentError::NotAString(label.to_string()))?;
            let uri = strip_wrapping(uri);
            if uri.is_empty() {
                return Err(AgentError::Empty);
            }
            return Ok(uri.to_string());
        }
    }

    let uri = strip_wrapping(trimmed);
    if uri.is_empty() {
        return Err(AgentError::Empty);
    }
    Ok(uri.to_string())
}

/// A parsed dictionary only counts as dictionary form when every member
/// carries an explicit value. A lone hostname such as `directory.example`
/// parses as a bare boolean key and must fall back to the legacy
/// interpretation; anything with `label=value` shape is dictionary form
/// (non-string values are then rejected during selection).
fn looks_like_agent_dictionary(dict: &Dictionary) -> bool {
    !dict.members.is_empty()
        && dict
            .members
            .iter()
            .all(|(_, m)| !matches!(m.value, MemberValue::Item(Item::Boolean(_))))
}

/// Strip one layer of angle brackets and one layer of quotes.
fn strip_wrapping(value: &str) -> &str {
    let mut v = value.trim();
    if v.len() >= 2 && v.starts_with('<') && v.ends_with('>') {
        v = v[1..v.len() - 1].trim();
    }
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v = v[1..v.len() - 1].trim();
    }
    v
}
