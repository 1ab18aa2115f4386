//! Signature material: parsed `Signature-Input` and `Signature` fields.
//!
//! `Signature-Input` maps signature labels to an inner list of covered
//! components plus the signature parameters (`created`, `expires`, `nonce`,
//! `keyid`, `alg`, `tag`). `Signature` maps the same labels to the raw
//! signature bytes. Both are RFC 8941 dictionaries parsed by [`crate::sfv`].

pub mod agent;
pub mod base;

use thiserror::Error;

use crate::sfv::{self, Dictionary, Item, MemberValue, Parameters, param};

/// A malformed signature field. Surfaces as `invalid_structured_field`.
#[derive(Debug, Error)]
pub enum FieldError {
    /// The field is not a parseable RFC 8941 dictionary.
    #[error(transparent)]
    Parse(#[from] sfv::ParseError),

    /// The field parsed but does not have the shape RFC 9421 requires.
    #[error("malformed signature field: {0}")]
    Malformed(String),
}

/// One covered component from a `Signature-Input` inner list: a header name
/// or a `@`-prefixed derived component, with its parameters (notably
/// `key="…"` for dictionary-member selection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveredComponent {
    /// Component name as signed (lowercase header name or `@derived`)
    pub name: String,
    /// Component parameters
    pub params: Parameters,
}

impl CoveredComponent {
    /// Whether this is a derived component (`@method`, `@target-uri`, …).
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.name.starts_with('@')
    }

    /// The `key` parameter value, if present.
    #[must_use]
    pub fn key_param(&self) -> Option<&str> {
        param(&self.params, "key").and_then(Item::as_str)
    }
}

/// One label's entry in `Signature-Input`.
#[derive(Debug, Clone)]
pub struct SignatureEntry {
    /// Covered components in signed order
    pub components: Vec<CoveredComponent>,
    /// `created` parameter (unix seconds)
    pub created: Option<i64>,
    /// `expires` parameter (unix seconds)
    pub expires: Option<i64>,
    /// `nonce` parameter
    pub nonce: Option<String>,
    /// `keyid` parameter (RFC 7638 JWK thumbprint)
    pub keyid: Option<String>,
    /// `alg` parameter (`ed25519` is the only supported value)
    pub alg: Option<String>,
    /// Informational `tag` parameter
    pub tag: Option<String>,
    /// Exact source bytes of the inner list plus parameters, re-emitted on
    /// the `@signature-params` base line
    pub raw: String,
}

/// Parsed `Signature-Input` field: label → entry, wire order preserved.
#[derive(Debug, Clone)]
pub struct SignatureInput {
    /// Entries in wire order
    pub entries: Vec<(String, SignatureEntry)>,
}

impl SignatureInput {
    /// Parse a `Signature-Input` field value.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] when the dictionary is malformed, a member is
    /// not an inner list, or a covered component is not a string item.
    pub fn parse(value: &str) -> Result<Self, FieldError> {
        let dict = Dictionary::parse(value)?;
        if dict.members.is_empty() {
            return Err(FieldError::Malformed(
                "Signature-Input has no labels".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(dict.members.len());
        for (label, member) in dict.members {
            let MemberValue::InnerList(items) = &member.value else {
                return Err(FieldError::Malformed(format!(
                    "label '{label}' is not an inner list"
                )));
            };

            let mut components = Vec::with_capacity(items.len());
            for (item, params) in items {
                let Item::String(name) = item else {
                    return Err(FieldError::Malformed(format!(
                        "covered component in '{label}' is not a string"
                    )));
                };
                components.push(CoveredComponent {
                    name: name.clone(),
                    params: params.clone(),
                });
            }

            let as_string =
                |key: &str| param(&member.params, key).and_then(Item::as_str).map(String::from);

            let created = param(&member.params, "created").and_then(Item::as_integer);
            let expires = param(&member.params, "expires").and_then(Item::as_integer);
            let nonce = as_string("nonce");
            let keyid = as_string("keyid");
            let alg = as_string("alg");
            let tag = as_string("tag");

            entries.push((
                label,
                SignatureEntry {
                    components,
                    created,
                    expires,
                    nonce,
                    keyid,
                    alg,
                    tag,
                    raw: member.raw,
                },
            ));
        }

        Ok(Self { entries })
    }

    /// The entry for `label`, if present.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, e)| e)
    }

    /// The first label in wire order.
    #[must_use]
    pub fn first_label(&self) -> Option<&str> {
        self.entries.first().map(|(l, _)| l.as_str())
    }
}

/// Parse a `Signature` field value into label → raw signature bytes.
///
/// # Errors
///
/// Returns [`FieldError`] when the dictionary is malformed or a member is
/// not a byte sequence.
pub fn parse_signatures(value: &str) -> Result<Vec<(String, Vec<u8>)>, FieldError> {
    let dict = Dictionary::parse(value)?;
    let mut out = Vec::with_capacity(dict.members.len());
    for (label, member) in dict.members {
        let MemberValue::Item(Item::ByteSequence(bytes)) = member.value else {
            return Err(FieldError::Malformed(format!(
                "signature '{label}' is not a byte sequence"
            )));
        };
        out.push((label, bytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_full_signature_input_entry() {
        // GIVEN: the E1 Signature-Input value
        let value = r#"sig1=("@method" "@target-uri");created=1700000000;keyid="K1";alg="ed25519";nonce="n1""#;

        // WHEN: parsed
        let input = SignatureInput::parse(value).unwrap();

        // THEN: label, components, and all parameters are extracted
        assert_eq!(input.first_label(), Some("sig1"));
        let entry = input.get("sig1").unwrap();
        assert_eq!(entry.components.len(), 2);
        assert_eq!(entry.components[0].name, "@method");
        assert!(entry.components[0].is_derived());
        assert_eq!(entry.created, Some(1_700_000_000));
        assert_eq!(entry.expires, None);
        assert_eq!(entry.keyid.as_deref(), Some("K1"));
        assert_eq!(entry.alg.as_deref(), Some("ed25519"));
        assert_eq!(entry.nonce.as_deref(), Some("n1"));
    }

    #[test]
    fn key_param_is_exposed() {
        let value = r#"sig1=("signature-agent";key="sig1")"#;
        let input = SignatureInput::parse(value).unwrap();
        let component = &input.get("sig1").unwrap().components[0];
        assert!(!component.is_derived());
        assert_eq!(component.key_param(), Some("sig1"));
    }

    #[test]
    fn label_order_is_preserved() {
        let value = r#"sigb=("@method");created=1, siga=("@path");created=2"#;
        let input = SignatureInput::parse(value).unwrap();
        assert_eq!(input.first_label(), Some("sigb"));
        assert!(input.get("siga").is_some());
    }

    #[test]
    fn rejects_item_member() {
        // A label mapping to a bare item instead of an inner list
        assert!(SignatureInput::parse(r#"sig1="@method""#).is_err());
    }

    #[test]
    fn rejects_token_components() {
        // Covered components must be quoted strings
        assert!(SignatureInput::parse("sig1=(foo)").is_err());
    }

    #[test]
    fn rejects_empty_field() {
        assert!(SignatureInput::parse("").is_err());
    }

    #[test]
    fn parses_signature_bytes() {
        let sigs = parse_signatures("sig1=:SGVsbG8=:").unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].0, "sig1");
        assert_eq!(sigs[0].1, b"Hello");
    }

    #[test]
    fn rejects_string_signature() {
        assert!(parse_signatures(r#"sig1="not-bytes""#).is_err());
    }
}
