//! Request classification and covered-header extraction.
//!
//! A request is **signed** when it carries any of the three signature
//! headers; partial sets fail with a precise reason. For signed requests the
//! sidecar forwards to the verifier only what the signature base needs: the
//! three signature headers, `Host`, and every non-derived covered component.
//! Derived components are reconstructed by the verifier from method and URL
//! and are never forwarded as headers. Covered sensitive headers are refused
//! outright.

use axum::http::HeaderMap;

use crate::signature::SignatureInput;
use crate::signature::base::is_sensitive_header;
use crate::verifier::{FailureReason, Verdict};

/// The three signature headers, always forwarded for signed requests.
const SIGNATURE_HEADERS: [&str; 3] = ["signature-input", "signature", "signature-agent"];

/// Outcome of classifying an incoming request.
#[derive(Debug)]
pub enum Classification {
    /// No signature headers at all.
    Unsigned,
    /// All three signature headers present.
    Signed,
    /// Some but not all present; carries the precise failure.
    Partial(Verdict),
}

/// Classify a request by its signature-header footprint.
#[must_use]
pub fn classify(headers: &HeaderMap) -> Classification {
    let has_input = headers.contains_key("signature-input");
    let has_signature = headers.contains_key("signature");
    let has_agent = headers.contains_key("signature-agent");

    if !has_input && !has_signature && !has_agent {
        return Classification::Unsigned;
    }
    if !has_input {
        return Classification::Partial(Verdict::fail(
            FailureReason::MissingSignatureInput,
            "Signature-Input header is missing",
        ));
    }
    if !has_signature {
        return Classification::Partial(Verdict::fail(
            FailureReason::MissingSignature,
            "Signature header is missing",
        ));
    }
    if !has_agent {
        return Classification::Partial(Verdict::fail(
            FailureReason::MissingSignatureAgent,
            "Signature-Agent header is missing",
        ));
    }
    Classification::Signed
}

/// Extract the headers forwarded to the verifier for a signed request.
///
/// Returns lowercased name/value pairs preserving repeated values in order.
///
/// # Errors
///
/// Returns a failed [`Verdict`] when `Signature-Input` is malformed or the
/// covered list names a sensitive header.
pub fn extract_forwarded(
    headers: &HeaderMap,
    label_hint: Option<&str>,
) -> Result<Vec<(String, String)>, Verdict> {
    let input_value = joined_value(headers, "signature-input").ok_or_else(|| {
        Verdict::fail(
            FailureReason::MissingSignatureInput,
            "Signature-Input header is missing",
        )
    })?;
    let input = SignatureInput::parse(&input_value).map_err(|e| {
        Verdict::fail(
            FailureReason::InvalidStructuredField,
            format!("Signature-Input: {e}"),
        )
    })?;

    let label = match label_hint {
        Some(hint) if input.get(hint).is_some() => hint,
        Some(hint) => {
            return Err(Verdict::fail(
                FailureReason::InvalidStructuredField,
                format!("Signature-Input has no entry for configured label '{hint}'"),
            ));
        }
        None => input.first_label().unwrap_or_default(),
    };
    let entry = input.get(label).ok_or_else(|| {
        Verdict::fail(
            FailureReason::InvalidStructuredField,
            "Signature-Input has no labels",
        )
    })?;

    // The shield is a hard rule: these names never reach the verifier, so a
    // signature covering one can never verify
    for component in &entry.components {
        if !component.is_derived() && is_sensitive_header(&component.name) {
            return Err(Verdict::fail(
                FailureReason::SensitiveHeaderInSignature,
                format!("Signature covers sensitive header: {}", component.name),
            ));
        }
    }

    let mut wanted: Vec<&str> = SIGNATURE_HEADERS.to_vec();
    wanted.push("host");
    for component in &entry.components {
        if !component.is_derived() && !wanted.contains(&component.name.as_str()) {
            wanted.push(component.name.as_str());
        }
    }

    let mut forwarded = Vec::new();
    for name in wanted {
        for value in headers.get_all(name) {
            if let Ok(value) = value.to_str() {
                forwarded.push((name.to_string(), value.to_string()));
            }
        }
    }
    Ok(forwarded)
}

/// All values of `name` joined with `", "`.
fn joined_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}
