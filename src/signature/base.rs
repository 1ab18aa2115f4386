//! RFC 9421 §2.5 signature-base reconstruction.
//!
//! The base is the exact byte string the agent signed: one line per covered
//! component (`"<name>"<params>: <value>`) followed by a final
//! `"@signature-params"` line carrying the raw serialization of the label's
//! `Signature-Input` entry, with no trailing newline.

use thiserror::Error;
use url::Url;

use crate::sfv::{Dictionary, serialize_member, serialize_params};

use super::CoveredComponent;

/// Headers the sidecar contract never forwards. A signature covering one of
/// these can never be verified.
pub const SENSITIVE_HEADERS: [&str; 4] = [
    "cookie",
    "authorization",
    "proxy-authorization",
    "www-authenticate",
];

/// Whether `name` (lowercase) is in the sensitive set.
#[must_use]
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name)
}

/// Base construction failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BaseError {
    /// A covered component is neither a known derived component nor a
    /// header present in the request. Surfaces as `missing_covered_header`.
    #[error("Missing covered header: {0}")]
    MissingComponent(String),

    /// The covered list names a header from the sensitive set. Surfaces as
    /// `sensitive_header_in_signature`.
    #[error("Signature covers sensitive header: {0}")]
    SensitiveHeader(String),

    /// A `key` selector points into a header that is not a parseable
    /// structured dictionary. Surfaces as `invalid_structured_field`.
    #[error("Covered header '{0}' is not a structured dictionary")]
    UnparseableDictionary(String),
}

/// Request material the base is reconstructed from. Header names must be
/// lowercase; repeated names carry one entry per value, in received order.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    /// HTTP method (any case; uppercased for `@method`)
    pub method: &'a str,
    /// Effective target URI
    pub target: &'a Url,
    /// Lowercased header name/value pairs
    pub headers: &'a [(String, String)],
}

impl RequestContext<'_> {
    /// All values for `name`, trimmed, in received order.
    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.trim())
            .collect()
    }
}

/// Build the signature base for one label.
///
/// `raw_params` is the exact source slice of the label's `Signature-Input`
/// member (inner list plus parameters), reproduced verbatim on the final
/// line so the verifier covers the bytes the signer actually serialized.
///
/// # Errors
///
/// Returns [`BaseError`] per the rules above.
pub fn build(
    ctx: &RequestContext<'_>,
    components: &[CoveredComponent],
    raw_params: &str,
) -> Result<String, BaseError> {
    let mut base = String::new();

    for component in components {
        let value = if component.is_derived() {
            derived_value(ctx, &component.name)?
        } else {
            header_value(ctx, component)?
        };

        base.push('"');
        base.push_str(&component.name);
        base.push('"');
        base.push_str(&serialize_params(&component.params));
        base.push_str(": ");
        base.push_str(&value);
        base.push('\n');
    }

    base.push_str("\"@signature-params\": ");
    base.push_str(raw_params);
    Ok(base)
}

/// Resolve a `@`-prefixed derived component from the request metadata.
fn derived_value(ctx: &RequestContext<'_>, name: &str) -> Result<String, BaseError> {
    let url = ctx.target;
    let value = match name {
        "@method" => ctx.method.to_uppercase(),
        "@target-uri" => url.as_str().to_string(),
        "@authority" => authority(url)?,
        "@path" => url.path().to_string(),
        "@query" => url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        "@scheme" => url.scheme().to_lowercase(),
        "@request-target" => {
            let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
            format!("{}{query}", url.path())
        }
        // @status and anything unrecognised cannot be resolved on a request
        _ => return Err(BaseError::MissingComponent(name.to_string())),
    };
    Ok(value)
}

/// Lowercased `host[:port]`, omitting the scheme's default port.
fn authority(url: &Url) -> Result<String, BaseError> {
    let host = url
        .host_str()
        .ok_or_else(|| BaseError::MissingComponent("@authority".to_string()))?
        .to_lowercase();
    // Url::port() is None when the port equals the scheme default
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// Resolve a covered header line value, honouring the `key` selector.
fn header_value(
    ctx: &RequestContext<'_>,
    component: &CoveredComponent,
) -> Result<String, BaseError> {
    let name = &component.name;
    if is_sensitive_header(name) {
        return Err(BaseError::SensitiveHeader(name.clone()));
    }

    let values = ctx.header_values(name);
    if values.is_empty() {
        return Err(BaseError::MissingComponent(name.clone()));
    }
    let joined = values.join(", ");

    // A key selector picks one member of a structured dictionary field and
    // emits its canonical serialization.
    if let Some(key) = component.key_param() {
        let dict = Dictionary::parse(&joined)
            .map_err(|_| BaseError::UnparseableDictionary(name.clone()))?;
        let member = dict.get(key).ok_or_else(|| {
            BaseError::MissingComponent(format!("{name};key=\"{key}\""))
        })?;
        return Ok(serialize_member(member));
    }

    Ok(joined)
}
