//! Header-value sanitization for the response ABI.
//!
//! Every value the sidecar emits on an `X-OBAuth-*` header may derive from
//! attacker-controlled input (agent names, error strings echoing header
//! content). CR/LF must never survive into a header value, and non-printable
//! bytes are stripped rather than forwarded.

/// Strip CR, LF, and all other control characters from a header value.
///
/// Printable ASCII and non-control Unicode pass through; horizontal tab is
/// folded to a space so values stay single-token for downstream parsers.
#[must_use]
pub fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| {
            if c == '\t' {
                Some(' ')
            } else if c.is_control() {
                None
            } else {
                Some(c)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn passes_plain_values_through() {
        assert_eq!(sanitize_header_value("Acme Crawler 2.1"), "Acme Crawler 2.1");
        assert_eq!(
            sanitize_header_value("https://idp.example/jwks/alice.json"),
            "https://idp.example/jwks/alice.json"
        );
    }

    #[test]
    fn strips_crlf_injection() {
        // GIVEN: a client_name attempting response splitting
        let hostile = "bot\r\nSet-Cookie: session=stolen";

        // THEN: the CRLF never survives
        assert_eq!(
            sanitize_header_value(hostile),
            "botSet-Cookie: session=stolen"
        );
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(sanitize_header_value("a\x00b\x1bc\x7fd"), "abcd");
    }

    #[test]
    fn folds_tab_to_space() {
        assert_eq!(sanitize_header_value("a\tb"), "a b");
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(sanitize_header_value(""), "");
    }
}
