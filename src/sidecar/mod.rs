//! Sidecar: the edge component between agents and the origin.
//!
//! Classifies incoming requests as signed or unsigned, extracts the covered
//! headers the verifier needs, enforces the sensitive-header shield, and
//! translates verdicts into the `X-OBAuth-*` response ABI. Two modes:
//! **observe** proxies everything and annotates, **require-verified**
//! rejects unverified requests on protected paths with 401.

pub mod classify;
pub mod proxy;

/// Whether `path` falls under any protected prefix.
///
/// Prefixes match on directory boundaries: `/api` protects `/api`, `/api/x`,
/// and `/api.json`, but not `/apix`.
#[must_use]
pub fn path_is_protected(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            // A bare "/" prefix protects everything
            return true;
        }
        match path.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('/') || rest.starts_with('.'),
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn prefix_matches_on_directory_boundaries() {
        let p = prefixes(&["/api"]);

        assert!(path_is_protected("/api", &p));
        assert!(path_is_protected("/api/x", &p));
        assert!(path_is_protected("/api.json", &p));
        assert!(!path_is_protected("/apix", &p));
        assert!(!path_is_protected("/apixx/y", &p));
        assert!(!path_is_protected("/other", &p));
    }

    #[test]
    fn longer_prefixes_also_bound_correctly() {
        let p = prefixes(&["/protected"]);

        assert!(path_is_protected("/protected", &p));
        assert!(path_is_protected("/protected/x", &p));
        assert!(path_is_protected("/protected.json", &p));
        assert!(!path_is_protected("/protectedness", &p));
    }

    #[test]
    fn any_of_several_prefixes_matches() {
        let p = prefixes(&["/api", "/admin"]);

        assert!(path_is_protected("/admin/users", &p));
        assert!(path_is_protected("/api", &p));
        assert!(!path_is_protected("/public", &p));
    }

    #[test]
    fn trailing_slash_on_the_prefix_is_ignored() {
        let p = prefixes(&["/api/"]);

        assert!(path_is_protected("/api", &p));
        assert!(path_is_protected("/api/x", &p));
        assert!(!path_is_protected("/apix", &p));
    }

    #[test]
    fn root_prefix_protects_everything() {
        let p = prefixes(&["/"]);

        assert!(path_is_protected("/", &p));
        assert!(path_is_protected("/anything", &p));
    }

    #[test]
    fn empty_prefix_list_protects_nothing() {
        assert!(!path_is_protected("/api", &[]));
    }
}
