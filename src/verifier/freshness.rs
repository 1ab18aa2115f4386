//! Freshness checks on the `created`/`expires` signature parameters.
//!
//! Runs before nonce admission so a clock-skewed replay does not pollute
//! the nonce store.

use super::verdict::{FailureReason, Verdict};

/// Check `created` and `expires` against `now`.
///
/// Rules:
/// - absent `created` fails `missing_created`
/// - `|now − created| > max_skew` fails `clock_skew`
/// - present `expires` with `now > expires` fails `expired`
///
/// # Errors
///
/// Returns a failed [`Verdict`] describing the violated rule.
pub fn check(
    created: Option<i64>,
    expires: Option<i64>,
    now: i64,
    max_skew: i64,
) -> Result<(), Verdict> {
    let Some(created) = created else {
        return Err(Verdict::fail(
            FailureReason::MissingCreated,
            "Signature has no created parameter",
        ));
    };

    let skew = (now - created).abs();
    if skew > max_skew {
        return Err(Verdict::fail(
            FailureReason::ClockSkew,
            format!("Signature created {skew}s from now exceeds the {max_skew}s skew window"),
        ));
    }

    if let Some(expires) = expires {
        if now > expires {
            return Err(Verdict::fail(
                FailureReason::Expired,
                format!("Signature expired {}s ago", now - expires),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const MAX_SKEW: i64 = 300;

    #[test]
    fn fresh_signature_passes() {
        assert!(check(Some(NOW - 5), None, NOW, MAX_SKEW).is_ok());
        assert!(check(Some(NOW - 5), Some(NOW + 60), NOW, MAX_SKEW).is_ok());
    }

    #[test]
    fn missing_created_fails() {
        let verdict = check(None, None, NOW, MAX_SKEW).unwrap_err();
        assert_eq!(verdict.reason(), Some(FailureReason::MissingCreated));
    }

    #[test]
    fn skew_boundary_flips_the_verdict() {
        // Exactly at the boundary passes; one second past fails
        assert!(check(Some(NOW - MAX_SKEW), None, NOW, MAX_SKEW).is_ok());
        let verdict = check(Some(NOW - MAX_SKEW - 1), None, NOW, MAX_SKEW).unwrap_err();
        assert_eq!(verdict.reason(), Some(FailureReason::ClockSkew));
    }

    #[test]
    fn future_created_is_also_skew_bounded() {
        assert!(check(Some(NOW + MAX_SKEW), None, NOW, MAX_SKEW).is_ok());
        let verdict = check(Some(NOW + MAX_SKEW + 1), None, NOW, MAX_SKEW).unwrap_err();
        assert_eq!(verdict.reason(), Some(FailureReason::ClockSkew));
    }

    #[test]
    fn expiry_boundary_flips_the_verdict() {
        assert!(check(Some(NOW - 5), Some(NOW), NOW, MAX_SKEW).is_ok());
        let verdict = check(Some(NOW - 5), Some(NOW - 1), NOW, MAX_SKEW).unwrap_err();
        assert_eq!(verdict.reason(), Some(FailureReason::Expired));
    }

    #[test]
    fn skew_is_reported_before_expiry() {
        // A skewed-and-expired signature reports clock_skew: the check runs
        // in rule order and stops at the first violation
        let verdict = check(Some(NOW - 1000), Some(NOW - 500), NOW, MAX_SKEW).unwrap_err();
        assert_eq!(verdict.reason(), Some(FailureReason::ClockSkew));
    }
}
