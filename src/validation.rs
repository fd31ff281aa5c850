//! Validation kernel: the single source of truth for plan limit semantics.
//!
//! Pure function with no I/O: `(measured, lower, upper, eq, limit_type,
//! value_type) → PASS|FAIL + reason`. Every other component defers to it;
//! handlers never decide out-of-limit themselves.
//!
//! The 7 limit types × 3 value types contract is inherited from the legacy
//! desktop application and must hold bit-for-bit:
//!
//! - Bounds are inclusive (`both` passes at exactly `lower` or `upper`).
//! - Float equality is **bit-exact** after parsing, not epsilon-based. This is
//!   a deliberate legacy-compatibility requirement: epsilon comparison would
//!   silently change pass rates on real hardware. Do not "fix" it here.
//! - `partial` always matches on the string forms, even for integer/float
//!   value types; CSV-authored plans rely on this fallback.
//! - Non-finite floats (`NaN`, `±inf`) always FAIL.
//!
//! Sentinel measured values ("Error:" prefixes, "No instrument found", empty
//! with a failed execute) are mapped to ERROR by the dispatcher before the
//! kernel is ever called; the kernel only judges real values.

use crate::model::{LimitType, TestPoint, ValueType};

/// Kernel decision. `Fail` carries the human-readable reason that lands
/// verbatim in `TestResult::error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Measured value satisfied the limits
    Pass,
    /// Measured value violated the limits, with reason
    Fail(String),
}

impl Verdict {
    /// True for [`Verdict::Pass`].
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// The failure reason, empty for PASS.
    pub fn reason(&self) -> &str {
        match self {
            Verdict::Pass => "",
            Verdict::Fail(reason) => reason,
        }
    }
}

/// Measured value coerced per `value_type`.
enum Typed {
    Text,
    Int(i64),
    Float(f64),
}

/// Apply a point's limits to a measured value.
pub fn check_point(point: &TestPoint, measured: &str) -> Verdict {
    check_limits(
        measured,
        point.lower_limit,
        point.upper_limit,
        point.eq_limit.as_deref(),
        point.limit_type,
        point.value_type,
    )
}

/// The kernel itself. See the module docs for the contract.
pub fn check_limits(
    measured: &str,
    lower: Option<f64>,
    upper: Option<f64>,
    eq: Option<&str>,
    limit_type: LimitType,
    value_type: ValueType,
) -> Verdict {
    if limit_type == LimitType::None {
        return Verdict::Pass;
    }

    let typed = match coerce(measured, value_type) {
        Ok(typed) => typed,
        Err(reason) => return Verdict::Fail(reason),
    };

    match limit_type {
        LimitType::None => Verdict::Pass,
        LimitType::Lower => {
            let Some(lo) = lower else {
                return Verdict::Fail("missing bound".to_string());
            };
            if at_least(&typed, measured, lo) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("{measured} < {lo}"))
            }
        }
        LimitType::Upper => {
            let Some(hi) = upper else {
                return Verdict::Fail("missing bound".to_string());
            };
            if at_most(&typed, measured, hi) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("{measured} > {hi}"))
            }
        }
        LimitType::Both => {
            let (Some(lo), Some(hi)) = (lower, upper) else {
                return Verdict::Fail("missing bound".to_string());
            };
            if at_least(&typed, measured, lo) && at_most(&typed, measured, hi) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("{measured} not in [{lo},{hi}]"))
            }
        }
        LimitType::Equality => {
            let Some(expected) = eq else {
                return Verdict::Fail("missing expected value".to_string());
            };
            match equals(&typed, measured, expected) {
                Ok(true) => Verdict::Pass,
                Ok(false) => Verdict::Fail(format!("{measured} != {expected}")),
                Err(reason) => Verdict::Fail(reason),
            }
        }
        LimitType::Inequality => {
            let Some(expected) = eq else {
                return Verdict::Fail("missing expected value".to_string());
            };
            match equals(&typed, measured, expected) {
                Ok(false) => Verdict::Pass,
                Ok(true) => Verdict::Fail(format!("{measured} == {expected}")),
                Err(reason) => Verdict::Fail(reason),
            }
        }
        LimitType::Partial => {
            // String-form substring match for every value type.
            let Some(expected) = eq else {
                return Verdict::Fail("missing expected value".to_string());
            };
            if measured.contains(expected) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("{expected} not in {measured}"))
            }
        }
    }
}

fn coerce(measured: &str, value_type: ValueType) -> Result<Typed, String> {
    match value_type {
        ValueType::String => Ok(Typed::Text),
        ValueType::Integer => measured
            .trim()
            .parse::<i64>()
            .map(Typed::Int)
            .map_err(|_| "non-integer value".to_string()),
        ValueType::Float => {
            let value: f64 = measured
                .trim()
                .parse()
                .map_err(|_| "non-numeric value".to_string())?;
            if value.is_finite() {
                Ok(Typed::Float(value))
            } else {
                Err("non-numeric value".to_string())
            }
        }
    }
}

fn at_least(typed: &Typed, measured: &str, bound: f64) -> bool {
    match typed {
        Typed::Text => measured >= bound.to_string().as_str(),
        Typed::Int(v) => (*v as f64) >= bound,
        Typed::Float(v) => *v >= bound,
    }
}

fn at_most(typed: &Typed, measured: &str, bound: f64) -> bool {
    match typed {
        Typed::Text => measured <= bound.to_string().as_str(),
        Typed::Int(v) => (*v as f64) <= bound,
        Typed::Float(v) => *v <= bound,
    }
}

fn equals(typed: &Typed, measured: &str, expected: &str) -> Result<bool, String> {
    match typed {
        Typed::Text => Ok(measured == expected),
        Typed::Int(v) => expected
            .trim()
            .parse::<i64>()
            .map(|e| *v == e)
            .map_err(|_| "non-integer expected value".to_string()),
        Typed::Float(v) => {
            let e: f64 = expected
                .trim()
                .parse()
                .map_err(|_| "non-numeric expected value".to_string())?;
            if !e.is_finite() {
                return Err("non-numeric expected value".to_string());
            }
            // Bit-exact by legacy contract; see module docs.
            Ok(*v == e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_both(measured: &str, lo: f64, hi: f64) -> Verdict {
        check_limits(measured, Some(lo), Some(hi), None, LimitType::Both, ValueType::Float)
    }

    #[test]
    fn none_always_passes() {
        assert!(check_limits("garbage", None, None, None, LimitType::None, ValueType::Float).is_pass());
        assert!(check_limits("", None, None, None, LimitType::None, ValueType::String).is_pass());
    }

    #[test]
    fn both_is_inclusive_at_the_bounds() {
        assert!(float_both("11.5", 11.5, 12.5).is_pass());
        assert!(float_both("12.5", 11.5, 12.5).is_pass());
        assert!(float_both("12.01", 11.5, 12.5).is_pass());
    }

    #[test]
    fn both_failure_reason_is_verbatim() {
        let verdict = float_both("13.10", 11.5, 12.5);
        assert_eq!(verdict, Verdict::Fail("13.10 not in [11.5,12.5]".to_string()));
    }

    #[test]
    fn lower_and_upper_bounds() {
        assert!(check_limits("5", Some(5.0), None, None, LimitType::Lower, ValueType::Integer).is_pass());
        let verdict =
            check_limits("4", Some(5.0), None, None, LimitType::Lower, ValueType::Integer);
        assert_eq!(verdict, Verdict::Fail("4 < 5".to_string()));

        assert!(check_limits("4", None, Some(5.0), None, LimitType::Upper, ValueType::Integer).is_pass());
        let verdict =
            check_limits("6", None, Some(5.0), None, LimitType::Upper, ValueType::Integer);
        assert_eq!(verdict, Verdict::Fail("6 > 5".to_string()));
    }

    #[test]
    fn missing_bound_fails() {
        let verdict = check_limits("1.0", None, None, None, LimitType::Both, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("missing bound".to_string()));
        let verdict = check_limits("1.0", None, Some(2.0), None, LimitType::Both, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("missing bound".to_string()));
        let verdict = check_limits("1.0", None, None, None, LimitType::Lower, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("missing bound".to_string()));
    }

    #[test]
    fn integer_coercion_rejects_non_integers() {
        let verdict =
            check_limits("12.5", Some(0.0), None, None, LimitType::Lower, ValueType::Integer);
        assert_eq!(verdict, Verdict::Fail("non-integer value".to_string()));
    }

    #[test]
    fn float_coercion_accepts_scientific_and_rejects_non_finite() {
        assert!(check_limits("1e3", Some(999.0), None, None, LimitType::Lower, ValueType::Float).is_pass());
        let verdict =
            check_limits("NaN", Some(0.0), None, None, LimitType::Lower, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("non-numeric value".to_string()));
        let verdict = check_limits("inf", Some(0.0), None, None, LimitType::Lower, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("non-numeric value".to_string()));
        let verdict =
            check_limits("volts", Some(0.0), None, None, LimitType::Lower, ValueType::Float);
        assert_eq!(verdict, Verdict::Fail("non-numeric value".to_string()));
    }

    #[test]
    fn equality_is_typed() {
        // String equality is verbatim.
        assert!(check_limits("OK", None, None, Some("OK"), LimitType::Equality, ValueType::String).is_pass());
        let verdict =
            check_limits("NG", None, None, Some("OK"), LimitType::Equality, ValueType::String);
        assert_eq!(verdict, Verdict::Fail("NG != OK".to_string()));

        // Integer equality parses both sides.
        assert!(check_limits("42", None, None, Some("042"), LimitType::Equality, ValueType::Integer).is_pass());

        // Float equality is bit-exact on the parsed values: "1.0" == "1.00",
        // but no epsilon tolerance.
        assert!(check_limits("1.0", None, None, Some("1.00"), LimitType::Equality, ValueType::Float).is_pass());
        let verdict = check_limits(
            "0.30000000000000004",
            None,
            None,
            Some("0.3"),
            LimitType::Equality,
            ValueType::Float,
        );
        assert!(!verdict.is_pass());
    }

    #[test]
    fn inequality_inverts_equality() {
        let cases = [
            ("12.0", "12.0", ValueType::Float),
            ("12.0", "13.0", ValueType::Float),
            ("abc", "abc", ValueType::String),
            ("abc", "abd", ValueType::String),
            ("7", "7", ValueType::Integer),
            ("7", "8", ValueType::Integer),
        ];
        for (measured, expected, vt) in cases {
            let eq = check_limits(measured, None, None, Some(expected), LimitType::Equality, vt);
            let ne = check_limits(measured, None, None, Some(expected), LimitType::Inequality, vt);
            assert_ne!(eq.is_pass(), ne.is_pass(), "{measured} vs {expected}");
        }
    }

    #[test]
    fn inequality_failure_reason() {
        let verdict =
            check_limits("OK", None, None, Some("OK"), LimitType::Inequality, ValueType::String);
        assert_eq!(verdict, Verdict::Fail("OK == OK".to_string()));
    }

    #[test]
    fn partial_matches_substrings_for_every_value_type() {
        assert!(check_limits("FW v1.2.3-rc", None, None, Some("v1.2"), LimitType::Partial, ValueType::String).is_pass());
        // Numeric value types fall back to the string forms.
        assert!(check_limits("456", None, None, Some("45"), LimitType::Partial, ValueType::Integer).is_pass());
        assert!(check_limits("12.345", None, None, Some("2.3"), LimitType::Partial, ValueType::Float).is_pass());

        let verdict =
            check_limits("456", None, None, Some("789"), LimitType::Partial, ValueType::String);
        assert_eq!(verdict, Verdict::Fail("789 not in 456".to_string()));
    }

    #[test]
    fn missing_expected_value_fails() {
        for lt in [LimitType::Equality, LimitType::Inequality, LimitType::Partial] {
            let verdict = check_limits("x", None, None, None, lt, ValueType::String);
            assert_eq!(verdict, Verdict::Fail("missing expected value".to_string()));
        }
    }

    #[test]
    fn string_bounds_compare_lexicographically() {
        // The legacy compares string measured values against the string form
        // of the bound.
        assert!(check_limits("9", Some(10.0), None, None, LimitType::Lower, ValueType::String).is_pass());
        assert!(!check_limits("1", Some(10.0), None, None, LimitType::Lower, ValueType::String).is_pass());
    }

    #[test]
    fn kernel_is_pure() {
        let run = || float_both("12.01", 11.5, 12.5);
        assert_eq!(run(), run());
    }
}
