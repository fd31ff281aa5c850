//! The limit-validation contract, exercised across the full
//! limit-type × value-type grid.
//!
//! These tests pin the legacy semantics: inclusive bounds, bit-exact float
//! equality, string-form substring matching for `partial`, and the exact
//! reason strings that land in `error_message`.

use webpdtool::model::{LimitType, ValueType};
use webpdtool::validation::{check_limits, Verdict};

const ALL_VALUE_TYPES: [ValueType; 3] = [ValueType::String, ValueType::Integer, ValueType::Float];

#[test]
fn none_passes_for_every_value_type_and_any_text() {
    for vt in ALL_VALUE_TYPES {
        for measured in ["", "garbage", "12.5", "NaN"] {
            assert!(
                check_limits(measured, None, None, None, LimitType::None, vt).is_pass(),
                "none/{vt:?}/{measured}"
            );
        }
    }
}

#[test]
fn numeric_grid_for_bound_types() {
    // (limit_type, lower, upper, measured, expect_pass)
    let cases = [
        (LimitType::Lower, Some(5.0), None, "5", true),
        (LimitType::Lower, Some(5.0), None, "6", true),
        (LimitType::Lower, Some(5.0), None, "4", false),
        (LimitType::Upper, None, Some(5.0), "5", true),
        (LimitType::Upper, None, Some(5.0), "4", true),
        (LimitType::Upper, None, Some(5.0), "6", false),
        (LimitType::Both, Some(2.0), Some(8.0), "2", true),
        (LimitType::Both, Some(2.0), Some(8.0), "8", true),
        (LimitType::Both, Some(2.0), Some(8.0), "5", true),
        (LimitType::Both, Some(2.0), Some(8.0), "1", false),
        (LimitType::Both, Some(2.0), Some(8.0), "9", false),
    ];
    for (lt, lo, hi, measured, expect) in cases {
        for vt in [ValueType::Integer, ValueType::Float] {
            let verdict = check_limits(measured, lo, hi, None, lt, vt);
            assert_eq!(verdict.is_pass(), expect, "{lt:?}/{vt:?}/{measured}");
        }
    }
}

#[test]
fn float_bounds_are_inclusive_at_exact_edges() {
    for measured in ["11.5", "12.5"] {
        assert!(check_limits(
            measured,
            Some(11.5),
            Some(12.5),
            None,
            LimitType::Both,
            ValueType::Float
        )
        .is_pass());
    }
}

#[test]
fn reason_strings_are_stable() {
    let fail = |measured: &str, lt, vt| match check_limits(
        measured,
        Some(11.5),
        Some(12.5),
        Some("OK"),
        lt,
        vt,
    ) {
        Verdict::Fail(reason) => reason,
        Verdict::Pass => panic!("expected FAIL"),
    };

    assert_eq!(
        fail("13.10", LimitType::Both, ValueType::Float),
        "13.10 not in [11.5,12.5]"
    );
    assert_eq!(fail("11.2", LimitType::Lower, ValueType::Float), "11.2 < 11.5");
    assert_eq!(fail("12.9", LimitType::Upper, ValueType::Float), "12.9 > 12.5");
    assert_eq!(fail("NG", LimitType::Equality, ValueType::String), "NG != OK");
    assert_eq!(fail("OK", LimitType::Inequality, ValueType::String), "OK == OK");
    assert_eq!(fail("NG", LimitType::Partial, ValueType::String), "OK not in NG");
}

#[test]
fn equality_and_inequality_are_mirror_images() {
    let grid = [
        ("12.0", "12.00", ValueType::Float),
        ("12.0", "12.5", ValueType::Float),
        ("7", "7", ValueType::Integer),
        ("7", "-7", ValueType::Integer),
        ("OK", "OK", ValueType::String),
        ("OK", "ok", ValueType::String),
    ];
    for (measured, expected, vt) in grid {
        let eq = check_limits(measured, None, None, Some(expected), LimitType::Equality, vt);
        let ne = check_limits(measured, None, None, Some(expected), LimitType::Inequality, vt);
        assert_ne!(
            eq.is_pass(),
            ne.is_pass(),
            "equality/inequality must disagree for {measured} vs {expected}"
        );
    }
}

#[test]
fn float_equality_is_bit_exact_not_epsilon() {
    // Equal after parsing: different spellings of the same double.
    assert!(check_limits("1.0", None, None, Some("1.000"), LimitType::Equality, ValueType::Float).is_pass());
    assert!(check_limits("1e3", None, None, Some("1000"), LimitType::Equality, ValueType::Float).is_pass());

    // One ULP away is not equal; no tolerance is applied.
    assert!(!check_limits(
        "0.30000000000000004",
        None,
        None,
        Some("0.3"),
        LimitType::Equality,
        ValueType::Float
    )
    .is_pass());
}

#[test]
fn partial_uses_string_forms_for_all_value_types() {
    for vt in ALL_VALUE_TYPES {
        assert!(
            check_limits("123456", None, None, Some("345"), LimitType::Partial, vt).is_pass(),
            "partial/{vt:?}"
        );
        assert!(
            !check_limits("123456", None, None, Some("999"), LimitType::Partial, vt).is_pass(),
            "partial-miss/{vt:?}"
        );
    }
}

#[test]
fn coercion_failures_are_fail_not_error() {
    // The kernel reports FAIL with a typed reason; ERROR is reserved for the
    // dispatcher's sentinel handling.
    let verdict = check_limits("12.5v", Some(0.0), None, None, LimitType::Lower, ValueType::Float);
    assert_eq!(verdict, Verdict::Fail("non-numeric value".to_string()));

    let verdict = check_limits("1.5", Some(0.0), None, None, LimitType::Lower, ValueType::Integer);
    assert_eq!(verdict, Verdict::Fail("non-integer value".to_string()));
}

#[test]
fn scientific_notation_parses_nan_and_inf_do_not() {
    assert!(check_limits("1e3", Some(500.0), Some(1500.0), None, LimitType::Both, ValueType::Float).is_pass());
    for bad in ["NaN", "nan", "inf", "-inf", "infinity"] {
        assert!(
            !check_limits(bad, Some(0.0), None, None, LimitType::Lower, ValueType::Float).is_pass(),
            "{bad} must not pass"
        );
    }
}

#[test]
fn kernel_purity_same_inputs_same_output() {
    for _ in 0..3 {
        assert_eq!(
            check_limits("12.01", Some(11.5), Some(12.5), None, LimitType::Both, ValueType::Float),
            Verdict::Pass
        );
    }
}
