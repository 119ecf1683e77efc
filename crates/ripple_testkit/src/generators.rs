//! Property-based test generators using proptest.
//!
//! Floats are kept finite so that generated values compare equal to
//! themselves.

use proptest::prelude::*;
use ripple_core::Value;

/// Strategy for scalar values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        title_strategy().prop_map(Value::from),
    ]
}

/// Strategy for field values, including nested lists and maps.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::list),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::from),
        ]
    })
}

/// Strategy for short titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 ]{0,15}"
}

/// Strategy for a sequence of titles written one commit at a time.
pub fn title_sequence_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(title_strategy(), 1..8)
}
