//! Property-Based Tests for Storage - confinement and encryption round trips

use proptest::prelude::*;

/// One path segment: a name, a no-op or a climb
pub fn arb_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-c]{1,3}".prop_map(|s| s),
        1 => Just(".".to_string()),
        2 => Just("..".to_string()),
    ]
}

/// Relative caller paths built from [`arb_segment`]
pub fn arb_caller_path() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_segment(), 1..7)
}

/// Where a segment list lands relative to its base: `None` if it climbs
/// above it at any point, else the remaining names.
pub fn resolve(segments: &[String]) -> Option<Vec<String>> {
    let mut stack: Vec<String> = Vec::new();
    for segment in segments {
        match segment.as_str() {
            "." => {}
            ".." => {
                stack.pop()?;
            }
            name => stack.push(name.to_string()),
        }
    }
    Some(stack)
}
