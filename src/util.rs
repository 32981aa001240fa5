//! Small structural helpers shared across the overlay modules.
//!
//! These are leaf utilities with no knowledge of the peer state:
//! membership tests, a deep structural subset match used to probe the
//! outbound queue, shuffled iteration for peer selection, and the mean
//! used for bandwidth aggregation.

use rand::seq::SliceRandom;
use serde_json::Value;

/// Membership test over a slice.
pub fn contains<T: PartialEq>(x: &T, seq: &[T]) -> bool {
    seq.iter().any(|e| e == x)
}

/// True when some element of `xs` structurally contains `template`.
///
/// An element contains the template when every key of the template is
/// present with an equal value; object values recurse, everything else
/// compares with exact equality. Extra keys in the element are allowed.
/// An empty template matches any element, so the result is simply
/// whether `xs` is non-empty.
pub fn contains_match(template: &Value, xs: &[Value]) -> bool {
    xs.iter().any(|candidate| matches_template(template, candidate))
}

fn matches_template(template: &Value, candidate: &Value) -> bool {
    match template {
        Value::Object(fields) => {
            let Value::Object(other) = candidate else {
                return false;
            };
            fields.iter().all(|(key, value)| {
                other
                    .get(key)
                    .is_some_and(|found| matches_template(value, found))
            })
        }
        _ => template == candidate,
    }
}

/// A shuffled copy of `xs`. The input is left untouched.
pub fn shuffled<T: Clone>(xs: &[T]) -> Vec<T> {
    let mut out = xs.to_vec();
    out.shuffle(&mut rand::thread_rng());
    out
}

/// Arithmetic mean; zero for an empty sequence.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// A sorted copy of `xs` ordered by the boolean comparator `cmp`,
/// where `cmp(a, b)` means "a sorts before b". The input is untouched
/// and the result is a permutation of it; adjacent pairs `(a, b)` of
/// the result satisfy `!cmp(b, a)`.
pub fn shallow_sort<T: Clone>(cmp: impl Fn(&T, &T) -> bool, xs: &[T]) -> Vec<T> {
    let mut out = xs.to_vec();
    out.sort_by(|a, b| {
        if cmp(a, b) {
            std::cmp::Ordering::Less
        } else if cmp(b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    out
}
