//! Per-VR format validation and operator-VR compatibility, per spec.md §4.1.

mod code;
mod operator;
mod validate;

pub use code::{VrCategory, VrCode};
pub use operator::Operator;
pub use validate::{validate_literal, VrValidationError};

/// Evaluate `operator(tag_value, literal)` for a tag of the given VR.
///
/// Numeric operators cast both sides to `f64`; a parse failure on either side
/// makes the rule fail (return `false`), not error, since a failed cast is a
/// legitimate "rule does not match" outcome at match time.
pub fn evaluate(vr: VrCode, operator: Operator, tag_value: Option<&str>, literal: &str) -> bool {
    operator.evaluate(tag_value, literal, vr)
}
