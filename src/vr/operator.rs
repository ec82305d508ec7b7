use super::code::{VrCategory, VrCode};
use std::str::FromStr;

/// Rule comparison operators, per spec.md §4.1 "Operator set".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    ContainsCs,
    ContainsCi,
    ExactCs,
    ExactCi,
    NotContainsCs,
    NotContainsCi,
}

const NUMERIC_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Gt,
    Operator::Lt,
    Operator::Gte,
    Operator::Lte,
];

const STRING_ONLY_OPS: &[Operator] = &[
    Operator::ContainsCs,
    Operator::ContainsCi,
    Operator::ExactCs,
    Operator::ExactCi,
    Operator::NotContainsCs,
    Operator::NotContainsCi,
];

impl Operator {
    /// Is this operator legal to apply to a tag of the given VR category,
    /// per spec.md §4.1 "Compatibility".
    pub fn is_compatible_with(self, category: VrCategory) -> bool {
        match category {
            VrCategory::Numeric => NUMERIC_OPS.contains(&self),
            VrCategory::String => {
                STRING_ONLY_OPS.contains(&self) || matches!(self, Operator::Eq | Operator::Neq)
            }
            VrCategory::DateTime => NUMERIC_OPS.contains(&self) || STRING_ONLY_OPS.contains(&self),
            VrCategory::Special => matches!(self, Operator::Eq | Operator::Neq),
        }
    }

    pub fn evaluate(self, tag_value: Option<&str>, literal: &str, vr: VrCode) -> bool {
        match self {
            Operator::Eq => match tag_value {
                None => false,
                Some(v) => compare_eq(v, literal, vr),
            },
            Operator::Neq => match tag_value {
                None => !literal.is_empty(),
                Some(v) => !compare_eq(v, literal, vr),
            },
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
                let (Some(v), Ok(lit_n)) = (tag_value, literal.parse::<f64>()) else {
                    return false;
                };
                let Ok(v_n) = v.parse::<f64>() else {
                    return false;
                };
                match self {
                    Operator::Gt => v_n > lit_n,
                    Operator::Lt => v_n < lit_n,
                    Operator::Gte => v_n >= lit_n,
                    Operator::Lte => v_n <= lit_n,
                    _ => unreachable!(),
                }
            }
            Operator::ContainsCs => tag_value.is_some_and(|v| v.contains(literal)),
            Operator::ContainsCi => tag_value
                .is_some_and(|v| v.to_lowercase().contains(&literal.to_lowercase())),
            Operator::NotContainsCs => !tag_value.is_some_and(|v| v.contains(literal)),
            Operator::NotContainsCi => {
                !tag_value.is_some_and(|v| v.to_lowercase().contains(&literal.to_lowercase()))
            }
            Operator::ExactCs => tag_value.is_some_and(|v| v == literal),
            Operator::ExactCi => {
                tag_value.is_some_and(|v| v.eq_ignore_ascii_case(literal))
            }
        }
    }
}

fn compare_eq(value: &str, literal: &str, vr: VrCode) -> bool {
    if vr.category() == VrCategory::Numeric {
        if let (Ok(a), Ok(b)) = (value.parse::<f64>(), literal.parse::<f64>()) {
            return a == b;
        }
    }
    value == literal
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "EQ" => Operator::Eq,
            "NEQ" => Operator::Neq,
            "GT" => Operator::Gt,
            "LT" => Operator::Lt,
            "GTE" => Operator::Gte,
            "LTE" => Operator::Lte,
            "CONTAINS_CS" => Operator::ContainsCs,
            "CONTAINS_CI" => Operator::ContainsCi,
            "EXACT_CS" => Operator::ExactCs,
            "EXACT_CI" => Operator::ExactCi,
            "NOT_CONTAINS_CS" => Operator::NotContainsCs,
            "NOT_CONTAINS_CI" => Operator::NotContainsCi,
            _ => return Err(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Operator::Eq, Some("CT"), "CT", VrCode::Cs, true)]
    #[case(Operator::Eq, None, "CT", VrCode::Cs, false)]
    #[case(Operator::Neq, None, "CT", VrCode::Cs, true)]
    #[case(Operator::Neq, None, "", VrCode::Cs, false)]
    #[case(Operator::Lt, Some("3.0"), "5.0", VrCode::Ds, true)]
    #[case(Operator::ContainsCi, Some("Breast Screening"), "breast", VrCode::Lo, true)]
    fn test_evaluate(
        #[case] op: Operator,
        #[case] tag_value: Option<&str>,
        #[case] literal: &str,
        #[case] vr: VrCode,
        #[case] expected: bool,
    ) {
        assert_eq!(op.evaluate(tag_value, literal, vr), expected);
    }

    #[test]
    fn test_compatibility() {
        assert!(Operator::Gt.is_compatible_with(VrCategory::Numeric));
        assert!(!Operator::Gt.is_compatible_with(VrCategory::String));
        assert!(Operator::ContainsCs.is_compatible_with(VrCategory::String));
        assert!(!Operator::ContainsCs.is_compatible_with(VrCategory::Numeric));
        assert!(Operator::Eq.is_compatible_with(VrCategory::Special));
        assert!(!Operator::Gt.is_compatible_with(VrCategory::Special));
    }
}
