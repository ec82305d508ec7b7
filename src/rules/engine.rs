use crate::vr::{Operator, VrCode};
use std::collections::HashMap;
use std::str::FromStr;

/// Tag → value mapping for one representative instance. Both the canonical
/// tag name and the `(gggg,eeee)` form must be populated for every element
/// read, per spec.md §4.2 "Representative instance".
pub type TagMap = HashMap<String, String>;

/// Combinator applied between a rule/ruleset and the next one in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    fn apply(self, acc: bool, next: bool) -> bool {
        match self {
            Combinator::And => acc && next,
            Combinator::Or => acc || next,
        }
    }
}

impl FromStr for Combinator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(Combinator::And),
            "OR" => Ok(Combinator::Or),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub tag_key: String,
    pub operator: Operator,
    pub literal: String,
    pub vr: VrCode,
    /// Combinator applied between this rule and the next one. Ignored for
    /// the last rule in a RuleSet.
    pub combinator_with_next: Combinator,
}

impl Rule {
    fn evaluate(&self, tags: &TagMap) -> bool {
        let tag_value = tags.get(&self.tag_key).map(String::as_str);
        self.operator.evaluate(tag_value, &self.literal, self.vr)
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub id: i64,
    pub rules: Vec<Rule>,
    /// Combinator applied between this ruleset and the next one in its
    /// owning RuleGroup. Ignored for the last ruleset.
    pub combinator_with_next: Combinator,
}

impl RuleSet {
    /// Pure left fold of per-rule booleans by their per-position
    /// combinators, no operator precedence, per spec.md §4.2 "Rule
    /// combination". An empty ruleset evaluates to `true` (vacuous match).
    fn evaluate(&self, tags: &TagMap) -> bool {
        let mut iter = self.rules.iter();
        let Some(first) = iter.next() else {
            return true;
        };
        let mut acc = first.evaluate(tags);
        let mut combinator = first.combinator_with_next;
        for rule in iter {
            let next = rule.evaluate(tags);
            acc = combinator.apply(acc, next);
            combinator = rule.combinator_with_next;
        }
        acc
    }
}

#[derive(Debug, Clone)]
pub struct RuleGroup {
    pub id: i64,
    pub template_ids: Vec<i64>,
    pub rulesets: Vec<RuleSet>,
}

pub struct MatchedGroup {
    pub rulegroup_id: i64,
    pub template_ids: Vec<i64>,
    pub matched_ruleset_ids: Vec<i64>,
}

pub enum SeriesOutcome {
    Unmatched,
    Matched(MatchedGroup),
    Multiple(Vec<MatchedGroup>),
}

impl RuleGroup {
    /// Left fold of ruleset booleans by their per-position combinators, plus
    /// the subset of rulesets that evaluated true, per spec.md §4.2
    /// "RuleSet combination".
    fn evaluate(&self, tags: &TagMap) -> (bool, Vec<i64>) {
        let mut matched = Vec::new();
        let mut iter = self.rulesets.iter();
        let Some(first) = iter.next() else {
            return (true, matched);
        };
        let first_result = first.evaluate(tags);
        if first_result {
            matched.push(first.id);
        }
        let mut acc = first_result;
        let mut combinator = first.combinator_with_next;
        for ruleset in iter {
            let next = ruleset.evaluate(tags);
            if next {
                matched.push(ruleset.id);
            }
            acc = combinator.apply(acc, next);
            combinator = ruleset.combinator_with_next;
        }
        (acc, matched)
    }
}

/// Evaluate every RuleGroup against a series' representative-instance tag
/// map and decide the match outcome, per spec.md §4.2 "Series outcome".
pub fn evaluate_series(groups: &[RuleGroup], tags: &TagMap) -> SeriesOutcome {
    let matched: Vec<MatchedGroup> = groups
        .iter()
        .filter_map(|g| {
            let (is_match, matched_rulesets) = g.evaluate(tags);
            is_match.then(|| MatchedGroup {
                rulegroup_id: g.id,
                template_ids: g.template_ids.clone(),
                matched_ruleset_ids: matched_rulesets,
            })
        })
        .collect();

    match matched.len() {
        0 => SeriesOutcome::Unmatched,
        1 => SeriesOutcome::Matched(matched.into_iter().next().unwrap()),
        _ => SeriesOutcome::Multiple(matched),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::VrCode;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn rule(tag: &str, op: Operator, lit: &str, vr: VrCode, comb: Combinator) -> Rule {
        Rule {
            tag_key: tag.to_string(),
            operator: op,
            literal: lit.to_string(),
            vr,
            combinator_with_next: comb,
        }
    }

    /// S1: three AND-ed rules matching CT/HEAD/thin-slice.
    #[test]
    fn test_s1_rule_match_under_and() {
        let ruleset = RuleSet {
            id: 1,
            rules: vec![
                rule("Modality", Operator::Eq, "CT", VrCode::Cs, Combinator::And),
                rule(
                    "BodyPartExamined",
                    Operator::Eq,
                    "HEAD",
                    VrCode::Cs,
                    Combinator::And,
                ),
                rule("SliceThickness", Operator::Lt, "5.0", VrCode::Ds, Combinator::And),
            ],
            combinator_with_next: Combinator::And,
        };
        let matching = tags(&[
            ("Modality", "CT"),
            ("BodyPartExamined", "HEAD"),
            ("SliceThickness", "3.0"),
        ]);
        assert!(ruleset.evaluate(&matching));

        let not_matching = tags(&[
            ("Modality", "MR"),
            ("BodyPartExamined", "HEAD"),
            ("SliceThickness", "3.0"),
        ]);
        assert!(!ruleset.evaluate(&not_matching));
    }

    /// S2: two OR-ed rulesets, one or both matching.
    #[test]
    fn test_s2_or_ruleset() {
        let breast = RuleSet {
            id: 1,
            rules: vec![
                rule("Modality", Operator::Eq, "CT", VrCode::Cs, Combinator::And),
                rule(
                    "ProtocolName",
                    Operator::ContainsCi,
                    "Breast",
                    VrCode::Lo,
                    Combinator::And,
                ),
            ],
            combinator_with_next: Combinator::Or,
        };
        let head_neck = RuleSet {
            id: 2,
            rules: vec![
                rule("Modality", Operator::Eq, "CT", VrCode::Cs, Combinator::And),
                rule(
                    "StudyDescription",
                    Operator::ContainsCi,
                    "HEAD",
                    VrCode::Lo,
                    Combinator::And,
                ),
            ],
            combinator_with_next: Combinator::Or,
        };
        let group = RuleGroup {
            id: 1,
            template_ids: vec![100],
            rulesets: vec![breast, head_neck],
        };

        let t1 = tags(&[
            ("Modality", "CT"),
            ("ProtocolName", "Breast Screening"),
            ("StudyDescription", "CT CHEST"),
        ]);
        let (matched, rulesets) = group.evaluate(&t1);
        assert!(matched);
        assert_eq!(rulesets, vec![1]);

        let t2 = tags(&[
            ("Modality", "CT"),
            ("ProtocolName", "Breast"),
            ("StudyDescription", "HEAD NECK"),
        ]);
        let (matched, rulesets) = group.evaluate(&t2);
        assert!(matched);
        assert_eq!(rulesets, vec![1, 2]);
    }

    #[test]
    fn test_series_outcome_multiple() {
        let trivial_group = |id| RuleGroup {
            id,
            template_ids: vec![id],
            rulesets: vec![],
        };
        let groups = vec![trivial_group(1), trivial_group(2)];
        let outcome = evaluate_series(&groups, &TagMap::new());
        assert!(matches!(outcome, SeriesOutcome::Multiple(v) if v.len() == 2));
    }
}
