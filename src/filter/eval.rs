// In-memory evaluation: `evaluate(record)` (§4.A). Must match SQL semantics
// exactly for SQL-representable operators — the SQL/in-memory equivalence
// invariant (§3, §8 invariant 1).

use regex::RegexBuilder;

use crate::value::{Record, Value};

use super::ast::{FilterNode, Operand, Operator};

impl FilterNode {
    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            FilterNode::True => true,
            FilterNode::And(children) => children.iter().all(|c| c.evaluate(record)),
            FilterNode::Or(children) => children.iter().any(|c| c.evaluate(record)),
            FilterNode::Op {
                field,
                operator,
                operand,
            } => {
                let actual = record.get(field).unwrap_or(&Value::Null);
                eval_op(*operator, actual, operand)
            }
        }
    }
}

fn eval_op(operator: Operator, actual: &Value, operand: &Operand) -> bool {
    use Operator::*;
    match operator {
        IsNull => {
            let want = if let Operand::Bool(b) = operand { *b } else { true };
            actual.is_null() == want
        }
        IsEmpty => {
            let want = if let Operand::Bool(b) = operand { *b } else { true };
            let is_empty = match actual {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            is_empty == want
        }
        Eq => scalar(operand).map(|v| actual == v).unwrap_or(false),
        Ne => scalar(operand).map(|v| actual != v).unwrap_or(true),
        IEq => scalar(operand)
            .map(|v| case_fold(actual) == case_fold(v))
            .unwrap_or(false),
        INe => scalar(operand)
            .map(|v| case_fold(actual) != case_fold(v))
            .unwrap_or(true),
        Lt => compare(actual, operand, |o| o.is_lt()),
        Le => compare(actual, operand, |o| o.is_le()),
        Gt => compare(actual, operand, |o| o.is_gt()),
        Ge => compare(actual, operand, |o| o.is_ge()),
        In => set(operand)
            .map(|vs| vs.iter().any(|v| actual.as_normalized_string() == v.as_normalized_string()))
            .unwrap_or(false),
        Out => set(operand)
            .map(|vs| !vs.iter().any(|v| actual.as_normalized_string() == v.as_normalized_string()))
            .unwrap_or(true),
        Like => like(actual, operand, false),
        NotLike => !like(actual, operand, false),
        ILike => like(actual, operand, true),
        NotILike => !like(actual, operand, true),
        Contains => substr(actual, operand, false, Substr::Contains),
        IContains => substr(actual, operand, true, Substr::Contains),
        StartsWith => substr(actual, operand, false, Substr::Starts),
        IStartsWith => substr(actual, operand, true, Substr::Starts),
        EndsWith => substr(actual, operand, false, Substr::Ends),
        IEndsWith => substr(actual, operand, true, Substr::Ends),
        Between => range(actual, operand),
        NotBetween => !range(actual, operand),
        Length => length_cmp(actual, operand, LengthCmp::Eq),
        MinLength => length_cmp(actual, operand, LengthCmp::Min),
        MaxLength => length_cmp(actual, operand, LengthCmp::Max),
        Regex => regex_match(actual, operand, false),
        IRegex => regex_match(actual, operand, true),
    }
}

fn scalar(operand: &Operand) -> Option<&Value> {
    match operand {
        Operand::Scalar(v) => Some(v),
        _ => None,
    }
}

fn set(operand: &Operand) -> Option<&Vec<Value>> {
    match operand {
        Operand::Set(vs) => Some(vs),
        _ => None,
    }
}

fn case_fold(v: &Value) -> String {
    v.as_normalized_string().to_lowercase()
}

fn compare(actual: &Value, operand: &Operand, test: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let Some(want) = scalar(operand) else { return false };
    match actual.partial_cmp(want) {
        Some(ord) => test(ord),
        None => false,
    }
}

enum Substr {
    Contains,
    Starts,
    Ends,
}

fn substr(actual: &Value, operand: &Operand, ci: bool, kind: Substr) -> bool {
    let Some(Value::String(want)) = scalar(operand) else { return false };
    let hay = actual.as_normalized_string();
    let (hay, want) = if ci {
        (hay.to_lowercase(), want.to_lowercase())
    } else {
        (hay, want.clone())
    };
    match kind {
        Substr::Contains => hay.contains(&want),
        Substr::Starts => hay.starts_with(&want),
        Substr::Ends => hay.ends_with(&want),
    }
}

/// SQL `LIKE` semantics: `%` = any run, `_` = one char, `\` escapes (§4.A).
fn like(actual: &Value, operand: &Operand, ci: bool) -> bool {
    let Some(Value::String(pattern)) = scalar(operand) else { return false };
    let hay = actual.as_normalized_string();
    like_match(&hay, pattern, ci)
}

fn like_match(hay: &str, pattern: &str, ci: bool) -> bool {
    let hay_chars: Vec<char> = if ci { hay.to_lowercase().chars().collect() } else { hay.chars().collect() };
    let pat_chars: Vec<char> = if ci { pattern.to_lowercase().chars().collect() } else { pattern.chars().collect() };
    like_rec(&hay_chars, &pat_chars)
}

fn like_rec(hay: &[char], pat: &[char]) -> bool {
    match pat.first() {
        None => hay.is_empty(),
        Some('\\') if pat.len() > 1 => {
            if hay.first() == Some(&pat[1]) {
                like_rec(&hay[1..], &pat[2..])
            } else {
                false
            }
        }
        Some('%') => {
            like_rec(hay, &pat[1..]) || (!hay.is_empty() && like_rec(&hay[1..], pat))
        }
        Some('_') => !hay.is_empty() && like_rec(&hay[1..], &pat[1..]),
        Some(c) => hay.first() == Some(c) && like_rec(&hay[1..], &pat[1..]),
    }
}

fn range(actual: &Value, operand: &Operand) -> bool {
    let Operand::Range(lo, hi) = operand else { return false };
    let (Some(a), Some(b)) = (actual.partial_cmp(lo), actual.partial_cmp(hi)) else {
        return false;
    };
    !a.is_lt() && !b.is_gt()
}

enum LengthCmp {
    Eq,
    Min,
    Max,
}

fn length_cmp(actual: &Value, operand: &Operand, kind: LengthCmp) -> bool {
    let Some(n) = scalar(operand).and_then(Value::as_f64) else { return false };
    let len = match actual {
        Value::String(s) => s.chars().count() as f64,
        Value::Null => 0.0,
        other => other.as_normalized_string().chars().count() as f64,
    };
    match kind {
        LengthCmp::Eq => len == n,
        LengthCmp::Min => len >= n,
        LengthCmp::Max => len <= n,
    }
}

fn regex_match(actual: &Value, operand: &Operand, ci: bool) -> bool {
    let Some(Value::String(pattern)) = scalar(operand) else { return false };
    let hay = actual.as_normalized_string();
    match RegexBuilder::new(pattern).case_insensitive(ci).build() {
        Ok(re) => re.is_match(&hay),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::filter::parser::parse;
    use crate::schema::{FieldType, ResourceSchema};
    use std::collections::BTreeMap;

    fn schema() -> ResourceSchema {
        ResourceSchema::new("widgets", "id")
            .with_field("status", FieldType::String)
            .with_field("score", FieldType::Number)
            .with_field("value", FieldType::Number)
            .with_field("tags", FieldType::String)
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn scenario_2_boolean_algebra() {
        let node = parse(
            r#"status=="active";score>=50"#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        assert!(node.evaluate(&record(&[
            ("status", Value::String("active".into())),
            ("score", Value::Number(50.0)),
        ])));
        assert!(!node.evaluate(&record(&[
            ("status", Value::String("active".into())),
            ("score", Value::Number(49.0)),
        ])));
        assert!(!node.evaluate(&record(&[
            ("status", Value::String("inactive".into())),
            ("score", Value::Number(99.0)),
        ])));
    }

    #[test]
    fn like_percent_and_underscore() {
        let node = parse(r#"status%="a_t%""#, &schema(), &EngineConfig::default()).unwrap();
        assert!(node.evaluate(&record(&[("status", Value::String("active".into()))])));
        assert!(!node.evaluate(&record(&[("status", Value::String("xyz".into()))])));
    }

    #[test]
    fn in_operator_compares_by_normalized_string() {
        let node = parse(r#"score=in=(1,2,3)"#, &schema(), &EngineConfig::default()).unwrap();
        assert!(node.evaluate(&record(&[("score", Value::Number(2.0))])));
        assert!(!node.evaluate(&record(&[("score", Value::Number(4.0))])));
    }

    #[test]
    fn between_is_inclusive() {
        let node = parse(r#"score=between=[10,20]"#, &schema(), &EngineConfig::default()).unwrap();
        assert!(node.evaluate(&record(&[("score", Value::Number(10.0))])));
        assert!(node.evaluate(&record(&[("score", Value::Number(20.0))])));
        assert!(!node.evaluate(&record(&[("score", Value::Number(21.0))])));
    }

    #[test]
    fn missing_field_treated_as_null() {
        let node = parse(r#"status=="active""#, &schema(), &EngineConfig::default()).unwrap();
        assert!(!node.evaluate(&record(&[])));
        let isnull = parse(r#"status=isnull="#, &schema(), &EngineConfig::default()).unwrap();
        assert!(isnull.evaluate(&record(&[])));
    }
}
