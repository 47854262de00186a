// `toSQL`: produces a parameterised predicate (§3, §4.A). No literal is
// ever interpolated into SQL text — every literal is bound as a parameter,
// consumed by the DB substrate's parameterised-predicate capability (§6).

use crate::value::Value;

use super::ast::{FilterNode, Operand, Operator};

/// A parameterised SQL fragment: `sql` contains positional placeholders
/// (`$1`, `$2`, ...) resolved against `params` in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub sql: String,
    pub params: Vec<Value>,
}

impl FilterNode {
    pub fn to_sql(&self) -> SqlPredicate {
        let mut params = Vec::new();
        let sql = to_sql_rec(self, &mut params);
        SqlPredicate { sql, params }
    }
}

fn placeholder(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("${}", params.len())
}

fn quote_ident(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn to_sql_rec(node: &FilterNode, params: &mut Vec<Value>) -> String {
    match node {
        FilterNode::True => "TRUE".to_string(),
        FilterNode::And(children) => join(children, " AND ", params),
        FilterNode::Or(children) => join(children, " OR ", params),
        FilterNode::Op {
            field,
            operator,
            operand,
        } => op_to_sql(field, *operator, operand, params),
    }
}

fn join(children: &[FilterNode], sep: &str, params: &mut Vec<Value>) -> String {
    if children.is_empty() {
        return "TRUE".to_string();
    }
    let parts: Vec<String> = children.iter().map(|c| format!("({})", to_sql_rec(c, params))).collect();
    parts.join(sep)
}

fn op_to_sql(field: &str, operator: Operator, operand: &Operand, params: &mut Vec<Value>) -> String {
    use Operator::*;
    let col = quote_ident(field);
    match operator {
        IsNull => {
            let negate = matches!(operand, Operand::Bool(false));
            if negate {
                format!("{col} IS NOT NULL")
            } else {
                format!("{col} IS NULL")
            }
        }
        IsEmpty => {
            let negate = matches!(operand, Operand::Bool(false));
            if negate {
                format!("({col} IS NOT NULL AND {col} <> '')")
            } else {
                format!("({col} IS NULL OR {col} = '')")
            }
        }
        Eq => binary(&col, "=", operand, params),
        Ne => binary(&col, "<>", operand, params),
        IEq => format!("LOWER({col}::text) = LOWER({})", bind(operand, params)),
        INe => format!("LOWER({col}::text) <> LOWER({})", bind(operand, params)),
        Lt => binary(&col, "<", operand, params),
        Le => binary(&col, "<=", operand, params),
        Gt => binary(&col, ">", operand, params),
        Ge => binary(&col, ">=", operand, params),
        In => set_predicate(&col, operand, params, false),
        Out => set_predicate(&col, operand, params, true),
        Like => format!("{col} LIKE {} ESCAPE '\\'", bind(operand, params)),
        NotLike => format!("{col} NOT LIKE {} ESCAPE '\\'", bind(operand, params)),
        ILike => format!("{col} ILIKE {} ESCAPE '\\'", bind(operand, params)),
        NotILike => format!("{col} NOT ILIKE {} ESCAPE '\\'", bind(operand, params)),
        Contains => wrapped_like(&col, operand, params, "%", "%"),
        IContains => wrapped_ilike(&col, operand, params, "%", "%"),
        StartsWith => wrapped_like(&col, operand, params, "", "%"),
        IStartsWith => wrapped_ilike(&col, operand, params, "", "%"),
        EndsWith => wrapped_like(&col, operand, params, "%", ""),
        IEndsWith => wrapped_ilike(&col, operand, params, "%", ""),
        Between => range_predicate(&col, operand, params, false),
        NotBetween => range_predicate(&col, operand, params, true),
        Length => format!("LENGTH({col}::text) = {}", bind(operand, params)),
        MinLength => format!("LENGTH({col}::text) >= {}", bind(operand, params)),
        MaxLength => format!("LENGTH({col}::text) <= {}", bind(operand, params)),
        // Regex has no portable SQL equivalent; fall back to a documented
        // approximation (§4.A: "SQL falls back to GLOB or a documented
        // approximation"). POSIX `~`/`~*` is the closest widely supported
        // analogue and is flagged as approximate for engines without it.
        Regex => format!("{col}::text ~ {}", bind(operand, params)),
        IRegex => format!("{col}::text ~* {}", bind(operand, params)),
    }
}

fn bind(operand: &Operand, params: &mut Vec<Value>) -> String {
    match operand {
        Operand::Scalar(v) => placeholder(params, v.clone()),
        Operand::Bool(b) => placeholder(params, Value::Boolean(*b)),
        _ => "NULL".to_string(),
    }
}

fn binary(col: &str, op: &str, operand: &Operand, params: &mut Vec<Value>) -> String {
    format!("{col} {op} {}", bind(operand, params))
}

fn wrapped_like(col: &str, operand: &Operand, params: &mut Vec<Value>, prefix: &str, suffix: &str) -> String {
    if let Operand::Scalar(Value::String(s)) = operand {
        let escaped = escape_like(s);
        let pattern = Value::String(format!("{prefix}{escaped}{suffix}"));
        format!("{col} LIKE {} ESCAPE '\\'", placeholder(params, pattern))
    } else {
        "FALSE".to_string()
    }
}

fn wrapped_ilike(col: &str, operand: &Operand, params: &mut Vec<Value>, prefix: &str, suffix: &str) -> String {
    if let Operand::Scalar(Value::String(s)) = operand {
        let escaped = escape_like(s);
        let pattern = Value::String(format!("{prefix}{escaped}{suffix}"));
        format!("{col} ILIKE {} ESCAPE '\\'", placeholder(params, pattern))
    } else {
        "FALSE".to_string()
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn set_predicate(col: &str, operand: &Operand, params: &mut Vec<Value>, negate: bool) -> String {
    let Operand::Set(values) = operand else { return "FALSE".to_string() };
    if values.is_empty() {
        return if negate { "TRUE".to_string() } else { "FALSE".to_string() };
    }
    let placeholders: Vec<String> = values
        .iter()
        .map(|v| placeholder(params, v.clone()))
        .collect();
    let list = placeholders.join(", ");
    if negate {
        format!("{col} NOT IN ({list})")
    } else {
        format!("{col} IN ({list})")
    }
}

fn range_predicate(col: &str, operand: &Operand, params: &mut Vec<Value>, negate: bool) -> String {
    let Operand::Range(lo, hi) = operand else { return "FALSE".to_string() };
    let lo_ph = placeholder(params, lo.clone());
    let hi_ph = placeholder(params, hi.clone());
    if negate {
        format!("{col} NOT BETWEEN {lo_ph} AND {hi_ph}")
    } else {
        format!("{col} BETWEEN {lo_ph} AND {hi_ph}")
    }
}
