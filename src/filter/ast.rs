// Compiled filter tree (§3 Data Model, §4.A Filter Engine). One tagged
// variant per node kind, exhaustive pattern match, no virtual dispatch
// (Design Note §9: "Inheritance of expression classes => one tagged
// variant per node kind").

use crate::value::Value;

/// The closed, ordered operator set (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Out,
    IsNull,
    IsEmpty,
    Like,
    NotLike,
    IEq,
    INe,
    ILike,
    NotILike,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Between,
    NotBetween,
    Length,
    MinLength,
    MaxLength,
    Regex,
    IRegex,
}

impl Operator {
    /// Every literal token this operator recognizes, longest first so the
    /// parser's tokenizer prefers `=isnull=` over a hypothetical shorter
    /// overlapping token.
    pub const ALL: &'static [(&'static str, Operator)] = &[
        ("=isnull=", Operator::IsNull),
        ("=isempty=", Operator::IsEmpty),
        ("=startswith=", Operator::StartsWith),
        ("=istartswith=", Operator::IStartsWith),
        ("=endswith=", Operator::EndsWith),
        ("=iendswith=", Operator::IEndsWith),
        ("=contains=", Operator::Contains),
        ("=icontains=", Operator::IContains),
        ("=nbetween=", Operator::NotBetween),
        ("=between=", Operator::Between),
        ("=minlength=", Operator::MinLength),
        ("=maxlength=", Operator::MaxLength),
        ("=iregex=", Operator::IRegex),
        ("=regex=", Operator::Regex),
        ("=length=", Operator::Length),
        ("=ilike=", Operator::ILike),
        ("=nilike=", Operator::NotILike),
        ("=ieq=", Operator::IEq),
        ("=ine=", Operator::INe),
        ("=in=", Operator::In),
        ("=out=", Operator::Out),
        ("=lt=", Operator::Lt),
        ("=le=", Operator::Le),
        ("=gt=", Operator::Gt),
        ("=ge=", Operator::Ge),
        ("!%=", Operator::NotLike),
        ("%=", Operator::Like),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        ("<=", Operator::Le),
        (">=", Operator::Ge),
        ("<", Operator::Lt),
        (">", Operator::Gt),
    ];

    /// Whether this operator is SQL-representable exactly, or only an
    /// approximation/fallback is offered by `to_sql` (§4.A: "regex ... SQL
    /// falls back to GLOB or a documented approximation").
    pub fn is_sql_exact(self) -> bool {
        !matches!(self, Operator::Regex | Operator::IRegex)
    }
}

/// A literal/set/range operand (§4.A Atoms).
#[derive(Debug, Clone)]
pub enum Operand {
    Scalar(Value),
    Set(Vec<Value>),
    Range(Value, Value),
    /// `=isnull=`/`=isempty=` take no operand value besides `true`/`false`.
    Bool(bool),
    None,
}

/// One node of the compiled, immutable filter tree.
#[derive(Debug, Clone)]
pub enum FilterNode {
    True,
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Op {
        field: String,
        operator: Operator,
        operand: Operand,
    },
}

impl FilterNode {
    /// Count of atomic `Op` nodes, for the complexity limit (§4.A).
    pub fn atomic_count(&self) -> usize {
        match self {
            FilterNode::True => 0,
            FilterNode::Op { .. } => 1,
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().map(FilterNode::atomic_count).sum()
            }
        }
    }

    /// Tree depth, for the complexity limit (§4.A).
    pub fn depth(&self) -> usize {
        match self {
            FilterNode::True | FilterNode::Op { .. } => 1,
            FilterNode::And(children) | FilterNode::Or(children) => {
                1 + children.iter().map(FilterNode::depth).max().unwrap_or(0)
            }
        }
    }

    pub fn and(self, other: FilterNode) -> FilterNode {
        match (self, other) {
            (FilterNode::True, b) => b,
            (a, FilterNode::True) => a,
            (FilterNode::And(mut xs), FilterNode::And(ys)) => {
                xs.extend(ys);
                FilterNode::And(xs)
            }
            (FilterNode::And(mut xs), b) => {
                xs.push(b);
                FilterNode::And(xs)
            }
            (a, b) => FilterNode::And(vec![a, b]),
        }
    }
}
