// Recursive-descent parser for the filter expression grammar (§4.A).

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::schema::ResourceSchema;
use crate::value::Value;

use super::ast::{FilterNode, Operand, Operator};

pub fn parse(
    expr: &str,
    schema: &ResourceSchema,
    config: &EngineConfig,
) -> Result<FilterNode> {
    if expr.len() > config.max_expression_length {
        return Err(EngineError::ComplexityExceeded(format!(
            "expression length {} exceeds max {}",
            expr.len(),
            config.max_expression_length
        )));
    }
    let mut parser = Parser {
        input: expr,
        bytes: expr.as_bytes(),
        pos: 0,
        schema,
    };
    let node = parser.parse_or(0)?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        return Err(parser.err_at(parser.pos, "unexpected trailing input", None));
    }
    if node.depth() > config.max_filter_depth {
        return Err(EngineError::ComplexityExceeded(format!(
            "filter depth {} exceeds max {}",
            node.depth(),
            config.max_filter_depth
        )));
    }
    if node.atomic_count() > config.max_atomic_nodes {
        return Err(EngineError::ComplexityExceeded(format!(
            "atomic node count {} exceeds max {}",
            node.atomic_count(),
            config.max_atomic_nodes
        )));
    }
    Ok(node)
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
    schema: &'a ResourceSchema,
}

const AND_SYMBOLS: &[&str] = &[";", "&&"];
const OR_SYMBOLS: &[&str] = &[",", "||"];

impl<'a> Parser<'a> {
    fn err_at(&self, pos: usize, message: &str, suggestion: Option<&str>) -> EngineError {
        EngineError::FilterParse {
            position: pos,
            message: message.to_string(),
            parsed_so_far: self.input[..pos.min(self.input.len())].to_string(),
            suggestion: suggestion.map(str::to_string),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn try_consume_literal(&mut self, lit: &str) -> bool {
        if self.remaining().starts_with(lit) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    /// Matches `and`/`or` case-insensitively at a word boundary (§4.A:
    /// "Keywords `and`/`or` accepted case-insensitively as alternatives").
    fn try_consume_keyword(&mut self, kw: &str) -> bool {
        let rem = self.remaining();
        if rem.len() < kw.len() {
            return false;
        }
        if !rem[..kw.len()].eq_ignore_ascii_case(kw) {
            return false;
        }
        let after = rem[kw.len()..].chars().next();
        if let Some(c) = after {
            if c.is_alphanumeric() || c == '_' {
                return false;
            }
        }
        self.pos += kw.len();
        true
    }

    fn try_consume_and_sep(&mut self) -> bool {
        self.skip_ws();
        for sym in AND_SYMBOLS {
            if self.try_consume_literal(sym) {
                return true;
            }
        }
        if self.try_consume_keyword("and") {
            return true;
        }
        false
    }

    fn try_consume_or_sep(&mut self) -> bool {
        self.skip_ws();
        for sym in OR_SYMBOLS {
            if self.try_consume_literal(sym) {
                return true;
            }
        }
        if self.try_consume_keyword("or") {
            return true;
        }
        false
    }

    fn parse_or(&mut self, depth: usize) -> Result<FilterNode> {
        let mut node = self.parse_and(depth)?;
        loop {
            let checkpoint = self.pos;
            if self.try_consume_or_sep() {
                let rhs = self.parse_and(depth)?;
                node = match node {
                    FilterNode::Or(mut xs) => {
                        xs.push(rhs);
                        FilterNode::Or(xs)
                    }
                    other => FilterNode::Or(vec![other, rhs]),
                };
            } else {
                self.pos = checkpoint;
                break;
            }
        }
        Ok(node)
    }

    fn parse_and(&mut self, depth: usize) -> Result<FilterNode> {
        let mut node = self.parse_primary(depth)?;
        loop {
            let checkpoint = self.pos;
            if self.try_consume_and_sep() {
                // Don't swallow an OR separator that looks like an AND prefix.
                let rhs = self.parse_primary(depth)?;
                node = node.and(rhs);
            } else {
                self.pos = checkpoint;
                break;
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<FilterNode> {
        self.skip_ws();
        if self.eof() {
            return Err(self.err_at(self.pos, "unexpected end of expression", Some("add an atom")));
        }
        if self.bytes[self.pos] == b'(' {
            self.pos += 1;
            let inner = self.parse_or(depth + 1)?;
            self.skip_ws();
            if !self.try_consume_literal(")") {
                return Err(self.err_at(self.pos, "expected ')'", Some("close the group")));
            }
            return Ok(inner);
        }
        self.parse_atom()
    }

    fn parse_identifier(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.remaining().chars().next() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err_at(start, "expected a field name", Some("e.g. `status==\"active\"`")));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_operator(&mut self) -> Result<Operator> {
        self.skip_ws();
        for (token, op) in Operator::ALL {
            if self.try_consume_literal(token) {
                return Ok(*op);
            }
        }
        Err(self.err_at(
            self.pos,
            "expected a comparison operator",
            Some("valid operators include ==, !=, <, <=, >, >=, =in=, =contains=, ..."),
        ))
    }

    fn parse_atom(&mut self) -> Result<FilterNode> {
        let field = self.parse_identifier()?;
        if self.schema.field(&field).is_none() {
            return Err(EngineError::UnknownField(field));
        }
        if !self.schema.is_filterable(&field) {
            return Err(EngineError::DisallowedField(field));
        }
        let op_pos = self.pos;
        let operator = self.parse_operator()?;
        let _ = op_pos;
        let operand = self.parse_operand(operator)?;
        Ok(FilterNode::Op {
            field,
            operator,
            operand,
        })
    }

    fn parse_operand(&mut self, operator: Operator) -> Result<Operand> {
        use Operator::*;
        match operator {
            IsNull | IsEmpty => {
                self.skip_ws();
                if self.try_consume_literal("true") {
                    Ok(Operand::Bool(true))
                } else if self.try_consume_literal("false") {
                    Ok(Operand::Bool(false))
                } else {
                    Ok(Operand::Bool(true))
                }
            }
            In | Out => {
                let values = self.parse_set()?;
                Ok(Operand::Set(values))
            }
            Between | NotBetween => {
                let (lo, hi) = self.parse_range()?;
                Ok(Operand::Range(lo, hi))
            }
            _ => {
                let value = self.parse_value()?;
                Ok(Operand::Scalar(value))
            }
        }
    }

    fn parse_set(&mut self) -> Result<Vec<Value>> {
        self.skip_ws();
        if !self.try_consume_literal("(") {
            return Err(self.err_at(self.pos, "expected '(' to start a set", Some("e.g. `status=in=(\"a\",\"b\")`")));
        }
        let mut values = Vec::new();
        self.skip_ws();
        if !self.remaining().starts_with(')') {
            loop {
                values.push(self.parse_value()?);
                self.skip_ws();
                if self.try_consume_literal(",") {
                    continue;
                }
                break;
            }
        }
        self.skip_ws();
        if !self.try_consume_literal(")") {
            return Err(self.err_at(self.pos, "expected ')' to close a set", None));
        }
        Ok(values)
    }

    fn parse_range(&mut self) -> Result<(Value, Value)> {
        self.skip_ws();
        if !self.try_consume_literal("[") {
            return Err(self.err_at(self.pos, "expected '[' to start a range", Some("e.g. `score=between=[10,20]`")));
        }
        let lo = self.parse_value()?;
        self.skip_ws();
        if !self.try_consume_literal(",") {
            return Err(self.err_at(self.pos, "expected ',' inside a range", None));
        }
        let hi = self.parse_value()?;
        self.skip_ws();
        if !self.try_consume_literal("]") {
            return Err(self.err_at(self.pos, "expected ']' to close a range", None));
        }
        Ok((lo, hi))
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_ws();
        if self.eof() {
            return Err(self.err_at(self.pos, "expected a value", None));
        }
        let c = self.bytes[self.pos];
        match c {
            b'\'' | b'"' => self.parse_quoted_string(c as char),
            b'-' | b'0'..=b'9' => self.parse_number(),
            _ => self.parse_keyword_value(),
        }
    }

    fn parse_quoted_string(&mut self, quote: char) -> Result<Value> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.remaining().chars().next() {
                None => return Err(self.err_at(self.pos, "unterminated string literal", None)),
                Some('\\') => {
                    self.pos += 1;
                    match self.remaining().chars().next() {
                        Some(esc) => {
                            out.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            self.pos += esc.len_utf8();
                        }
                        None => return Err(self.err_at(self.pos, "unterminated escape", None)),
                    }
                }
                Some(c) if c == quote => {
                    self.pos += c.len_utf8();
                    break;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        Ok(Value::String(out))
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.bytes[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.' {
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.pos < self.bytes.len() && (self.bytes[self.pos] == b'e' || self.bytes[self.pos] == b'E') {
            self.pos += 1;
            if self.pos < self.bytes.len() && (self.bytes[self.pos] == b'+' || self.bytes[self.pos] == b'-') {
                self.pos += 1;
            }
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map(Value::Number)
            .map_err(|_| self.err_at(start, "invalid number literal", None))
    }

    fn parse_keyword_value(&mut self) -> Result<Value> {
        if self.try_consume_literal("true") {
            return Ok(Value::Boolean(true));
        }
        if self.try_consume_literal("false") {
            return Ok(Value::Boolean(false));
        }
        if self.try_consume_literal("null") {
            return Ok(Value::Null);
        }
        Err(self.err_at(
            self.pos,
            "expected a quoted string, number, true/false, or null",
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, ResourceSchema};

    fn schema() -> ResourceSchema {
        ResourceSchema::new("widgets", "id")
            .with_field("status", FieldType::String)
            .with_field("score", FieldType::Number)
            .with_field("value", FieldType::Number)
            .with_unfilterable_field("secret", FieldType::String)
    }

    #[test]
    fn parses_simple_comparison() {
        let node = parse("value>50", &schema(), &EngineConfig::default()).unwrap();
        assert_eq!(node.atomic_count(), 1);
    }

    #[test]
    fn parses_and_with_semicolon() {
        let node = parse(
            r#"status=="active";score>=50"#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        match node {
            FilterNode::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn parses_or_with_keyword_case_insensitive() {
        let node = parse(
            r#"status=="active" OR status=="pending""#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        match node {
            FilterNode::Or(children) => assert_eq!(children.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a OR b AND c == a OR (b AND c)
        let node = parse(
            r#"status=="x",status=="y";score>1"#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        match node {
            FilterNode::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], FilterNode::And(_)));
            }
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn grouping_parens_override_precedence() {
        let node = parse(
            r#"(status=="x",status=="y");score>1"#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        match node {
            FilterNode::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], FilterNode::Or(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn unknown_field_fails() {
        let err = parse("bogus==1", &schema(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownField(_)));
    }

    #[test]
    fn disallowed_field_fails() {
        let err = parse(r#"secret=="x""#, &schema(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::DisallowedField(_)));
    }

    #[test]
    fn unknown_operator_fails_with_position() {
        let err = parse("value~~50", &schema(), &EngineConfig::default()).unwrap_err();
        match err {
            EngineError::FilterParse { position, .. } => assert_eq!(position, 5),
            other => panic!("expected FilterParse, got {other:?}"),
        }
    }

    #[test]
    fn set_and_range_operands_parse() {
        let node = parse(
            r#"status=in=("a","b","c")"#,
            &schema(),
            &EngineConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            node,
            FilterNode::Op {
                operand: Operand::Set(_),
                ..
            }
        ));

        let node2 = parse("score=between=[10,20]", &schema(), &EngineConfig::default()).unwrap();
        assert!(matches!(
            node2,
            FilterNode::Op {
                operand: Operand::Range(_, _),
                ..
            }
        ));
    }

    #[test]
    fn complexity_limits_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.max_atomic_nodes = 1;
        let err = parse(
            r#"score>1;score<10"#,
            &schema(),
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ComplexityExceeded(_)));
    }
}
