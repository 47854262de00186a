// `select` field projection (SPEC_FULL.md §2 supplemented feature): a
// post-filter column allow-list applied to outgoing records, grounded on
// the teacher's `rest/handlers` response-shaping helpers.

use crate::value::Record;

/// Restricts `row` to `fields` when non-empty; an empty `fields` list
/// means "no projection requested", so the row passes through unchanged.
pub fn project(row: Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return row;
    }
    row.into_iter().filter(|(k, _)| fields.iter().any(|f| f == k)).collect()
}

/// Parses a comma-separated `select` query parameter into field names,
/// ignoring blanks produced by stray commas.
pub fn parse_select(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn empty_selection_passes_through() {
        let mut row = Record::new();
        row.insert("a".to_string(), Value::Number(1.0));
        assert_eq!(project(row.clone(), &[]), row);
    }

    #[test]
    fn selection_restricts_fields() {
        let mut row = Record::new();
        row.insert("a".to_string(), Value::Number(1.0));
        row.insert("b".to_string(), Value::Number(2.0));
        let projected = project(row, &["a".to_string()]);
        assert_eq!(projected.len(), 1);
        assert!(projected.contains_key("a"));
    }

    #[test]
    fn parse_select_trims_and_drops_blanks() {
        assert_eq!(parse_select(Some(" a, ,b ")), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parse_select(None), Vec::<String>::new());
    }
}
