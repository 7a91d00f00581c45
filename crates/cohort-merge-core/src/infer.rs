use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::{Cell, ColumnSpec, ColumnType};

/// Infers the semantic type of one column from its observed values.
///
/// Nulls are ignored. Integers win over reals, numbers win over dates, and
/// anything else is text. A column with no values at all is text.
pub fn infer_column_type<'a, I>(values: I) -> ColumnType
where
    I: IntoIterator<Item = &'a Cell>,
{
    let mut observed = false;
    let mut all_integer = true;
    let mut all_real = true;
    let mut all_date = true;

    for value in values.into_iter().flatten() {
        observed = true;
        all_integer = all_integer && is_integer(value);
        all_real = all_real && is_real(value);
        all_date = all_date && is_date(value);
        if !all_real && !all_date {
            return ColumnType::Text;
        }
    }

    if !observed {
        ColumnType::Text
    } else if all_integer {
        ColumnType::Integer
    } else if all_real {
        ColumnType::Real
    } else if all_date {
        ColumnType::Date
    } else {
        ColumnType::Text
    }
}

#[must_use]
pub fn infer_schema(columns: &[String], rows: &[Vec<Cell>]) -> Vec<ColumnSpec> {
    columns
        .iter()
        .enumerate()
        .map(|(index, name)| ColumnSpec {
            name: name.clone(),
            column_type: infer_column_type(rows.iter().filter_map(|row| row.get(index))),
        })
        .collect()
}

fn unsigned_part(value: &str) -> &str {
    value
        .strip_prefix('-')
        .or_else(|| value.strip_prefix('+'))
        .unwrap_or(value)
}

// Codes such as ZIP "02138" must stay text.
fn has_leading_zero(digits: &str) -> bool {
    let bytes = digits.as_bytes();
    bytes.len() > 1 && bytes[0] == b'0' && bytes[1].is_ascii_digit()
}

pub(crate) fn is_integer(value: &str) -> bool {
    let digits = unsigned_part(value);
    !digits.is_empty()
        && digits.bytes().all(|byte| byte.is_ascii_digit())
        && !has_leading_zero(digits)
        && value.parse::<i64>().is_ok()
}

pub(crate) fn is_real(value: &str) -> bool {
    if is_integer(value) {
        return true;
    }
    let body = unsigned_part(value);
    body.bytes().any(|byte| byte.is_ascii_digit())
        && body
            .bytes()
            .all(|byte| byte.is_ascii_digit() || matches!(byte, b'.' | b'e' | b'E' | b'-' | b'+'))
        && !has_leading_zero(body)
        && value.parse::<f64>().is_ok_and(f64::is_finite)
}

pub(crate) fn is_date(value: &str) -> bool {
    Date::parse(value, format_description!("[year]-[month]-[day]")).is_ok()
        || PrimitiveDateTime::parse(
            value,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
        .is_ok()
        || OffsetDateTime::parse(value, &Rfc3339).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[Option<&str>]) -> Vec<Cell> {
        values.iter().map(|value| value.map(str::to_string)).collect()
    }

    #[test]
    fn integers_reals_dates_and_text_are_distinguished() {
        assert_eq!(
            infer_column_type(&cells(&[Some("1"), Some("-42"), None])),
            ColumnType::Integer
        );
        assert_eq!(
            infer_column_type(&cells(&[Some("1"), Some("263.49")])),
            ColumnType::Real
        );
        assert_eq!(
            infer_column_type(&cells(&[Some("2019-02-17"), Some("2020-01-01T10:00:00Z")])),
            ColumnType::Date
        );
        assert_eq!(
            infer_column_type(&cells(&[Some("2019-02-17 05:07:38")])),
            ColumnType::Date
        );
        assert_eq!(
            infer_column_type(&cells(&[Some("12"), Some("aspirin")])),
            ColumnType::Text
        );
    }

    #[test]
    fn leading_zero_codes_and_special_floats_stay_text() {
        assert_eq!(infer_column_type(&cells(&[Some("02138")])), ColumnType::Text);
        assert_eq!(infer_column_type(&cells(&[Some("NaN")])), ColumnType::Text);
        assert_eq!(infer_column_type(&cells(&[Some("inf")])), ColumnType::Text);
        assert_eq!(infer_column_type(&cells(&[Some("0")])), ColumnType::Integer);
        assert_eq!(infer_column_type(&cells(&[Some("0.25")])), ColumnType::Real);
    }

    #[test]
    fn empty_or_all_null_columns_are_text() {
        assert_eq!(infer_column_type(&cells(&[])), ColumnType::Text);
        assert_eq!(infer_column_type(&cells(&[None, None])), ColumnType::Text);
    }

    #[test]
    fn schema_inference_is_deterministic() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            cells(&[Some("1"), Some("x")]),
            cells(&[Some("2"), None]),
        ];
        let first = infer_schema(&columns, &rows);
        let second = infer_schema(&columns, &rows);
        assert_eq!(first, second);
        assert_eq!(first[0].column_type, ColumnType::Integer);
        assert_eq!(first[1].column_type, ColumnType::Text);
    }
}
