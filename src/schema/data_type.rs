use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

static ISO_DATE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?$")
        .unwrap()
});

/// Observed type of a property value.
///
/// Variant order matters: within the integral and the floating families a later
/// variant is wider than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    None,
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    String,
    Date,
}

impl DataType {
    pub fn for_value(value: &Value) -> DataType {
        match value {
            Value::Null => DataType::None,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => DataType::Integer,
                Some(_) => DataType::Long,
                None if n.is_u64() => DataType::Long,
                None => DataType::Double,
            },
            Value::String(s) if ISO_DATE_REGEX.is_match(s) => DataType::Date,
            Value::String(_) => DataType::String,
            Value::Array(items) => items
                .iter()
                .map(DataType::for_value)
                .fold(DataType::None, DataType::widen),
            Value::Object(_) => DataType::String,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            DataType::Byte | DataType::Short | DataType::Integer | DataType::Long
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// Narrowest type that can represent values of both types.
    pub fn widen(self, other: DataType) -> DataType {
        if self == other {
            return self;
        }
        match (self, other) {
            (DataType::None, t) | (t, DataType::None) => t,
            (a, b) if a.is_integral() && b.is_integral() => a.max(b),
            (a, b) if a.is_floating() && b.is_floating() => a.max(b),
            (a, b) if a.is_numeric() && b.is_numeric() => DataType::Double,
            _ => DataType::String,
        }
    }

    /// Type name used in CSV column headers.
    pub fn csv_name(&self) -> &'static str {
        match self {
            DataType::None | DataType::String => "String",
            DataType::Boolean => "Bool",
            DataType::Byte => "Byte",
            DataType::Short => "Short",
            DataType::Integer => "Int",
            DataType::Long => "Long",
            DataType::Float => "Float",
            DataType::Double => "Double",
            DataType::Date => "Date",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_scalar_types() {
        assert_eq!(DataType::for_value(&json!(true)), DataType::Boolean);
        assert_eq!(DataType::for_value(&json!(29)), DataType::Integer);
        assert_eq!(DataType::for_value(&json!(5_000_000_000i64)), DataType::Long);
        assert_eq!(DataType::for_value(&json!(0.5)), DataType::Double);
        assert_eq!(DataType::for_value(&json!("marko")), DataType::String);
        assert_eq!(DataType::for_value(&json!("2024-01-31")), DataType::Date);
        assert_eq!(
            DataType::for_value(&json!("2024-01-31T10:15:00Z")),
            DataType::Date
        );
        assert_eq!(DataType::for_value(&json!(null)), DataType::None);
    }

    #[test]
    fn list_type_is_widest_item() {
        assert_eq!(DataType::for_value(&json!([1, 2.5])), DataType::Double);
        assert_eq!(DataType::for_value(&json!([])), DataType::None);
    }

    #[test]
    fn widening() {
        assert_eq!(DataType::Integer.widen(DataType::Long), DataType::Long);
        assert_eq!(DataType::Float.widen(DataType::Double), DataType::Double);
        assert_eq!(DataType::Long.widen(DataType::Float), DataType::Double);
        assert_eq!(DataType::Date.widen(DataType::String), DataType::String);
        assert_eq!(DataType::Boolean.widen(DataType::Integer), DataType::String);
        assert_eq!(DataType::None.widen(DataType::Date), DataType::Date);
    }

    #[test]
    fn widening_is_commutative() {
        let all = [
            DataType::None,
            DataType::Boolean,
            DataType::Byte,
            DataType::Short,
            DataType::Integer,
            DataType::Long,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::Date,
        ];
        for a in all {
            for b in all {
                assert_eq!(a.widen(b), b.widen(a), "{a} / {b}");
            }
        }
    }

    #[test]
    fn csv_names() {
        assert_eq!(DataType::Integer.csv_name(), "Int");
        assert_eq!(DataType::Boolean.csv_name(), "Bool");
        assert_eq!(DataType::None.csv_name(), "String");
    }
}
