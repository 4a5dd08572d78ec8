// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Channel values.
//!
//! Data sources decode whatever their transport carries into one of a small,
//! fixed set of value kinds. Everything above the data source matches on
//! [`Value`] exhaustively.

use serde::{Deserialize, Serialize};

use std::fmt;

/// A decoded channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Double(f64),
    Int(i64),
    Text(String),
    Bool(bool),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
}

impl Value {
    /// Name of the value kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::DoubleArray(_) => "double array",
            Value::IntArray(_) => "int array",
        }
    }

    /// True if both values have the same kind.
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            Value::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Value::Text(_) | Value::DoubleArray(_) | Value::IntArray(_) => {
                None
            }
        }
    }

    /// Parses the literal forms accepted in channel names: integers,
    /// decimals, `true`/`false`, quoted text and `[a, b, c]` numeric arrays.
    pub fn parse(literal: &str) -> Option<Value> {
        let literal = literal.trim();
        if literal.len() >= 2 && literal.starts_with('"') && literal.ends_with('"')
        {
            return Some(Value::Text(literal[1..literal.len() - 1].to_owned()));
        }
        if let Some(items) =
            literal.strip_prefix('[').and_then(|l| l.strip_suffix(']'))
        {
            let items: Vec<&str> = items
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .collect();
            if let Ok(ints) =
                items.iter().map(|i| i.parse::<i64>()).collect::<Result<Vec<_>, _>>()
            {
                return Some(Value::IntArray(ints));
            }
            return items
                .iter()
                .map(|i| i.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .ok()
                .map(Value::DoubleArray);
        }
        match literal {
            "true" => return Some(Value::Bool(true)),
            "false" => return Some(Value::Bool(false)),
            _ => {}
        }
        if let Ok(value) = literal.parse::<i64>() {
            return Some(Value::Int(value));
        }
        literal.parse::<f64>().ok().map(Value::Double)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Text(value) => write!(f, "\"{}\"", value),
            Value::Bool(value) => write!(f, "{}", value),
            Value::DoubleArray(values) => write!(f, "{:?}", values),
            Value::IntArray(values) => write!(f, "{:?}", values),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(Value::parse("42"), Some(Value::Int(42)));
        assert_eq!(Value::parse(" 3.5 "), Some(Value::Double(3.5)));
        assert_eq!(Value::parse("true"), Some(Value::Bool(true)));
        assert_eq!(
            Value::parse("\"hello\""),
            Some(Value::Text("hello".to_owned()))
        );
        assert_eq!(Value::parse("[1, 2, 3]"), Some(Value::IntArray(vec![1, 2, 3])));
        assert_eq!(
            Value::parse("[1.5,2]"),
            Some(Value::DoubleArray(vec![1.5, 2.0]))
        );
        assert_eq!(Value::parse("nope"), None);
    }

    #[test]
    fn test_kinds() {
        assert!(Value::Int(1).same_kind(&Value::Int(7)));
        assert!(!Value::Int(1).same_kind(&Value::Double(1.0)));
        assert_eq!(Value::Int(2).as_f64(), Some(2.0));
        assert_eq!(Value::from("x").as_f64(), None);
        assert_eq!(Value::from("x").kind_name(), "text");
    }
}
