//! Decoding of `GRAPH.QUERY` replies.
//!
//! The graph module answers with a nested array: `[header, rows, stats]` for
//! queries with a RETURN clause, or `[stats]` for pure writes. Every query in
//! this crate returns scalars (explicit properties), so the decoder only has
//! to handle scalar cells — node/relation cells are rejected as a protocol
//! error rather than half-decoded.

use redis::Value;

use crate::error::{GraphError, Result};

/// One scalar cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) => Some(*f as i64),
            Scalar::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(f) => Some(*f),
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

/// Decoded reply of one `GRAPH.QUERY` call.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
    pub stats: Vec<String>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row, if any.
    pub fn single(&self) -> Option<&Scalar> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Build a ResultSet directly — used by test backends.
    pub fn table(columns: &[&str], rows: Vec<Vec<Scalar>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            stats: Vec::new(),
        }
    }
}

/// Decode the raw redis reply into a [`ResultSet`].
pub fn decode_reply(value: Value) -> Result<ResultSet> {
    let parts = match value {
        Value::Array(parts) => parts,
        other => {
            return Err(GraphError::Protocol(format!(
                "unexpected GRAPH.QUERY reply shape: {other:?}"
            )))
        }
    };

    match parts.len() {
        // Pure write: only the stats block.
        1 => Ok(ResultSet {
            columns: Vec::new(),
            rows: Vec::new(),
            stats: decode_stats(&parts[0]),
        }),
        3 => {
            let mut iter = parts.into_iter();
            let header = iter.next().expect("len checked");
            let data = iter.next().expect("len checked");
            let stats = iter.next().expect("len checked");

            Ok(ResultSet {
                columns: decode_header(header)?,
                rows: decode_rows(data)?,
                stats: decode_stats(&stats),
            })
        }
        n => Err(GraphError::Protocol(format!(
            "unexpected GRAPH.QUERY reply arity: {n}"
        ))),
    }
}

fn decode_header(value: Value) -> Result<Vec<String>> {
    let Value::Array(cols) = value else {
        return Err(GraphError::Protocol("header is not an array".into()));
    };
    cols.into_iter().map(text_of).collect()
}

fn decode_rows(value: Value) -> Result<Vec<Vec<Scalar>>> {
    let Value::Array(rows) = value else {
        return Err(GraphError::Protocol("row block is not an array".into()));
    };
    rows.into_iter()
        .map(|row| {
            let Value::Array(cells) = row else {
                return Err(GraphError::Protocol("row is not an array".into()));
            };
            cells.into_iter().map(decode_scalar).collect()
        })
        .collect()
}

fn decode_scalar(value: Value) -> Result<Scalar> {
    match value {
        Value::Nil => Ok(Scalar::Null),
        Value::Int(i) => Ok(Scalar::Int(i)),
        Value::Double(f) => Ok(Scalar::Float(f)),
        Value::Boolean(b) => Ok(Scalar::Bool(b)),
        Value::BulkString(bytes) => {
            let s = String::from_utf8_lossy(&bytes).into_owned();
            Ok(Scalar::Text(s))
        }
        Value::SimpleString(s) => Ok(Scalar::Text(s)),
        other => Err(GraphError::Protocol(format!(
            "non-scalar result cell: {other:?} (RETURN properties, not nodes)"
        ))),
    }
}

fn decode_stats(value: &Value) -> Vec<String> {
    match value {
        Value::Array(lines) => lines
            .iter()
            .filter_map(|l| match l {
                Value::SimpleString(s) => Some(s.clone()),
                Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn text_of(value: Value) -> Result<String> {
    match value {
        Value::SimpleString(s) => Ok(s),
        Value::BulkString(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        other => Err(GraphError::Protocol(format!(
            "expected text, got {other:?}"
        ))),
    }
}
