//! Execution Result - structured rows returned by the analytical backend

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Backend-reported cost of the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStatistics {
    /// Seconds
    #[serde(default)]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub rows_read: Option<u64>,
    #[serde(default)]
    pub bytes_read: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Row count as reported by the backend
    pub row_count: u64,

    /// Column names in backend order: from `meta` when present, else the
    /// key order of the first row as received
    pub columns: Vec<String>,

    /// Rows as column -> scalar mappings
    pub rows: Vec<Map<String, Value>>,

    /// HTTP status of the successful response
    pub status: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<QueryStatistics>,
}

impl ExecutionResult {
    /// Parse a success body of the form
    /// `{"meta": [{"name": ..}], "data": [{..}], "rows": n, "statistics": {..}}`.
    pub fn from_response(status: u16, body: &Value) -> Result<Self, ExecutionError> {
        let data = body
            .get("data")
            .ok_or_else(|| ExecutionError::MalformedResponse("missing 'data' field".to_string()))?
            .as_array()
            .ok_or_else(|| {
                ExecutionError::MalformedResponse("'data' is not an array".to_string())
            })?;

        let row_count = body
            .get("rows")
            .ok_or_else(|| ExecutionError::MalformedResponse("missing 'rows' field".to_string()))?
            .as_u64()
            .ok_or_else(|| {
                ExecutionError::MalformedResponse("'rows' is not a non-negative integer".to_string())
            })?;

        let rows = data
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                row.as_object().cloned().ok_or_else(|| {
                    ExecutionError::MalformedResponse(format!("row {} is not an object", idx))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let columns = match body.get("meta").and_then(|m| m.as_array()) {
            Some(meta) => meta
                .iter()
                .filter_map(|c| c.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect(),
            None => rows
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default(),
        };

        let statistics = body
            .get("statistics")
            .and_then(|s| serde_json::from_value::<QueryStatistics>(s.clone()).ok());

        Ok(Self {
            row_count,
            columns,
            rows,
            status,
            statistics,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First value of the first row, for single-aggregate queries.
    pub fn scalar(&self) -> Option<&Value> {
        let row = self.rows.first()?;
        match self.columns.first() {
            Some(column) => row.get(column),
            None => row.values().next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_rows_meta_and_statistics() {
        let body = json!({
            "meta": [{"name": "department", "type": "String"}, {"name": "c", "type": "UInt64"}],
            "data": [{"department": "Sales", "c": 446}, {"department": "Research & Development", "c": 961}],
            "rows": 2,
            "statistics": {"elapsed": 0.0012, "rows_read": 1470, "bytes_read": 30000}
        });
        let result = ExecutionResult::from_response(200, &body).unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns, vec!["department", "c"]);
        assert_eq!(result.rows[1]["c"], 961);
        assert_eq!(result.status, 200);
        assert_eq!(result.statistics.unwrap().rows_read, Some(1470));
    }

    #[test]
    fn test_columns_fall_back_to_first_row() {
        let body = json!({"data": [{"count()": 1470}], "rows": 1});
        let result = ExecutionResult::from_response(200, &body).unwrap();
        assert_eq!(result.columns, vec!["count()"]);
        assert_eq!(result.scalar(), Some(&json!(1470)));
        assert!(result.statistics.is_none());
    }

    #[test]
    fn test_fallback_columns_keep_response_order() {
        let body: Value =
            serde_json::from_str(r#"{"data": [{"zeta": 1, "alpha": 2, "mid": 3}], "rows": 1}"#).unwrap();
        let result = ExecutionResult::from_response(200, &body).unwrap();
        assert_eq!(result.columns, vec!["zeta", "alpha", "mid"]);
        assert_eq!(result.scalar(), Some(&json!(1)));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        for body in [
            json!({"rows": 1}),
            json!({"data": []}),
            json!({"data": {}, "rows": 0}),
            json!({"data": [1, 2], "rows": 2}),
            json!({"data": [], "rows": -1}),
        ] {
            assert!(
                matches!(
                    ExecutionResult::from_response(200, &body),
                    Err(ExecutionError::MalformedResponse(_))
                ),
                "body: {body}"
            );
        }
    }
}
