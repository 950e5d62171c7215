//! Schema Catalog
//!
//! Static description of the queryable table: column names, declared types and
//! optional value domains. Used to ground the generation prompt.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Declared column type. Serialized with the analytical backend's type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "Int16")]
    SmallInt,
    #[serde(rename = "Int32")]
    Int,
    #[serde(rename = "String")]
    String,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "Int16"),
            ColumnType::Int => write!(f, "Int32"),
            ColumnType::String => write!(f, "String"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Finite set of legal literal values, e.g. `["Yes", "No"]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl SchemaColumn {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            values: None,
        }
    }

    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub table: String,
    pub columns: Vec<SchemaColumn>,
}

impl SchemaCatalog {
    pub fn new(table: impl Into<String>, columns: Vec<SchemaColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// Load a catalog from a JSON file of the form
    /// `{"table": "...", "columns": [{"name": "...", "type": "Int16"}]}`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let catalog: SchemaCatalog =
            serde_json::from_str(&content).map_err(|e| ConfigError::File {
                path: path.display().to_string(),
                message: format!("invalid schema catalog: {}", e),
            })?;
        if catalog.columns.is_empty() {
            return Err(ConfigError::Invalid {
                key: "SCHEMA_PATH".to_string(),
                message: format!("schema catalog {} declares no columns", path.display()),
            });
        }
        Ok(catalog)
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Prompt-ready description of the table.
    pub fn describe(&self) -> String {
        let mut out = format!("Available columns in {} table:\n", self.table);
        for column in &self.columns {
            match &column.values {
                Some(values) if !values.is_empty() => {
                    let quoted: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
                    out.push_str(&format!(
                        "- {} ({}: {})\n",
                        column.name,
                        column.column_type,
                        quoted.join(" or ")
                    ));
                }
                _ => out.push_str(&format!("- {} ({})\n", column.name, column.column_type)),
            }
        }
        out
    }

    /// The IBM HR employee attrition dataset the service ships with.
    pub fn hr_attrition() -> Self {
        use ColumnType::{Int, SmallInt, String};

        let columns = vec![
            SchemaColumn::new("_age", SmallInt),
            SchemaColumn::new("attrition", String).with_values(&["Yes", "No"]),
            SchemaColumn::new("businesstravel", String),
            SchemaColumn::new("dailyrate", Int),
            SchemaColumn::new("department", String),
            SchemaColumn::new("distancefromhome", SmallInt),
            SchemaColumn::new("education", SmallInt),
            SchemaColumn::new("educationfield", String),
            SchemaColumn::new("employeecount", SmallInt),
            SchemaColumn::new("employeenumber", Int),
            SchemaColumn::new("environmentsatisfaction", SmallInt),
            SchemaColumn::new("gender", String),
            SchemaColumn::new("hourlyrate", SmallInt),
            SchemaColumn::new("jobinvolvement", SmallInt),
            SchemaColumn::new("joblevel", SmallInt),
            SchemaColumn::new("jobrole", String),
            SchemaColumn::new("jobsatisfaction", SmallInt),
            SchemaColumn::new("maritalstatus", String),
            SchemaColumn::new("monthlyincome", Int),
            SchemaColumn::new("monthlyrate", Int),
            SchemaColumn::new("numcompaniesworked", SmallInt),
            SchemaColumn::new("over18", String),
            SchemaColumn::new("overtime", String).with_values(&["Yes", "No"]),
            SchemaColumn::new("percentsalaryhike", SmallInt),
            SchemaColumn::new("performancerating", SmallInt),
            SchemaColumn::new("relationshipsatisfaction", SmallInt),
            SchemaColumn::new("standardhours", SmallInt),
            SchemaColumn::new("stockoptionlevel", SmallInt),
            SchemaColumn::new("totalworkingyears", SmallInt),
            SchemaColumn::new("trainingtimeslastyear", SmallInt),
            SchemaColumn::new("worklifebalance", SmallInt),
            SchemaColumn::new("yearsatcompany", SmallInt),
            SchemaColumn::new("yearsincurrentrole", SmallInt),
            SchemaColumn::new("yearssincelastpromotion", SmallInt),
            SchemaColumn::new("yearswithcurrmanager", SmallInt),
        ];

        Self::new("IBM_HR_Employee_Attrition", columns)
    }
}
