//! Table identifiers and comma-delimited table lists.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter between table names on the command line and in backup sets.
pub const TABLE_DELIMITER: char = ',';

/// A table identifier, optionally namespace-qualified (`ns:table`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        if name.is_empty() {
            return Err(BackupError::Validation("empty table name".to_string()));
        }

        let mut parts = name.split(':');
        let (namespace, qualifier) = match (parts.next(), parts.next(), parts.next()) {
            (Some(q), None, _) => (None, q),
            (Some(ns), Some(q), None) => (Some(ns), q),
            _ => {
                return Err(BackupError::Validation(format!(
                    "illegal table name '{name}': at most one namespace separator"
                )))
            }
        };

        let legal = |part: &str| {
            !part.is_empty()
                && !part.starts_with('.')
                && !part.starts_with('-')
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        };
        if namespace.is_some_and(|ns| !legal(ns)) || !legal(qualifier) {
            return Err(BackupError::Validation(format!("illegal table name '{name}'")));
        }

        Ok(TableName(name.to_string()))
    }
}

impl TryFrom<String> for TableName {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a comma-delimited table list. Returns `None` for an absent or blank list.
pub fn parse_table_names(list: Option<&str>) -> Result<Option<Vec<TableName>>> {
    let Some(list) = list.map(str::trim).filter(|l| !l.is_empty()) else {
        return Ok(None);
    };
    list.split(TABLE_DELIMITER)
        .map(str::parse)
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Join table names back into their command-line form.
pub fn join_table_names(tables: &[TableName]) -> String {
    tables
        .iter()
        .map(TableName::as_str)
        .collect::<Vec<_>>()
        .join(&TABLE_DELIMITER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_list() {
        let tables = parse_table_names(Some("t1, ns:t2 ,t3")).unwrap().unwrap();
        let names: Vec<_> = tables.iter().map(TableName::as_str).collect();
        assert_eq!(names, vec!["t1", "ns:t2", "t3"]);
        assert_eq!(join_table_names(&tables), "t1,ns:t2,t3");
    }

    #[test]
    fn test_blank_list_is_none() {
        assert!(parse_table_names(None).unwrap().is_none());
        assert!(parse_table_names(Some("  ")).unwrap().is_none());
    }

    #[test]
    fn test_rejects_illegal_names() {
        assert!(parse_table_names(Some("t1,,t2")).is_err());
        assert!("a:b:c".parse::<TableName>().is_err());
        assert!("bad/name".parse::<TableName>().is_err());
        assert!(":t1".parse::<TableName>().is_err());
    }
}
