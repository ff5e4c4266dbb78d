//! Dolly JSON Lines loading

use super::format_dolly;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hub id of the Dolly instruction dataset
pub const DOLLY_DATASET_ID: &str = "databricks/databricks-dolly-15k";

/// File holding the `train` split of the Dolly dataset
pub const DOLLY_FILE: &str = "databricks-dolly-15k.jsonl";

/// One row of the Dolly dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DollyRecord {
    /// Task description
    pub instruction: String,
    /// Optional reference text, empty when absent
    #[serde(default)]
    pub context: String,
    /// Target answer
    pub response: String,
    /// Task family, dropped by formatting
    #[serde(default)]
    pub category: String,
}

/// A formatted training text, the only column left after formatting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSample {
    pub text: String,
}

/// Load Dolly records from a JSONL file
///
/// Blank lines are skipped. Parse errors report the 1-based line number.
pub fn load_records(path: &Path) -> Result<Vec<DollyRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Dataset(format!("Cannot read dataset {}: {e}", path.display()))
    })?;

    let mut records = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: DollyRecord = serde_json::from_str(line).map_err(|e| {
            Error::Dataset(format!("Invalid JSONL at line {}: {e}", line_num + 1))
        })?;
        records.push(record);
    }

    tracing::debug!(records = records.len(), path = %path.display(), "loaded dataset");
    Ok(records)
}

/// Apply the prompt template to every record, keeping only the text
pub fn format_dataset(records: &[DollyRecord]) -> Vec<TextSample> {
    records.iter().map(format_dolly).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_records() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"{{"instruction": "Who wrote Hamlet?", "context": "", "response": "Shakespeare.", "category": "open_qa"}}"#
        )
        .unwrap();
        writeln!(f).unwrap();
        writeln!(
            f,
            r#"{{"instruction": "Summarize", "context": "Long text", "response": "Short"}}"#
        )
        .unwrap();

        let records = load_records(f.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category, "open_qa");
        assert_eq!(records[1].context, "Long text");
        assert_eq!(records[1].category, "");
    }

    #[test]
    fn test_invalid_line_reports_number() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"instruction": "a", "response": "b"}}"#).unwrap();
        writeln!(f, "not json").unwrap();

        let err = load_records(f.path()).unwrap_err();
        assert!(matches!(err, Error::Dataset(ref m) if m.contains("line 2")));
    }

    #[test]
    fn test_missing_file() {
        let result = load_records(Path::new("/nonexistent/dolly.jsonl"));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_format_dataset_keeps_order() {
        let records = vec![
            DollyRecord {
                instruction: "one".into(),
                context: String::new(),
                response: "1".into(),
                category: String::new(),
            },
            DollyRecord {
                instruction: "two".into(),
                context: "ctx".into(),
                response: "2".into(),
                category: String::new(),
            },
        ];

        let samples = format_dataset(&records);
        assert_eq!(samples.len(), 2);
        assert!(samples[0].text.contains("one"));
        assert!(samples[1].text.contains("### Context\nctx"));
    }
}
