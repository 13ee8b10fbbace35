//! Metadata records.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use xray_core::{Error, Result, NO_FINDING};

/// One metadata row. Extra CSV columns are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Image file name; join key against the image index
    #[serde(rename = "Image Index")]
    pub image_id: String,
    /// Patient identifier
    #[serde(rename = "Patient ID")]
    pub patient_id: String,
    /// Pipe-delimited findings, or `No Finding`
    #[serde(rename = "Finding Labels")]
    pub findings: String,
}

impl Record {
    pub fn new(
        image_id: impl Into<String>,
        patient_id: impl Into<String>,
        findings: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            patient_id: patient_id.into(),
            findings: findings.into(),
        }
    }

    /// Finding tokens as written in the metadata
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.findings.split('|')
    }

    /// Whether `disease` is one of the finding tokens
    pub fn has_finding(&self, disease: &str) -> bool {
        self.tokens().any(|t| t == disease)
    }

    /// Whether the only finding is the `No Finding` sentinel
    pub fn is_no_finding(&self) -> bool {
        self.tokens().all(|t| t == NO_FINDING)
    }
}

/// Load all rows of the metadata CSV.
///
/// A missing file is [`Error::ConfigurationMissing`].
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    if !path.is_file() {
        return Err(Error::ConfigurationMissing(format!(
            "metadata file {} not found",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: Record = row?;
        records.push(record);
    }

    info!("Loaded {} metadata rows from {}", records.len(), path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_records_ignores_extra_columns() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("Data_Entry_2017.csv");
        fs::write(
            &path,
            "Image Index,Finding Labels,Follow-up #,Patient ID,Patient Age\n\
             00000001_000.png,Cardiomegaly|Emphysema,0,1,58\n\
             00000002_000.png,No Finding,0,2,81\n",
        )?;

        let records = load_records(&path)?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Record::new("00000001_000.png", "1", "Cardiomegaly|Emphysema"));
        assert!(records[0].has_finding("Emphysema"));
        assert!(!records[0].has_finding("Pneumonia"));
        assert!(records[1].is_no_finding());
        Ok(())
    }

    #[test]
    fn test_missing_metadata_file() {
        let dir = TempDir::new().unwrap();
        let err = load_records(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)));
    }

    #[test]
    fn test_token_match_is_exact() {
        let record = Record::new("a.png", "1", "Pleural_Thickening|Mass");
        assert!(!record.has_finding("Thickening"));
        assert!(record.has_finding("Mass"));
    }
}
