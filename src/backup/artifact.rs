//! Backup artifacts and their records
//!
//! An artifact is one JSON document `{format, metadata, schema, data}` in the
//! backup directory. Its checksum is the SHA-256 of the file bytes and is
//! kept in the [`BackupMetadata`] record, never inside the artifact itself.

use crate::driver::Row;
use crate::error::AppError;
use crate::schema::SchemaDefinition;
use crate::store::{Collection, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const ARTIFACT_FORMAT: &str = "envclone-backup/1";

/// What a backup or checkpoint can restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackScope {
    Table,
    Schema,
    Function,
    Trigger,
    Data,
    #[default]
    Full,
}

/// Durable record of one backup artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub environment_name: String,
    pub created_at: DateTime<Utc>,
    /// Artifact size in bytes
    pub size: u64,
    pub checksum: String,
    pub is_valid: bool,
    pub file_path: String,
    pub scope: RollbackScope,
    /// Keys of the tables whose rows the artifact carries
    pub tables: Vec<String>,
    pub record_count: u64,
    pub schema_checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Record for BackupMetadata {
    const COLLECTION: Collection = Collection::Backups;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Restore point bound to a backup and a scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCheckpoint {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub environment_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub scope: RollbackScope,
    /// Object keys the checkpoint covers; empty covers the whole scope
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
}

impl Record for RollbackCheckpoint {
    const COLLECTION: Collection = Collection::Checkpoints;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Descriptive header stored inside the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub backup_id: Uuid,
    pub environment_id: Uuid,
    pub environment_name: String,
    pub created_at: DateTime<Utc>,
    pub scope: RollbackScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub format: String,
    pub metadata: ArtifactManifest,
    pub schema: SchemaDefinition,
    /// Rows per table key
    pub data: BTreeMap<String, Vec<Row>>,
}

impl BackupArtifact {
    pub fn new(manifest: ArtifactManifest, schema: SchemaDefinition, data: BTreeMap<String, Vec<Row>>) -> Self {
        Self {
            format: ARTIFACT_FORMAT.to_string(),
            metadata: manifest,
            schema,
            data,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.data.values().map(|rows| rows.len() as u64).sum()
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn artifact_path(dir: &Path, backup_id: Uuid) -> PathBuf {
    dir.join(format!("{}.json", backup_id))
}

/// Write atomically, returning the path, the size and the checksum
pub async fn write_artifact(dir: &Path, artifact: &BackupArtifact) -> Result<(PathBuf, u64, String), AppError> {
    tokio::fs::create_dir_all(dir).await?;
    let bytes = serde_json::to_vec(artifact)?;
    let path = artifact_path(dir, artifact.metadata.backup_id);
    let tmp = path.with_extension("json.tmp");

    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok((path, bytes.len() as u64, checksum(&bytes)))
}

/// Outcome of re-reading an artifact
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupValidation {
    pub backup_id: Uuid,
    pub is_valid: bool,
    pub checksum_matches: bool,
    pub problems: Vec<String>,
}

/// Recompute the checksum and check the structural markers
pub fn inspect(bytes: &[u8], metadata: &BackupMetadata) -> (BackupValidation, Option<BackupArtifact>) {
    let mut problems = Vec::new();

    let checksum_matches = checksum(bytes) == metadata.checksum;
    if !checksum_matches {
        problems.push("checksum mismatch".to_string());
    }
    if bytes.len() as u64 != metadata.size {
        problems.push(format!("size {} differs from recorded {}", bytes.len(), metadata.size));
    }

    let artifact = match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(document) => {
            if document.get("format").and_then(|f| f.as_str()) != Some(ARTIFACT_FORMAT) {
                problems.push("missing or unknown format marker".to_string());
            }
            for section in ["metadata", "schema", "data"] {
                if !document.get(section).is_some_and(|s| s.is_object()) {
                    problems.push(format!("missing {} section", section));
                }
            }
            match serde_json::from_value::<BackupArtifact>(document) {
                Ok(artifact) => {
                    if artifact.metadata.backup_id != metadata.id {
                        problems.push("artifact belongs to a different backup".to_string());
                    }
                    if artifact.schema.checksum() != metadata.schema_checksum {
                        problems.push("schema section does not match recorded checksum".to_string());
                    }
                    Some(artifact)
                }
                Err(e) => {
                    problems.push(format!("unreadable artifact: {}", e));
                    None
                }
            }
        }
        Err(e) => {
            problems.push(format!("not a JSON document: {}", e));
            None
        }
    };

    let validation = BackupValidation {
        backup_id: metadata.id,
        is_valid: problems.is_empty(),
        checksum_matches,
        problems,
    };
    let artifact = if validation.is_valid { artifact } else { None };
    (validation, artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn artifact() -> BackupArtifact {
        let mut data = BTreeMap::new();
        let mut row = Row::new();
        row.insert("id".to_string(), serde_json::json!(1));
        data.insert("public.customers".to_string(), vec![row]);
        BackupArtifact::new(
            ArtifactManifest {
                backup_id: Uuid::new_v4(),
                environment_id: Uuid::new_v4(),
                environment_name: "qa".to_string(),
                created_at: Utc::now(),
                scope: RollbackScope::Full,
                description: None,
            },
            fixtures::shop_schema(),
            data,
        )
    }

    fn metadata_for(artifact: &BackupArtifact, path: &Path, size: u64, sum: String) -> BackupMetadata {
        BackupMetadata {
            id: artifact.metadata.backup_id,
            environment_id: artifact.metadata.environment_id,
            environment_name: artifact.metadata.environment_name.clone(),
            created_at: artifact.metadata.created_at,
            size,
            checksum: sum,
            is_valid: true,
            file_path: path.display().to_string(),
            scope: RollbackScope::Full,
            tables: artifact.data.keys().cloned().collect(),
            record_count: artifact.record_count(),
            schema_checksum: artifact.schema.checksum(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_written_artifact_validates() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact();
        let (path, size, sum) = write_artifact(dir.path(), &artifact).await.unwrap();
        let metadata = metadata_for(&artifact, &path, size, sum);

        let bytes = tokio::fs::read(&path).await.unwrap();
        let (validation, parsed) = inspect(&bytes, &metadata);
        assert!(validation.is_valid, "{:?}", validation.problems);
        assert_eq!(parsed.unwrap().record_count(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_tampered_artifact_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact();
        let (path, size, sum) = write_artifact(dir.path(), &artifact).await.unwrap();
        let metadata = metadata_for(&artifact, &path, size, sum);

        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 2;
        bytes[last] = b' ';
        let (validation, parsed) = inspect(&bytes, &metadata);
        assert!(!validation.is_valid);
        assert!(!validation.checksum_matches);
        assert!(parsed.is_none());
    }

    #[test]
    fn test_missing_sections_are_reported() {
        let bytes = br#"{"format":"envclone-backup/1","metadata":{}}"#;
        let metadata = BackupMetadata {
            id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            environment_name: "qa".to_string(),
            created_at: Utc::now(),
            size: bytes.len() as u64,
            checksum: checksum(bytes),
            is_valid: true,
            file_path: String::new(),
            scope: RollbackScope::Full,
            tables: vec![],
            record_count: 0,
            schema_checksum: String::new(),
            description: None,
        };
        let (validation, _) = inspect(bytes, &metadata);
        assert!(validation.checksum_matches);
        assert!(validation.problems.iter().any(|p| p == "missing schema section"));
        assert!(validation.problems.iter().any(|p| p == "missing data section"));
    }
}
