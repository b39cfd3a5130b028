//! Backups, restores and granular rollback

mod artifact;
mod manager;

pub use artifact::{
    checksum, ArtifactManifest, BackupArtifact, BackupMetadata, BackupValidation, RollbackCheckpoint, RollbackScope,
    ARTIFACT_FORMAT,
};
pub use manager::{
    BackupManager, BackupOptions, GranularRollbackResult, RestoreResult, RestoreVerification, RollbackOptions,
    RollbackTarget, TableCountCheck, TargetOutcome,
};
