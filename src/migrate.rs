use crate::error::HandlerError;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

fn path_exists(path: &Path) -> Result<bool, HandlerError> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(HandlerError::Migration(format!(
            "cannot stat {}: {err}",
            path.display()
        ))),
    }
}

/// Moves the legacy state tree to its canonical location.
///
/// No-op when the legacy tree is gone or the canonical tree already exists.
/// The move is a single `rename`, so a failure leaves all data on one side.
pub fn migrate_data_dir(old_path: &Path, new_path: &Path) -> Result<(), HandlerError> {
    if !path_exists(old_path)? {
        info!(event = "migration skipped", reason = "no legacy state", path = %old_path.display());
        return Ok(());
    }
    if path_exists(new_path)? {
        info!(
            event = "migration skipped",
            reason = "canonical state exists",
            path = %new_path.display()
        );
        return Ok(());
    }
    if let Some(parent) = new_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            HandlerError::Migration(format!("failed to create {}: {err}", parent.display()))
        })?;
    }
    info!(event = "migrating state", from = %old_path.display(), to = %new_path.display());
    fs::rename(old_path, new_path).map_err(|err| {
        HandlerError::Migration(format!(
            "failed to move {} to {}: {err}",
            old_path.display(),
            new_path.display()
        ))
    })?;
    info!(event = "migrated state", path = %new_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn moves_legacy_tree_when_canonical_missing() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("azure").join("custom-script");
        let new = dir.path().join("waagent").join("custom-script");
        fs::create_dir_all(old.join("download").join("1")).unwrap();
        fs::write(old.join("seqnum"), "1").unwrap();
        fs::write(old.join("download").join("1").join("run.sh"), "echo hi").unwrap();

        migrate_data_dir(&old, &new).unwrap();

        assert!(!old.exists());
        assert_eq!(fs::read_to_string(new.join("seqnum")).unwrap(), "1");
        assert!(new.join("download").join("1").join("run.sh").exists());
    }

    #[test]
    fn leaves_canonical_tree_untouched_when_both_exist() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&new).unwrap();
        fs::write(old.join("seqnum"), "1").unwrap();
        fs::write(new.join("seqnum"), "8").unwrap();

        migrate_data_dir(&old, &new).unwrap();

        assert_eq!(fs::read_to_string(new.join("seqnum")).unwrap(), "8");
        assert_eq!(fs::read_to_string(old.join("seqnum")).unwrap(), "1");
    }

    #[test]
    fn missing_legacy_tree_is_a_noop() {
        let dir = tempdir().unwrap();
        let new = dir.path().join("new");
        migrate_data_dir(&dir.path().join("old"), &new).unwrap();
        assert!(!new.exists());
    }
}
