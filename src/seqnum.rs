use crate::error::HandlerError;
use crate::fsutil::write_atomic;
use std::fs;
use std::io;
use std::path::Path;

/// Environment variable the host uses to hand over the sequence number.
pub const SEQ_NUM_ENV: &str = "ConfigSequenceNumber";

const SETTINGS_EXT: &str = "settings";

/// Reads the stored sequence number. A missing file means nothing was ever stored.
pub fn read(path: &Path) -> Result<Option<u64>, HandlerError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(HandlerError::seqnum(
                format!("failed to read sequence number file {}", path.display()),
                err,
            ))
        }
    };
    let trimmed = content.trim();
    trimmed.parse::<u64>().map(Some).map_err(|err| {
        HandlerError::seqnum(
            format!(
                "sequence number file {} holds {:?}, not an integer",
                path.display(),
                trimmed
            ),
            io::Error::new(io::ErrorKind::InvalidData, err),
        )
    })
}

/// Reports whether `candidate` is strictly greater than the stored value.
pub fn is_newer(path: &Path, candidate: u64) -> Result<bool, HandlerError> {
    Ok(match read(path)? {
        Some(stored) => candidate > stored,
        None => true,
    })
}

/// Replaces the stored value through a temp file and rename so readers never see a torn write.
pub fn persist(path: &Path, value: u64) -> Result<(), HandlerError> {
    let wrap = |err: io::Error| {
        HandlerError::seqnum(
            format!("failed to save sequence number to {}", path.display()),
            err,
        )
    };
    write_atomic(path, &value.to_string()).map_err(wrap)
}

/// Finds the sequence number for this invocation: the host's environment
/// variable first, then the highest `N.settings` in the config folder.
pub fn find(env_value: Option<&str>, config_folder: &Path) -> Result<Option<u64>, HandlerError> {
    if let Some(raw) = env_value {
        let raw = raw.trim();
        if !raw.is_empty() {
            return raw.parse::<u64>().map(Some).map_err(|_| {
                HandlerError::Config(format!("{SEQ_NUM_ENV} is not a valid sequence number: {raw:?}"))
            });
        }
    }
    let entries = match fs::read_dir(config_folder) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(HandlerError::Io(err)),
    };
    let mut highest = None;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SETTINGS_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(n) = stem.parse::<u64>() {
            highest = highest.max(Some(n));
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_always_older() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seqnum");
        assert!(is_newer(&path, 0).unwrap());
        assert!(is_newer(&path, 42).unwrap());
    }

    #[test]
    fn compares_strictly_against_stored_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seqnum");
        persist(&path, 3).unwrap();
        assert!(!is_newer(&path, 2).unwrap());
        assert!(!is_newer(&path, 3).unwrap());
        assert!(is_newer(&path, 4).unwrap());
    }

    #[test]
    fn persist_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("seqnum");
        persist(&path, 3).unwrap();
        persist(&path, 5).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "5");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("seqnum")]);
    }

    #[test]
    fn corrupt_file_is_a_hard_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seqnum");
        fs::write(&path, "not-a-number").unwrap();
        let err = is_newer(&path, 1).unwrap_err();
        assert!(matches!(err, HandlerError::SeqNum { .. }));
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn tolerates_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seqnum");
        fs::write(&path, "7\n").unwrap();
        assert_eq!(read(&path).unwrap(), Some(7));
    }

    #[test]
    fn find_prefers_env_value() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("9.settings"), "{}").unwrap();
        assert_eq!(find(Some("4"), dir.path()).unwrap(), Some(4));
        assert!(find(Some("four"), dir.path()).is_err());
    }

    #[test]
    fn find_picks_highest_settings_file() {
        let dir = tempdir().unwrap();
        for name in ["2.settings", "10.settings", "3.settings", "11.status", "x.settings"] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        assert_eq!(find(None, dir.path()).unwrap(), Some(10));
        assert_eq!(find(Some(""), dir.path()).unwrap(), Some(10));
    }

    #[test]
    fn find_without_settings_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(find(None, dir.path()).unwrap(), None);
        assert_eq!(find(None, &dir.path().join("missing")).unwrap(), None);
    }
}
