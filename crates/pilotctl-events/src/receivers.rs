use std::path::{Path, PathBuf};

use pilotctl_types::{EventReceiver, EventReceivers};

pub const RECEIVERS_FILE: &str = "ev_receive.json";

#[derive(Debug, thiserror::Error)]
pub enum ReceiverConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Places searched for the receiver file, in order: executable directory,
/// home directory, `/conf`, working directory.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        paths.push(dir.join(RECEIVERS_FILE));
    }
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(RECEIVERS_FILE));
    }
    paths.push(PathBuf::from("/conf").join(RECEIVERS_FILE));
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(RECEIVERS_FILE));
    }
    paths
}

/// First candidate that exists.
pub fn locate_receivers_file() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|p| p.exists())
}

pub fn load_receivers(path: &Path) -> Result<Vec<EventReceiver>, ReceiverConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ReceiverConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let conf: EventReceivers =
        serde_json::from_slice(&bytes).map_err(|source| ReceiverConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(conf.event_receivers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_receiver_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RECEIVERS_FILE);
        std::fs::write(
            &path,
            r#"{"event_receivers":[
                {"name":"siem","uri":"https://siem.local/ingest","user":"u","pwd":"p"},
                {"uri":"http://archive.local/events"}
            ]}"#,
        )
        .unwrap();

        let receivers = load_receivers(&path).unwrap();
        assert_eq!(receivers.len(), 2);
        assert_eq!(receivers[0].name.as_deref(), Some("siem"));
        assert_eq!(receivers[0].credentials(), Some(("u", "p")));
        assert!(receivers[1].credentials().is_none());
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RECEIVERS_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_receivers(&path),
            Err(ReceiverConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_receivers(&dir.path().join(RECEIVERS_FILE)),
            Err(ReceiverConfigError::Read { .. })
        ));
    }

    #[test]
    fn candidates_end_with_conf_and_cwd() {
        let paths = candidate_paths();
        assert!(paths.contains(&PathBuf::from("/conf/ev_receive.json")));
        assert!(paths.iter().all(|p| p.ends_with(RECEIVERS_FILE)));
    }
}
