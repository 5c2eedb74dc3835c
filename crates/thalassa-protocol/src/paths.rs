use std::path::PathBuf;

/// Returns the default control socket path for the thalassa daemon.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("thalassa.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/thalassa-{uid}.sock"))
    }
}

/// Returns the config directory path for thalassa.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("thalassa")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("thalassa")
    } else {
        PathBuf::from("/tmp/thalassa")
    }
}

/// Returns the data directory holding history and agent transcripts.
pub fn data_dir() -> PathBuf {
    if let Ok(data_dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("thalassa")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("thalassa")
    } else {
        PathBuf::from("/tmp/thalassa")
    }
}

/// Returns the default PID file path for the daemon.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("thalassa.pid")
}

/// Returns the config file path for the daemon.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Returns the default chat history database path.
pub fn history_db_path() -> PathBuf {
    data_dir().join("history.db")
}

/// Returns the default agent transcript directory.
pub fn transcript_dir() -> PathBuf {
    data_dir().join("transcripts")
}
