use std::path::PathBuf;

/// XDG app name used for config and state directories.
pub const APP_NAME: &str = "agent-relay";
/// File name of the relay configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "relay.toml";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Config directory (`~/.config/agent-relay` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default config file location.
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// State directory for session histories and logs.
///
/// `state_dir()` is Linux-only; falls back to `data_local_dir()` elsewhere.
pub fn state_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| {
        dirs.state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf()
    })
}
