use std::env;
use std::path::PathBuf;

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Directory holding `config.json` and the stored credential.
///
/// `$XDG_CONFIG_HOME/chatwire` when set, otherwise `~/.config/chatwire`.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("chatwire"));
        }
    }
    home_dir().map(|home| home.join(".config").join("chatwire"))
}
