use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Environment override for the nodectl home directory, mainly for tests
/// and side-by-side installs.
pub const NODECTL_HOME_ENV: &str = "NODECTL_HOME";

const SETTINGS_FILE: &str = "settings.toml";

/// Settings that survive supervisor restarts. Currently just the
/// last-selected data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
}

/// Resolves the nodectl home: `$NODECTL_HOME` when set and non-empty,
/// otherwise `~/.nodectl`.
pub fn find_nodectl_home() -> io::Result<PathBuf> {
    if let Ok(home) = std::env::var(NODECTL_HOME_ENV)
        && !home.trim().is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not resolve a home directory")
    })?;
    Ok(home.join(".nodectl"))
}

/// Data directory used when the user never picked one.
pub fn default_data_path(nodectl_home: &Path) -> PathBuf {
    nodectl_home.join("data")
}

/// Loads persisted settings; a missing file yields the defaults.
pub fn load_settings(nodectl_home: &Path) -> io::Result<Settings> {
    let path = nodectl_home.join(SETTINGS_FILE);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => return Err(err),
    };
    toml::from_str(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes settings to disk, creating the home directory if needed.
pub fn save_settings(nodectl_home: &Path, settings: &Settings) -> io::Result<()> {
    std::fs::create_dir_all(nodectl_home)?;
    let serialized = toml::to_string_pretty(settings)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    std::fs::write(nodectl_home.join(SETTINGS_FILE), serialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_settings_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let settings = load_settings(home.path()).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let home = TempDir::new().expect("tempdir");
        let settings = Settings {
            data_dir: Some(PathBuf::from("/var/lib/openhash")),
        };
        save_settings(home.path(), &settings).expect("save");
        let loaded = load_settings(home.path()).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn save_creates_the_home_directory() {
        let parent = TempDir::new().expect("tempdir");
        let home = parent.path().join("nested").join("home");
        save_settings(&home, &Settings::default()).expect("save");
        assert!(home.join(SETTINGS_FILE).exists());
    }

    #[test]
    fn corrupt_settings_surface_as_invalid_data() {
        let home = TempDir::new().expect("tempdir");
        std::fs::write(home.path().join(SETTINGS_FILE), "data_dir = [not toml")
            .expect("write");
        let err = load_settings(home.path()).expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
