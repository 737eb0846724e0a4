use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use nodectl_protocol::LogLine;
use nodectl_protocol::NodeConfig;
use nodectl_protocol::RunState;
use nodectl_protocol::SupervisorEvent;
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::config::default_data_path;
use crate::config::load_settings;
use crate::config::save_settings;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::release::RELEASE_INDEX_URL;
use crate::release::ReleaseClient;
use crate::release::worker_binary_path;
use crate::supervisor::Supervisor;

/// The command surface consumed by presentation layers: data-path
/// management, the executable probe, and pass-throughs to the supervisor.
/// One instance per nodectl home.
#[derive(Debug)]
pub struct NodeManager {
    home: PathBuf,
    settings: Mutex<Settings>,
    supervisor: Supervisor,
}

impl NodeManager {
    /// Reads persisted settings from `home` and builds a supervisor against
    /// the default release index. Must be called inside a tokio runtime.
    pub fn new(home: PathBuf) -> Result<Self> {
        Self::with_release_index(home, RELEASE_INDEX_URL)
    }

    pub fn with_release_index(home: PathBuf, index_url: impl Into<String>) -> Result<Self> {
        let settings =
            load_settings(&home).map_err(|error| SupervisorError::Settings { error })?;
        Ok(Self {
            home,
            settings: Mutex::new(settings),
            supervisor: Supervisor::new(ReleaseClient::new(index_url)),
        })
    }

    pub fn default_data_path(&self) -> PathBuf {
        default_data_path(&self.home)
    }

    /// The last-selected data directory, falling back to the default.
    pub fn current_data_path(&self) -> PathBuf {
        let chosen = match self.settings.lock() {
            Ok(settings) => settings.data_dir.clone(),
            Err(_) => None,
        };
        chosen.unwrap_or_else(|| self.default_data_path())
    }

    /// Persists a new data directory choice; survives restarts.
    pub fn set_custom_data_path(&self, path: PathBuf) -> Result<()> {
        let updated = Settings {
            data_dir: Some(path),
        };
        save_settings(&self.home, &updated)
            .map_err(|error| SupervisorError::Settings { error })?;
        if let Ok(mut settings) = self.settings.lock() {
            *settings = updated;
        }
        Ok(())
    }

    /// Whether the worker binary is installed for the given data directory.
    pub fn check_executable_exists(&self, db_path: &str) -> bool {
        worker_binary_path(db_path).exists()
    }

    /// Install location of the worker binary for a data directory.
    pub fn executable_path(&self, db_path: &str) -> PathBuf {
        worker_binary_path(db_path)
    }

    pub async fn start_node(&self, config: NodeConfig) -> Result<bool> {
        self.supervisor.start(config).await?;
        Ok(true)
    }

    pub async fn stop_node(&self) -> Result<bool> {
        self.supervisor.stop().await?;
        Ok(true)
    }

    /// Admits an update; progress and the terminal outcome arrive through
    /// [`NodeManager::subscribe`].
    pub async fn check_and_download_update(&self, db_path: &str) -> Result<()> {
        self.supervisor.check_for_update(db_path).await
    }

    /// True iff the node is `Running`.
    pub fn process_status(&self) -> bool {
        self.supervisor.query_status() == RunState::Running
    }

    pub fn run_state(&self) -> RunState {
        self.supervisor.query_status()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.supervisor.query_logs()
    }

    pub fn logs_since(&self, cursor: u64) -> (Vec<LogLine>, u64) {
        self.supervisor.logs_since(cursor)
    }

    pub fn logs_text(&self) -> String {
        self.supervisor.logs_text()
    }

    pub fn clear_logs(&self) {
        self.supervisor.clear_logs()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn data_path_falls_back_to_the_default() {
        let home = TempDir::new().expect("tempdir");
        let manager = NodeManager::new(home.path().to_path_buf()).expect("manager");
        assert_eq!(manager.current_data_path(), home.path().join("data"));
    }

    #[tokio::test]
    async fn custom_data_path_survives_a_restart() {
        let home = TempDir::new().expect("tempdir");
        let chosen = home.path().join("elsewhere");
        {
            let manager = NodeManager::new(home.path().to_path_buf()).expect("manager");
            manager
                .set_custom_data_path(chosen.clone())
                .expect("persist path");
            assert_eq!(manager.current_data_path(), chosen);
        }
        let reopened = NodeManager::new(home.path().to_path_buf()).expect("manager");
        assert_eq!(reopened.current_data_path(), chosen);
    }

    #[tokio::test]
    async fn executable_probe_reflects_the_install_location() {
        let home = TempDir::new().expect("tempdir");
        let manager = NodeManager::new(home.path().to_path_buf()).expect("manager");
        let data = home.path().join("data");
        let db_path = data.to_string_lossy().into_owned();
        assert!(!manager.check_executable_exists(&db_path));

        std::fs::create_dir_all(&data).expect("mkdir");
        std::fs::write(manager.executable_path(&db_path), b"binary").expect("write");
        assert!(manager.check_executable_exists(&db_path));
    }
}
