//! Node lifecycle and update supervisor.
//!
//! The supervisor owns the run-state machine for a single worker process:
//! it starts and stops the node, keeps its binary updated from a release
//! index, buffers captured output, and publishes status/progress events to
//! subscribers. Presentation layers drive it through [`NodeManager`].

mod config;
mod error;
mod logs;
mod manager;
mod release;
mod runner;
mod supervisor;

pub use config::NODECTL_HOME_ENV;
pub use config::Settings;
pub use config::default_data_path;
pub use config::find_nodectl_home;
pub use config::load_settings;
pub use config::save_settings;
pub use error::Result;
pub use error::SupervisorError;
pub use error::TransferError;
pub use logs::LOG_CAPACITY;
pub use logs::LogBuffer;
pub use logs::LogHandle;
pub use manager::NodeManager;
pub use release::RELEASE_INDEX_URL;
pub use release::ReleaseClient;
pub use release::worker_binary_name;
pub use release::worker_binary_path;
pub use runner::ProcessRunner;
pub use runner::TERMINATE_GRACE;
pub use supervisor::RECONCILE_INTERVAL;
pub use supervisor::Supervisor;
