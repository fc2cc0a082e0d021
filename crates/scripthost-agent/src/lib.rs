pub mod access;
pub mod config;
pub mod env_file;
pub mod error;
pub mod http;
pub(crate) mod json_store;
pub mod notify;
pub mod ownership;
pub mod process_manager;
pub mod process_manager_support;
pub mod registry;
pub mod run_command;
pub mod service;
pub mod watchdog;

pub use config::HostConfig;
pub use error::HostError;
pub use process_manager::{Lifecycle, ProcessManager, StartOutcome};
pub use service::HostService;
