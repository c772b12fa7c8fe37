pub mod bus;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod pipeline;
pub mod playbook;
pub mod request;
pub mod runner;
pub mod signals;
pub mod status;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{ProvisionError, ValidationError};
pub use pipeline::ServiceContext;
pub use status::{InstallStatus, StatusKind, StatusPublisher};
