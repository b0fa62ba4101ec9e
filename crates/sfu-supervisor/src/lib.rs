//! SFU Process Supervisor
//!
//! Parent process for the SFU media workers. It launches the configured
//! worker binaries, restarts any worker that exits with the restart code
//! after an unrecoverable fault, and drains all workers with SIGTERM on
//! shutdown.
//!
//! # Architecture
//!
//! ```text
//! sfu-supervisor
//! ├── ProcessSupervisor     Launches workers, restarts on failure exits
//! │   └── monitor tasks     One per worker, reports exit status
//! └── Health endpoints      /health and /ready probes
//!     └── standby mode      When another instance owns the port
//! ```
//!
//! Workers signal "restart me" by exiting with code 1, for example when
//! the broker connection is lost beyond the reconnect policy. Exits with
//! any other code are logged and left alone.
//!
//! # Modules
//!
//! - [`config`] - Environment-based configuration
//! - [`errors`] - Supervisor error types
//! - [`health`] - Liveness/readiness endpoints with standby handling
//! - [`supervisor`] - Worker launch, restart, and drain loop

pub mod config;
pub mod errors;
pub mod health;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use errors::SupervisorError;
pub use health::HealthState;
pub use supervisor::{RunState, SupervisorHandle, SupervisorStatus, RESTART_EXIT_CODE};
