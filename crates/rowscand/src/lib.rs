//! Capture daemon library: configuration, the worker process that owns the
//! cameras, and the parent-side manager that drives it.

pub mod config;
pub mod fleet;
pub mod ipc;
pub mod manager;
pub mod shutdown;
pub mod worker;

pub use config::Config;
pub use fleet::{CaptureReport, Fleet, FleetError};
pub use ipc::{CaptureRequest, WorkerEvent};
pub use manager::{CommandQueue, FleetManager, FleetState, WorkerExit};
pub use shutdown::{ParentWatch, ShutdownToken};
