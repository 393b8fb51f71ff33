pub mod commands;
pub mod reporter;
pub mod sampler;
pub mod worker;

pub use commands::{DisplayedLog, SharedDisplayed};
pub use reporter::StatusReporter;
pub use worker::{AcquisitionWorker, WorkerSettings};
