pub mod guest;
pub mod pool;
pub mod runner;

pub use pool::{BuilderPool, FaultMarker, WorkerCommand};
