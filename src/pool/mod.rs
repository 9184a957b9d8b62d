pub mod pending;
pub mod queue;
pub mod view;

pub use pending::PendingCounter;
pub use queue::{CloneQueue, CloneTask, WorkerResult, WorkerStatus};
pub use view::{Inventory, PoolView};
