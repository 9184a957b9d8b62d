pub mod error;
pub mod gateway;
pub mod session;

pub use error::VSphereError;
pub use gateway::{CreationTimestamp, Gateway, ManagedVM, PowerState};
pub use session::Session;
