//! Timer backend implementations

pub mod mock;
pub mod std_backend;
#[cfg(feature = "async")]
pub mod tokio_backend;

pub use mock::{MockClock, MockTimerBackend};
pub use std_backend::StdTimerBackend;
#[cfg(feature = "async")]
pub use tokio_backend::TokioTimerBackend;
