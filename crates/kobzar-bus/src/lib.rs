pub mod bus;
pub mod error;
pub mod queue;

pub use bus::StreamBus;
pub use error::BusError;
pub use queue::{PublishPolicy, Queue};
