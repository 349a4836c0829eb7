pub mod bus;
pub mod log;
pub mod models;

pub use bus::EventBus;
pub use log::EventLog;
pub use models::{EventEnvelope, SessionEvent, UserEvent};
