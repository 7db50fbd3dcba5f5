//! Event Bus Adapter (§4.8).

mod bus;
mod error;
mod memory;
mod message;
mod pg;

pub use bus::EventBus;
pub use error::EventBusError;
pub use memory::InMemoryEventBus;
pub use message::Message;
pub use pg::PgEventBus;
