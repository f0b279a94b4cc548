pub mod board;
pub mod bus;
pub mod completion;
pub mod config;
pub mod contracts;
pub mod core;
pub mod error;
pub mod execution;
pub mod log;
pub mod monitor;
pub mod signals;
pub mod store;
pub mod util;
pub mod workspace;

pub use board::TaskBoard;
pub use bus::{DomainEvent, EventBus, EventKind};
pub use error::{Error, Result};
pub use execution::{PassOutcome, Pipeline};
pub use monitor::Monitor;
pub use store::{MemoryStore, Store};
