pub mod error;
pub mod events;
pub mod handlers;
pub mod message;
pub mod models;
pub mod snowflake;
pub mod topics;

pub use error::{KircError, Result};
pub use message::{Envelope, MessageType, Payload};
