pub mod buffer_pool;
pub mod chirp;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod message;
mod notify;
pub mod protocol;
pub mod reader;
pub mod remote;
pub mod serializer;
pub mod tls;
pub mod transport;
pub mod writer;

pub use chirp::{Chirp, ChirpHandle};
pub use config::Config;
pub use error::{ChirpError, Result};
pub use hooks::{DefaultHooks, Hooks};
pub use message::{Message, MsgFlags, SendResult};
