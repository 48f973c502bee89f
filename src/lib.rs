pub mod block;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod plan;
pub mod scheduler;
pub mod table;
pub mod tiered;

pub use connection::Connection;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use table::Table;
