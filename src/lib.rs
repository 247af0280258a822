pub mod command;
pub mod config;
pub mod dimmer;
pub mod error;
pub mod idle;
pub mod locator;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
