pub mod config;
pub mod error;
pub mod names;
pub mod time;

pub use error::{Result, WgageError};
