pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod logging;
pub mod storage;
pub mod transfer;
pub mod utils;

pub use error::{Error, Result};
