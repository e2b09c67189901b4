pub mod classify;
pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod gate;
pub mod keys;
pub mod monitor;
pub mod provision;
pub mod remote;
pub mod remote_text;
pub mod restore;
pub mod state;
pub mod templates;
pub mod workspace;

pub use error::{Error, Result};
