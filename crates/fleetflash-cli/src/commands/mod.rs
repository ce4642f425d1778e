//! CLI command implementations

pub mod build;
pub mod config;
pub mod flash;
pub mod inspect;
pub mod list;
pub mod raw_write;
pub mod validate;
pub mod verify;
