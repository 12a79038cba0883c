pub mod config;
pub mod convert;
pub mod download;
pub mod error;
pub mod filesystem;
pub mod flatten;
pub mod memo;
pub mod names;
pub mod remote;
pub mod runtime;
pub mod sidebar;
pub mod tree;
pub mod upload;

#[cfg(test)]
mod mock;
