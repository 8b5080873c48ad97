pub mod cli;
pub mod config;
pub mod error;
pub mod guest;
pub mod lock;
pub mod restore;
pub mod signal_handler;
pub mod sync;
pub mod types;
pub mod util;
pub mod zfs;

#[cfg(test)]
pub(crate) mod testing;
