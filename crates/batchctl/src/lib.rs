//! Job submission, monitoring and interactive node allocation on top of the
//! Slurm command-line tools.
//!
//! Every operation spawns short-lived external processes through a
//! [`backend::CommandRunner`]; the scheduler is always the source of truth and
//! nothing but the allocation registry is kept locally.
pub mod alloc;
pub mod backend;
pub mod client;
pub mod cluster;
pub mod common;
pub mod config;
pub mod jobs;
pub mod service;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::BatchError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;

pub const BATCHCTL_VERSION: &str = {
    match option_env!("BATCHCTL_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
