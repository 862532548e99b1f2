//! Builds tool sources into binaries, runs them as supervised local processes and
//! forwards calls to them over loopback HTTP.

pub mod compiler;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod integrity;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod runtime;
pub mod security;
pub mod store;
pub mod supervisor;
#[cfg(test)]
mod testing;
pub mod types;
