pub mod commands;
pub mod config;
pub mod create;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod model;
pub mod stats;
pub mod store;
pub mod stream;
pub mod terminal;
pub mod transport;
pub mod usage;

#[cfg(test)]
mod testing;
