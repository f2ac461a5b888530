//! hypeman instance client library
//!
//! Copy files between the local machine and hypeman instances, run commands
//! inside them and follow build event streams.

pub mod api;
pub mod build_events;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod fs_enum;
pub mod logger;
pub mod path_spec;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod resolve;
pub mod sink;
pub mod tar_stream;
pub mod terminal;
pub mod transfer;
pub mod transport;
