//! Boardtestor: build firmware, flash it onto boards and run shell tests over
//! the serial console.

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod harness;
pub mod matcher;
pub mod provisioner;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod utils;
