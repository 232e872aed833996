//! A CNI plugin that attaches containers to a Linux bridge through veth
//! pairs and hands out IPv4 addresses from a durable bitmap pool.
//!
//! The binary reads `CNI_*` variables and a JSON network configuration,
//! runs one command through [`orchestrator::Orchestrator`] and prints a
//! CNI reply.

pub mod config;
pub mod env;
pub mod error;
pub mod netops;
pub mod orchestrator;
pub mod topology;
pub mod types;

#[cfg(test)]
mod testing;
