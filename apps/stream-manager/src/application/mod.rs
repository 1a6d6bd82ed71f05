//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the backends serving the manager contract and the
//! port interfaces they use to reach the network.

/// Port interfaces: transport sockets and the manager contract.
pub mod ports;

/// Connection lifecycle, registry, backends and the compatibility router.
pub mod services;
