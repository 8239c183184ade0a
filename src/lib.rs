//! LandSync Server Library
//!
//! A real-time state synchronization server for land instances. Each room
//! runs as a single task that owns its membership, state store and encoding
//! pipeline; transports push inbound frames in and receive encoded frames
//! back without sharing any room state.

pub mod config;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod store;
pub mod transport;
pub mod wire;
