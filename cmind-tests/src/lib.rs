//! Integration harness for the city-minder workspace.
//!
//! Provides [`MockGateway`], a scripted stand-in for the field gateway
//! process that serves the full request vocabulary over real TCP sockets
//! with simulated drifting sensor values. The `mock-gateway` bin runs it
//! standalone (point `cmindd` at it); `broker-loop-test` drives the broker
//! against it end to end.

pub mod gateway;

pub use gateway::MockGateway;
