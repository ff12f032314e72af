//! Broker, core and time-coordination logic for the weave co-simulation
//! runtime.
//!
//! The federation is a tree: a unique root [`Broker`], optional intermediate
//! brokers, and leaf [`Core`]s hosting federates. Everything communicates by
//! routing [`ActionMessage`](weave_core::ActionMessage) frames through the
//! transports in [`weave_network`].
#![deny(clippy::all)]

mod broker;
mod core;
mod fabric;
pub mod filters;
mod shared;
pub mod time_coord;

// Re-exports
pub use broker::{Broker, BrokerConfig};
pub use core::{Core, CoreConfig, FederateToken, FilterInstaller};
pub use fabric::NodeConfig;
pub use filters::{
    DelayDistribution, EndpointMessage, FilterOperator, FilterSpec, FilterStage, FirewallRule,
};
pub use shared::{FedData, FederateShared, GrantNotice, LocalHandle, ValueState};
pub use time_coord::{TimeCoordinator, TimeProps, TimeReport};
