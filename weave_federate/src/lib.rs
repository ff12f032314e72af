//! Federate state machine and value/message API for the weave co-simulation
//! runtime.
#![deny(clippy::all)]

mod config;
mod federate;
mod value;

// Re-exports
pub use config::{ConnectionConfig, FederateConfig, FilterConfig, InterfaceConfig};
pub use federate::{
    EndpointHandle, Federate, FederateFlag, FilterHandle, InputHandle, PublicationHandle,
    TimeProperty, DEFAULT_TIMEOUT,
};
pub use value::{AggregationMethod, Value};
