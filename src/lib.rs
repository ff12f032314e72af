//! Weave is a distributed co-simulation runtime: independent simulators
//! ("federates") join a federation that advances virtual time in
//! coordination, exchanges typed values and messages, and routes everything
//! through pluggable transports.
//!
//! The federation is a tree: a unique root [`Broker`], optional intermediate
//! brokers, and leaf [`Core`]s hosting federates. See the member crates for
//! the layers: `weave_core` (ids, time, the action-message codec),
//! `weave_network` (TCP/UDP/in-process transports), `weave_broker` (routing
//! fabric, broker and core logic, time coordination) and `weave_federate`
//! (the federate API).
#![deny(clippy::all)]

pub use weave_broker as broker;
pub use weave_federate as federate;
pub use weave_network as network;

// The common surface, re-exported flat.
pub use weave_broker::{Broker, BrokerConfig, Core, CoreConfig, NodeConfig};
pub use weave_core::{
    Action, ActionMessage, CoreType, ErrorKind, FederateState, GlobalId, IterationRequest,
    IterationResult, Time, WeaveError,
};
pub use weave_federate::{Federate, FederateConfig, Value};
pub use weave_network::CommsRegistry;

#[cfg(feature = "runner")]
pub mod runner;
