//! Core types and functions for the weave co-simulation runtime.
#![deny(clippy::all)]

mod action;
pub mod codec;
mod error;
mod ids;
mod state;
mod time;

// Re-exports
pub use action::{protocol, Action, ActionMessage, MessageFlags};
pub use codec::{ActionCodec, CodecError};
pub use error::{ErrorKind, WeaveError};
pub use ids::{FederateId, GlobalId, HandleId, RouteId, FEDERATE_ID_SHIFT};
pub use state::{
    ConnectionState, CoreType, FederateState, InterfaceFlags, InterfaceKind, IterationRequest,
    IterationResult,
};
pub use time::{Time, TICKS_PER_SECOND};
