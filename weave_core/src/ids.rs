//! Identifiers used throughout a federation.
//!
//! Every broker, core and federate carries a [`GlobalId`] assigned by the root
//! broker at registration. Routes are node-local: a [`RouteId`] names an
//! outbound channel of one particular node and means nothing elsewhere.

use serde::{Deserialize, Serialize};

/// Federate global ids start at this offset; everything below is a broker or
/// core. The root hands out ids monotonically within each block.
pub const FEDERATE_ID_SHIFT: i32 = 0x0002_0000;

/// A federation-unique identifier for a broker, core, or federate.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct GlobalId(pub i32);

impl GlobalId {
    /// Placeholder before the parent has assigned an id.
    pub const UNKNOWN: GlobalId = GlobalId(-2_010_000_000);
    /// Address of whatever node is directly upstream.
    pub const PARENT: GlobalId = GlobalId(0);
    /// The root broker.
    pub const ROOT: GlobalId = GlobalId(1);
    /// The core a federate is hosted in, without knowing its global id yet.
    pub const LOCAL_CORE: GlobalId = GlobalId(-4);

    /// Whether this is an assigned participant id. The reserved values
    /// (`UNKNOWN`, `PARENT`, `LOCAL_CORE`) are not.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// Ids in the federate block belong to federates; the rest are brokers and cores.
    pub fn is_federate(self) -> bool {
        self.0 >= FEDERATE_ID_SHIFT
    }

    pub fn is_broker(self) -> bool {
        self.0 > 0 && self.0 < FEDERATE_ID_SHIFT
    }
}

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_federate() {
            write!(f, "fed{}", self.0 - FEDERATE_ID_SHIFT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<i32> for GlobalId {
    fn from(id: i32) -> Self {
        GlobalId(id)
    }
}

/// A node-local identifier for an outbound transport channel.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct RouteId(pub i32);

impl RouteId {
    /// Always routes toward this node's parent.
    pub const PARENT: RouteId = RouteId(0);
    /// Self-loop back into this node's own inbound queue.
    pub const CONTROL: RouteId = RouteId(-1);
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RouteId::PARENT => write!(f, "route:parent"),
            RouteId::CONTROL => write!(f, "route:control"),
            RouteId(id) => write!(f, "route:{id}"),
        }
    }
}

/// Core-local index of a hosted federate.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct FederateId(pub u16);

impl FederateId {
    /// The global id the root will recognize this federate by, given the
    /// position in the federate block handed to the owning core.
    pub fn to_global(self, base: GlobalId) -> GlobalId {
        GlobalId(base.0 + self.0 as i32)
    }
}

/// Federate-local index of an interface handle.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct HandleId(pub i32);

impl HandleId {
    pub const INVALID: HandleId = HandleId(-1_700_000_000);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_blocks() {
        assert!(GlobalId::ROOT.is_broker());
        assert!(!GlobalId::ROOT.is_federate());
        let fed = GlobalId(FEDERATE_ID_SHIFT + 3);
        assert!(fed.is_federate());
        assert_eq!(fed.to_string(), "fed3");
        assert!(!GlobalId::UNKNOWN.is_valid());
    }
}
