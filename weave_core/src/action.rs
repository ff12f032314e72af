//! The action message: the single command envelope exchanged between
//! federates, cores and brokers.
//!
//! Every operation in the federation, from registration through time grants to
//! value publication, travels as an [`ActionMessage`] tagged with an
//! [`Action`]. The tag also fixes which inbound channel the message is
//! processed on: priority actions (registration, acks, queries, control) are
//! drained before any ordered traffic.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{GlobalId, HandleId, Time};

macro_rules! actions {
    ($($(#[$meta:meta])* $name:ident = $tag:literal,)*) => {
        /// Tag for an [`ActionMessage`]. Unknown wire tags decode to
        /// [`Action::Ignore`] for forward compatibility.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u16)]
        pub enum Action {
            $($(#[$meta])* $name = $tag,)*
        }

        impl Action {
            pub fn from_tag(tag: u16) -> Self {
                match tag {
                    $($tag => Action::$name,)*
                    _ => Action::Ignore,
                }
            }
        }
    };
}

actions! {
    // protocol
    #[default]
    Ignore = 0,
    /// Transport-level negotiation; the concrete operation is in `message_id`.
    Protocol = 1,
    Tick = 2,
    Ping = 3,
    Pong = 4,

    // registration
    RegBroker = 10,
    RegCore = 11,
    RegFed = 12,
    RegPub = 13,
    RegInput = 14,
    RegEndpoint = 15,
    RegFilter = 16,
    Ack = 17,
    NewBrokerInformation = 18,
    AddAlias = 19,

    // connection resolution
    AddSubscriber = 30,
    AddPublisher = 31,
    AddEndpoint = 32,
    AddFilter = 33,
    AddDependency = 34,
    AddDependent = 35,
    RemoveDependency = 36,
    RemoveDependent = 37,

    // value and message transfer
    PubData = 50,
    SendMessage = 51,
    FilteredMessage = 52,
    NullMessage = 53,

    // time coordination
    TimeRequest = 60,
    TimeGrant = 61,
    ExecRequest = 62,
    ExecGrant = 63,
    TimeBlock = 64,
    RequestCurrentTime = 65,

    // initialization
    Init = 80,
    InitGrant = 81,
    InitNotReady = 82,

    // query and command
    Query = 90,
    QueryOrdered = 91,
    QueryReply = 92,
    QueryReplyOrdered = 93,
    SendCommand = 94,
    SendCommandOrdered = 95,

    // control
    NewRoute = 100,
    RemoveRoute = 101,
    Disconnect = 102,
    DisconnectFed = 103,
    DisconnectCore = 104,
    DisconnectBroker = 105,
    DisconnectFedAck = 106,
    DisconnectAck = 107,
    Error = 108,
    LocalError = 109,
    GlobalError = 110,
    SetTimeBarrier = 111,
    ClearTimeBarrier = 112,
    TimeBarrierRequest = 113,
    Terminate = 114,
    Log = 115,
    SetGlobal = 116,
    UserDisconnect = 117,
}

impl Action {
    /// Whether messages with this tag travel on the priority channel.
    ///
    /// Priority traffic is registration, acks, queries, commands, disconnect
    /// orchestration and barriers; everything time- or data-bearing stays on
    /// the ordered channel.
    pub fn is_priority(self) -> bool {
        use Action::*;
        matches!(
            self,
            Protocol
                | Ping
                | Pong
                | RegBroker
                | RegCore
                | RegFed
                | RegPub
                | RegInput
                | RegEndpoint
                | RegFilter
                | Ack
                | NewBrokerInformation
                | AddAlias
                | Query
                | QueryReply
                | SendCommand
                | NewRoute
                | RemoveRoute
                | Disconnect
                | DisconnectFed
                | DisconnectCore
                | DisconnectBroker
                | DisconnectFedAck
                | DisconnectAck
                | Error
                | LocalError
                | GlobalError
                | Terminate
                | SetGlobal
                | UserDisconnect
        )
    }
}

/// Secondary `message_id` codes used with [`Action::Protocol`].
pub mod protocol {
    pub const CONNECTION_REQUEST: i32 = 5;
    pub const CONNECTION_ACK: i32 = 6;
    pub const REQUEST_PORTS: i32 = 7;
    pub const PORT_DEFINITIONS: i32 = 8;
    pub const DISCONNECT_ERROR: i32 = 10;
    pub const CLOSE_RECEIVER: i32 = 23;
}

macro_rules! flag_accessors {
    ($($(#[$meta:meta])* ($mask:ident, $get:ident, $set:ident),)*) => {
        $(
            $(#[$meta])*
            pub fn $get(self) -> bool {
                self.0 & Self::$mask != 0
            }

            pub fn $set(&mut self, value: bool) {
                if value {
                    self.0 |= Self::$mask;
                } else {
                    self.0 &= !Self::$mask;
                }
            }
        )*
    };
}

/// Sixteen boolean flags carried in every action message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MessageFlags(u16);

impl MessageFlags {
    pub const ITERATION_REQUESTED: u16 = 1 << 0;
    pub const REQUIRED: u16 = 1 << 1;
    pub const OPTIONAL: u16 = 1 << 2;
    pub const ERROR: u16 = 1 << 3;
    pub const INDICATOR: u16 = 1 << 4;
    pub const DESTINATION_TARGET: u16 = 1 << 5;
    pub const RECONNECTABLE: u16 = 1 << 6;
    pub const EMPTY: u16 = 1 << 7;
    pub const CORE: u16 = 1 << 8;
    pub const BROKER: u16 = 1 << 9;
    pub const OBSERVER: u16 = 1 << 10;
    pub const SOURCE_ONLY: u16 = 1 << 11;
    pub const FORWARDING: u16 = 1 << 12;

    pub const fn from_bits(bits: u16) -> Self {
        MessageFlags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    flag_accessors! {
        /// The sender is requesting an iteration at the current time.
        (ITERATION_REQUESTED, iteration_requested, set_iteration_requested),
        (REQUIRED, required, set_required),
        (OPTIONAL, optional, set_optional),
        (ERROR, error, set_error),
        /// General-purpose marker; meaning depends on the action.
        (INDICATOR, indicator, set_indicator),
        (DESTINATION_TARGET, destination_target, set_destination_target),
        (RECONNECTABLE, reconnectable, set_reconnectable),
        (EMPTY, empty, set_empty),
        (CORE, core, set_core),
        (BROKER, broker, set_broker),
        (OBSERVER, observer, set_observer),
        (SOURCE_ONLY, source_only, set_source_only),
        (FORWARDING, forwarding, set_forwarding),
    }
}

/// The universal command envelope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionMessage {
    pub action: Action,
    /// Action-specific secondary code (protocol op, error code, port number).
    pub message_id: i32,
    pub source_id: GlobalId,
    pub dest_id: GlobalId,
    pub source_handle: HandleId,
    pub dest_handle: HandleId,
    /// Federate-local counter used to match replies to requests.
    pub sequence_id: i32,
    pub action_time: Time,
    /// Next-event time, for time-coordination actions.
    pub te: Time,
    /// Minimum delta to the next event, for time-coordination actions.
    pub tdemin: Time,
    /// Iteration counter, retry count, or barrier sequence.
    pub counter: i16,
    pub flags: MessageFlags,
    pub payload: Bytes,
    /// Names, targets, and info fields, in action-defined order.
    pub strings: Vec<String>,
}

impl ActionMessage {
    pub fn new(action: Action) -> Self {
        ActionMessage {
            action,
            ..Default::default()
        }
    }

    pub fn routed(action: Action, source: GlobalId, dest: GlobalId) -> Self {
        ActionMessage {
            action,
            source_id: source,
            dest_id: dest,
            ..Default::default()
        }
    }

    pub fn is_priority(&self) -> bool {
        self.action.is_priority()
    }

    /// The first string field, conventionally a name.
    pub fn name(&self) -> Option<&str> {
        self.strings.first().map(String::as_str)
    }

    pub fn with_string(mut self, s: impl Into<String>) -> Self {
        self.strings.push(s.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl std::fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{} -> {}] t={}",
            self.action, self.source_id, self.dest_id, self.action_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_become_ignore() {
        assert_eq!(Action::from_tag(0xfffe), Action::Ignore);
        assert_eq!(Action::from_tag(61), Action::TimeGrant);
    }

    #[test]
    fn channel_classification() {
        assert!(Action::RegCore.is_priority());
        assert!(Action::Disconnect.is_priority());
        assert!(!Action::TimeRequest.is_priority());
        assert!(!Action::PubData.is_priority());
        // Ordered-mode queries deliberately ride the ordered channel.
        assert!(!Action::QueryOrdered.is_priority());
    }

    #[test]
    fn flags_roundtrip() {
        let mut flags = MessageFlags::default();
        flags.set_iteration_requested(true);
        flags.set_error(true);
        assert!(flags.iteration_requested());
        assert!(!flags.required());
        assert_eq!(MessageFlags::from_bits(flags.bits()), flags);
        flags.set_error(false);
        assert!(!flags.error());
    }
}
