//! Lifecycle and iteration state enums.

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, WeaveError};

/// Lifecycle of a federate, including the pending variants observed while an
/// async transition is in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FederateState {
    #[default]
    Created,
    Initializing,
    Executing,
    Terminating,
    Errored,
    Finished,
    PendingInit,
    PendingExec,
    PendingTime,
    PendingIterativeTime,
    PendingFinalize,
}

impl FederateState {
    /// Whether an async operation is outstanding; re-entrant requests are
    /// refused while one is.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            FederateState::PendingInit
                | FederateState::PendingExec
                | FederateState::PendingTime
                | FederateState::PendingIterativeTime
                | FederateState::PendingFinalize
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FederateState::Errored | FederateState::Finished)
    }

    /// Guard an API call against being made in the wrong state.
    pub fn require(self, expected: FederateState, op: &str) -> Result<(), WeaveError> {
        if self == expected {
            Ok(())
        } else {
            Err(WeaveError::new(
                ErrorKind::InvalidFunctionCall,
                format!("{op} requires state {expected:?}, federate is {self:?}"),
            ))
        }
    }
}

impl std::fmt::Display for FederateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle of a broker or core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Created,
    Connected,
    Executing,
    Disconnecting,
    Disconnected,
    Errored,
}

impl ConnectionState {
    pub fn is_terminated(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Errored)
    }
}

/// What a federate asks for when entering execution or requesting time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterationRequest {
    #[default]
    NoIterations,
    ForceIteration,
    IterateIfNeeded,
}

/// What the coordinator answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterationResult {
    NextStep,
    Iterating,
    Halted,
    Error,
}

/// Which transport family a broker or core is built on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreType {
    #[default]
    Default,
    Tcp,
    /// TCP with a single shared socket for send and receive.
    TcpSs,
    Udp,
    InProc,
    /// Alias of [`CoreType::InProc`] for single-process test federations.
    Test,
    Zmq,
    Ipc,
}

impl CoreType {
    /// Whether this build can instantiate the type.
    pub fn is_available(self) -> bool {
        !matches!(self, CoreType::Zmq | CoreType::Ipc)
    }
}

impl std::str::FromStr for CoreType {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" | "def" => Ok(CoreType::Default),
            "tcp" => Ok(CoreType::Tcp),
            "tcpss" | "tcp_ss" => Ok(CoreType::TcpSs),
            "udp" => Ok(CoreType::Udp),
            "inproc" | "inprocess" => Ok(CoreType::InProc),
            "test" => Ok(CoreType::Test),
            "zmq" | "zeromq" => Ok(CoreType::Zmq),
            "ipc" | "interprocess" => Ok(CoreType::Ipc),
            other => Err(WeaveError::new(
                ErrorKind::InvalidArgument,
                format!("unrecognized core type '{other}'"),
            )),
        }
    }
}

impl std::fmt::Display for CoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoreType::Default => "default",
            CoreType::Tcp => "tcp",
            CoreType::TcpSs => "tcpss",
            CoreType::Udp => "udp",
            CoreType::InProc => "inproc",
            CoreType::Test => "test",
            CoreType::Zmq => "zmq",
            CoreType::Ipc => "ipc",
        };
        f.write_str(s)
    }
}

/// The kinds of interface a federate can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    Publication,
    Input,
    Endpoint,
    Filter,
    Translator,
    Sink,
}

/// Option bits attached to an interface at registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InterfaceFlags(pub u16);

impl InterfaceFlags {
    pub const REQUIRED: u16 = 1 << 0;
    pub const OPTIONAL: u16 = 1 << 1;
    pub const SINGLE_CONNECTION: u16 = 1 << 2;
    pub const MULTI_CONNECTION: u16 = 1 << 3;
    pub const BUFFER_DATA: u16 = 1 << 4;
    pub const ONLY_ON_CHANGE: u16 = 1 << 5;
    pub const STRICT_TYPE_CHECK: u16 = 1 << 6;
    pub const PRIORITY: u16 = 1 << 7;

    pub fn contains(self, mask: u16) -> bool {
        self.0 & mask != 0
    }

    pub fn set(&mut self, mask: u16, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_guard() {
        assert!(FederateState::Executing
            .require(FederateState::Executing, "publish")
            .is_ok());
        let err = FederateState::Created
            .require(FederateState::Executing, "publish")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFunctionCall);
    }

    #[test]
    fn core_type_parsing() {
        assert_eq!("TCP".parse::<CoreType>().unwrap(), CoreType::Tcp);
        assert_eq!("test".parse::<CoreType>().unwrap(), CoreType::Test);
        assert!("carrier-pigeon".parse::<CoreType>().is_err());
        assert!(!CoreType::Zmq.is_available());
    }
}
