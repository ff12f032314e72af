//! Transport layer: moves [`ActionMessage`] frames between nodes over named
//! routes.
//!
//! A transport instance is a driver task (per flavor: TCP, UDP, in-process)
//! plus a [`CommsHandle`] facade held by the owning node. The facade's
//! `transmit` is a non-blocking enqueue onto the driver's control channel; the
//! driver guarantees exactly-once, in-order delivery per route. Inbound frames
//! are decoded by the driver and pushed into the owner's priority/ordered
//! queues through an [`InboundSink`], classified by
//! [`Action::is_priority`](weave_core::Action::is_priority).

#![deny(clippy::all)]

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use weave_core::{protocol, Action, ActionMessage, CodecError, GlobalId, RouteId};

pub mod inproc;
pub mod tcp;
pub mod udp;

pub use inproc::CommsRegistry;

#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("frame of {0} bytes exceeds the transport MTU")]
    OversizeFrame(usize),

    #[error("transport already disconnected")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Observable lifecycle of a transport instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CommsStatus {
    #[default]
    Created,
    Connected,
    Terminated,
    Errored,
}

/// Commands from the owning node to the transport driver.
#[derive(Debug)]
pub enum ControlCommand {
    /// Install (or replace) the outbound channel for a route.
    NewRoute(RouteId, String),
    RemoveRoute(RouteId),
    Send(RouteId, ActionMessage),
    Disconnect,
}

/// Where a driver delivers decoded inbound frames: the owning node's two
/// input queues. Ownership of each message transfers here; drivers never
/// retain references to delivered frames.
#[derive(Debug, Clone)]
pub struct InboundSink {
    priority_tx: mpsc::UnboundedSender<ActionMessage>,
    ordered_tx: mpsc::UnboundedSender<ActionMessage>,
}

impl InboundSink {
    pub fn new(
        priority_tx: mpsc::UnboundedSender<ActionMessage>,
        ordered_tx: mpsc::UnboundedSender<ActionMessage>,
    ) -> Self {
        Self {
            priority_tx,
            ordered_tx,
        }
    }

    /// Hand a message to the owning node. Returns false if the node has shut
    /// its queues.
    pub fn deliver(&self, msg: ActionMessage) -> bool {
        let tx = if msg.is_priority() {
            &self.priority_tx
        } else {
            &self.ordered_tx
        };
        tx.send(msg).is_ok()
    }

    /// Report a transport-visible fault to the owner as a protocol action.
    pub fn deliver_error(&self, source: GlobalId, text: impl Into<String>) {
        let mut msg = ActionMessage::new(Action::Protocol);
        msg.message_id = protocol::DISCONNECT_ERROR;
        msg.source_id = source;
        msg.strings.push(text.into());
        let _ = self.priority_tx.send(msg);
    }
}

/// Facade over a running transport driver. Cheap to clone; `transmit` is safe
/// from any thread, and delivery order per route follows the enqueue order.
#[derive(Debug, Clone)]
pub struct CommsHandle {
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    status_rx: watch::Receiver<CommsStatus>,
    /// The advertised address other nodes can reach this transport at.
    address: String,
}

impl CommsHandle {
    pub fn new(
        control_tx: mpsc::UnboundedSender<ControlCommand>,
        status_rx: watch::Receiver<CommsStatus>,
        address: String,
    ) -> Self {
        Self {
            control_tx,
            status_rx,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> CommsStatus {
        *self.status_rx.borrow()
    }

    /// Non-blocking enqueue of `msg` onto `route`.
    pub fn transmit(&self, route: RouteId, msg: ActionMessage) -> Result<(), CommsError> {
        self.control_tx
            .send(ControlCommand::Send(route, msg))
            .map_err(|_| CommsError::Closed)
    }

    pub fn add_route(&self, route: RouteId, address: impl Into<String>) -> Result<(), CommsError> {
        self.control_tx
            .send(ControlCommand::NewRoute(route, address.into()))
            .map_err(|_| CommsError::Closed)
    }

    pub fn remove_route(&self, route: RouteId) -> Result<(), CommsError> {
        self.control_tx
            .send(ControlCommand::RemoveRoute(route))
            .map_err(|_| CommsError::Closed)
    }

    /// Wait until the driver reports [`CommsStatus::Connected`].
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<(), CommsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *self.status_rx.borrow() {
                CommsStatus::Connected => return Ok(()),
                CommsStatus::Errored | CommsStatus::Terminated => {
                    return Err(CommsError::ConnectionFailure(
                        "transport failed before connecting".into(),
                    ))
                }
                CommsStatus::Created => {}
            }
            tokio::select! {
                changed = self.status_rx.changed() => {
                    if changed.is_err() {
                        return Err(CommsError::Closed);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CommsError::ConnectionFailure("connect timed out".into()));
                }
            }
        }
    }

    /// Begin graceful shutdown: the driver flushes in-flight frames, closes
    /// its receiver, then releases sockets. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.control_tx.send(ControlCommand::Disconnect);
    }

    /// Wait for the driver to fully terminate.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if matches!(
                *self.status_rx.borrow(),
                CommsStatus::Terminated | CommsStatus::Errored
            ) {
                return true;
            }
            tokio::select! {
                changed = self.status_rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }
}

/// Retry cadence for establishing outbound connections.
pub(crate) const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Default bound on the whole connect schedule.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
