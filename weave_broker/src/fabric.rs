//! Common routing fabric shared by brokers and cores.
//!
//! A node is a single-threaded dispatch loop over two inbound queues plus a
//! routing table mapping global ids to transport routes. The dispatch loop is
//! the only mutator of node state; transports deliver decoded messages into
//! the queues and the facade objects inject API requests the same way.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, watch};

use weave_core::{
    ActionMessage, ConnectionState, CoreType, ErrorKind, GlobalId, RouteId, WeaveError,
};
use weave_network::{inproc, tcp, udp, CommsHandle, CommsRegistry, InboundSink};

/// Construction parameters shared by brokers and cores.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub core_type: CoreType,
    /// Parent address; `None` makes a broker the root.
    pub broker_address: Option<String>,
    pub local_interface: String,
    pub port: u16,
    /// Registry for in-process federations.
    pub registry: Option<Arc<CommsRegistry>>,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Promote local errors to a federation-wide abort.
    pub terminate_on_error: bool,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, core_type: CoreType) -> Self {
        Self {
            name: name.into(),
            core_type,
            broker_address: None,
            local_interface: "127.0.0.1".into(),
            port: 0,
            registry: None,
            connect_timeout: weave_network::DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Duration::from_secs(4),
            terminate_on_error: false,
        }
    }

    pub fn with_broker(mut self, address: impl Into<String>) -> Self {
        self.broker_address = Some(address.into());
        self
    }

    pub fn with_registry(mut self, registry: Arc<CommsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Outstanding queries keyed by sequence id, shared between a facade and its
/// dispatch loop.
pub(crate) type PendingQueries = Arc<Mutex<HashMap<i32, oneshot::Sender<String>>>>;

/// Mutable node base owned by a dispatch loop.
pub(crate) struct NodeState {
    pub id: GlobalId,
    pub name: String,
    pub is_root: bool,
    pub state: ConnectionState,
    pub comms: CommsHandle,
    routes: BTreeMap<GlobalId, RouteId>,
    next_route: i32,
    state_tx: watch::Sender<ConnectionState>,
}

impl NodeState {
    pub fn new(
        name: String,
        comms: CommsHandle,
        state_tx: watch::Sender<ConnectionState>,
        is_root: bool,
    ) -> Self {
        Self {
            id: if is_root {
                GlobalId::ROOT
            } else {
                GlobalId::UNKNOWN
            },
            name,
            is_root,
            state: ConnectionState::Created,
            comms,
            routes: BTreeMap::new(),
            next_route: 1,
            state_tx,
        }
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(node = %self.name, ?state, "state transition");
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    /// Install a transport route for `dest`, replacing any existing binding.
    pub fn add_route(&mut self, dest: GlobalId, address: &str) -> RouteId {
        let route = self.transport_route(address);
        self.routes.insert(dest, route);
        route
    }

    /// Open a transport route to `address` without binding it to a global id;
    /// used to answer peers that never completed registration.
    pub fn transport_route(&mut self, address: &str) -> RouteId {
        let route = RouteId(self.next_route);
        self.next_route += 1;
        if self.comms.add_route(route, address).is_err() {
            tracing::warn!(node = %self.name, "transport closed while adding route");
        }
        route
    }

    /// Point `dest` at an already-established route.
    pub fn alias_route(&mut self, dest: GlobalId, route: RouteId) {
        self.routes.insert(dest, route);
    }

    pub fn remove_route(&mut self, dest: GlobalId) {
        self.routes.remove(&dest);
    }

    pub fn route_for(&self, dest: GlobalId) -> Option<RouteId> {
        self.routes.get(&dest).copied()
    }

    /// The routing decision for a message not addressed to this node: a known
    /// route, else the parent, else (at the root) drop.
    pub fn forward(&self, msg: ActionMessage) {
        if let Some(route) = self.routes.get(&msg.dest_id) {
            let _ = self.comms.transmit(*route, msg);
        } else if !self.is_root {
            let _ = self.comms.transmit(RouteId::PARENT, msg);
        } else {
            tracing::warn!(node = %self.name, %msg, "no route to destination; dropping");
        }
    }

    pub fn send_parent(&self, msg: ActionMessage) {
        let _ = self.comms.transmit(RouteId::PARENT, msg);
    }

    pub fn send_route(&self, route: RouteId, msg: ActionMessage) {
        let _ = self.comms.transmit(route, msg);
    }

    /// Broadcast `msg` on every distinct downstream route.
    pub fn broadcast_down(&self, msg: &ActionMessage) {
        let mut seen = Vec::new();
        for route in self.routes.values() {
            if !seen.contains(route) {
                seen.push(*route);
                let _ = self.comms.transmit(*route, msg.clone());
            }
        }
    }
}

/// Spawn the transport matching `core_type`. `server_mode` is whether the
/// node accepts inbound links (brokers do, leaf cores do not).
pub(crate) async fn spawn_comms(
    config: &NodeConfig,
    sink: InboundSink,
    server_mode: bool,
) -> Result<CommsHandle, WeaveError> {
    if !config.core_type.is_available() {
        return Err(WeaveError::new(
            ErrorKind::InvalidArgument,
            format!("core type '{}' is not available in this build", config.core_type),
        ));
    }
    match config.core_type {
        CoreType::InProc | CoreType::Test | CoreType::Default => {
            let registry = config.registry.clone().ok_or_else(|| {
                WeaveError::new(
                    ErrorKind::InvalidArgument,
                    "in-process comms require a registry",
                )
            })?;
            inproc::spawn(
                inproc::InProcConfig {
                    name: config.name.clone(),
                    broker_address: config.broker_address.clone(),
                    connect_timeout: config.connect_timeout,
                },
                registry,
                sink,
            )
            .map_err(|err| WeaveError::connection(err.to_string()))
        }
        CoreType::Tcp | CoreType::TcpSs => {
            let mut tcp_config = tcp::TcpConfig::new(config.name.clone());
            tcp_config.local_interface = config.local_interface.clone();
            tcp_config.port = config.port;
            // Single-socket mode never listens; plain TCP listens when acting
            // as a parent for others.
            tcp_config.server_mode = server_mode && config.core_type == CoreType::Tcp;
            tcp_config.broker_address = config.broker_address.clone();
            tcp_config.connect_timeout = config.connect_timeout;
            tcp::spawn(tcp_config, sink)
                .await
                .map_err(|err| WeaveError::connection(err.to_string()))
        }
        CoreType::Udp => {
            let mut udp_config = udp::UdpConfig::new(config.name.clone());
            udp_config.local_interface = config.local_interface.clone();
            udp_config.port = config.port;
            udp_config.broker_address = config.broker_address.clone();
            udp_config.connect_timeout = config.connect_timeout;
            udp::spawn(udp_config, sink)
                .await
                .map_err(|err| WeaveError::connection(err.to_string()))
        }
        CoreType::Zmq | CoreType::Ipc => unreachable!("rejected by availability check"),
    }
}

/// Inbound queue pair for a dispatch loop, with the sink transports and
/// facades deliver into.
pub(crate) struct InboundQueues {
    pub priority_rx: mpsc::UnboundedReceiver<ActionMessage>,
    pub ordered_rx: mpsc::UnboundedReceiver<ActionMessage>,
    pub sink: InboundSink,
}

pub(crate) fn inbound_queues() -> InboundQueues {
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    let (ordered_tx, ordered_rx) = mpsc::unbounded_channel();
    InboundQueues {
        priority_rx,
        ordered_rx,
        sink: InboundSink::new(priority_tx, ordered_tx),
    }
}

/// Observe a node's lifecycle until it terminates or `timeout` expires.
/// Repeated calls after disconnection return immediately.
pub async fn wait_for_state(
    state_rx: &mut watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if state_rx.borrow().is_terminated() {
            return true;
        }
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
            _ = tokio::time::sleep_until(deadline) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::Action;
    use weave_network::inproc::{self, InProcConfig};

    type SinkPair = (
        InboundSink,
        mpsc::UnboundedReceiver<ActionMessage>,
        mpsc::UnboundedReceiver<ActionMessage>,
    );

    fn sink_pair() -> SinkPair {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (ordered_tx, ordered_rx) = mpsc::unbounded_channel();
        (InboundSink::new(priority_tx, ordered_tx), priority_rx, ordered_rx)
    }

    #[test_log::test(tokio::test)]
    async fn added_routes_override_the_parent_fallback() {
        let registry = CommsRegistry::new();

        let (parent_sink, _pp, mut parent_rx) = sink_pair();
        let (x_sink, _xp, mut x_rx) = sink_pair();
        let (node_sink, _np, _no) = sink_pair();

        registry.register("parent", parent_sink).unwrap();
        registry.register("x", x_sink).unwrap();

        let mut comms = inproc::spawn(
            InProcConfig {
                name: "node".into(),
                broker_address: Some("parent".into()),
                connect_timeout: Duration::from_secs(1),
            },
            registry,
            node_sink,
        )
        .unwrap();
        comms.wait_connected(Duration::from_secs(1)).await.unwrap();

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Created);
        let mut node = NodeState::new("node".into(), comms, state_tx, false);

        let dest = GlobalId(5);
        let msg = ActionMessage::routed(Action::PubData, GlobalId::ROOT, dest);

        // Unknown destination falls back to the parent.
        node.forward(msg.clone());
        assert_eq!(parent_rx.recv().await.unwrap().dest_id, dest);

        // An installed route takes over.
        node.add_route(dest, "x");
        node.forward(msg.clone());
        assert_eq!(x_rx.recv().await.unwrap().dest_id, dest);

        // Removal restores the parent fallback.
        node.remove_route(dest);
        node.forward(msg);
        assert_eq!(parent_rx.recv().await.unwrap().dest_id, dest);
    }
}
