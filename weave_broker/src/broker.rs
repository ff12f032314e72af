//! Broker logic: federation assembly, global name resolution, query routing,
//! time-barrier fan-out and disconnect orchestration.
//!
//! The unique root broker owns the authoritative registries (global ids,
//! interface names, the dependency graph); intermediate brokers cache entries
//! as they pass through and otherwise just route. All state is owned by a
//! single dispatch task; the [`Broker`] facade injects requests into the same
//! queues the transports feed.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use petgraph::graphmap::DiGraphMap;
use serde_json::json;
use tokio::sync::{oneshot, watch};

use weave_core::{
    protocol, Action, ActionMessage, ConnectionState, ErrorKind, GlobalId, InterfaceKind,
    MessageFlags, Time, WeaveError, FEDERATE_ID_SHIFT,
};
use weave_network::InboundSink;

use crate::fabric::{self, inbound_queues, NodeConfig, NodeState, PendingQueries};

/// Broker construction parameters.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node: NodeConfig,
    /// Minimum direct children before the federation may initialize.
    pub min_children: usize,
    pub query_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            min_children: 1,
            query_timeout: Duration::from_secs(4),
        }
    }
}

/// Handle to a running broker. Clones share the same broker.
#[derive(Debug, Clone)]
pub struct Broker {
    name: String,
    address: String,
    sink: InboundSink,
    state_rx: watch::Receiver<ConnectionState>,
    pending: PendingQueries,
    sequence: Arc<AtomicI32>,
    commands: Arc<Mutex<VecDeque<(String, String)>>>,
    query_timeout: Duration,
    disconnect_timeout: Duration,
}

impl Broker {
    /// Spawn a broker and connect it into the federation. With no parent
    /// address the broker is the root.
    pub async fn connect(config: BrokerConfig) -> Result<Broker, WeaveError> {
        let queues = inbound_queues();
        let sink = queues.sink.clone();
        let is_root = config.node.broker_address.is_none();

        let mut comms = fabric::spawn_comms(&config.node, sink.clone(), true).await?;
        comms
            .wait_connected(config.node.connect_timeout)
            .await
            .map_err(|err| WeaveError::connection(err.to_string()))?;
        let address = comms.address().to_owned();

        let (state_tx, state_rx) = watch::channel(ConnectionState::Created);
        let pending: PendingQueries = Arc::default();
        let commands: Arc<Mutex<VecDeque<(String, String)>>> = Arc::default();

        let runner = BrokerRunner::new(
            &config,
            NodeState::new(config.node.name.clone(), comms, state_tx, is_root),
            pending.clone(),
            commands.clone(),
        );
        tokio::spawn(runner.run(queues));

        let mut broker = Broker {
            name: config.node.name.clone(),
            address,
            sink,
            state_rx,
            pending,
            sequence: Arc::new(AtomicI32::new(1)),
            commands,
            query_timeout: config.query_timeout,
            disconnect_timeout: config.node.disconnect_timeout,
        };

        // The runner performs the upstream registration handshake; wait for
        // the ack to land before handing the broker out.
        let deadline = tokio::time::Instant::now() + config.node.connect_timeout;
        loop {
            let current_state = *broker.state_rx.borrow();
            match current_state {
                ConnectionState::Connected | ConnectionState::Executing => return Ok(broker),
                ConnectionState::Errored | ConnectionState::Disconnected => {
                    return Err(WeaveError::connection("broker failed to connect"));
                }
                _ => {}
            }
            tokio::select! {
                changed = broker.state_rx.changed() => {
                    if changed.is_err() {
                        return Err(WeaveError::connection("broker task exited"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeaveError::timeout("timed out connecting broker"));
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transport address children connect to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state_rx.borrow(),
            ConnectionState::Connected | ConnectionState::Executing
        )
    }

    /// Issue a fast-channel query and wait for the answer.
    pub async fn query(&self, target: &str, query: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("query table poisoned")
            .insert(sequence, tx);

        let mut msg = ActionMessage::new(Action::Query);
        msg.sequence_id = sequence;
        msg.strings.push(target.to_owned());
        msg.strings.push(query.to_owned());
        self.sink.deliver(msg);

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.pending
                    .lock()
                    .expect("query table poisoned")
                    .remove(&sequence);
                error_json(ErrorKind::Timeout, "query timed out")
            }
        }
    }

    /// Install a federation-wide upper bound on granted times.
    pub fn set_time_barrier(&self, time: Time) {
        let mut msg = ActionMessage::new(Action::SetTimeBarrier);
        msg.action_time = time;
        self.sink.deliver(msg);
    }

    pub fn clear_time_barrier(&self) {
        self.sink.deliver(ActionMessage::new(Action::ClearTimeBarrier));
    }

    /// Register an alternate name for an interface; targets resolve through
    /// the alias table on the root.
    pub fn add_alias(&self, alias: &str, canonical: &str) {
        let msg = ActionMessage::new(Action::AddAlias)
            .with_string(alias)
            .with_string(canonical);
        self.sink.deliver(msg);
    }

    /// Store a federation-global key/value pair on the root.
    pub fn set_global(&self, name: &str, value: &str) {
        let msg = ActionMessage::new(Action::SetGlobal)
            .with_string(name)
            .with_string(value);
        self.sink.deliver(msg);
    }

    /// Send a free-form command string to a named participant.
    pub fn send_command(&self, target: &str, command: &str) {
        let msg = ActionMessage::new(Action::SendCommand)
            .with_string(target)
            .with_string(command)
            .with_string(&self.name);
        self.sink.deliver(msg);
    }

    /// Pop the next command addressed to this broker, if any.
    pub fn get_command(&self) -> Option<(String, String)> {
        self.commands
            .lock()
            .expect("command queue poisoned")
            .pop_front()
    }

    /// Begin a graceful federation shutdown from this broker.
    pub fn disconnect(&self) {
        self.sink.deliver(ActionMessage::new(Action::UserDisconnect));
    }

    /// Abort the federation: every participant transitions to errored and
    /// transports close within the disconnect window.
    pub fn force_terminate(&self) {
        let mut msg = ActionMessage::new(Action::GlobalError);
        msg.message_id = ErrorKind::UserAbort.code();
        msg.payload = bytes::Bytes::from_static(b"force terminate");
        self.sink.deliver(msg);
    }

    /// Block until the broker is disconnected or `timeout` expires.
    pub async fn wait_for_disconnect(&mut self, timeout: Duration) -> bool {
        fabric::wait_for_state(&mut self.state_rx, timeout).await
    }

    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
    }
}

fn error_json(kind: ErrorKind, message: &str) -> String {
    json!({"error": {"code": kind.code(), "message": message}}).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    Broker,
    Core,
}

#[derive(Debug)]
struct ChildEntry {
    name: String,
    kind: ChildKind,
    state: ConnectionState,
    init_reported: bool,
}

/// Where a pending registration came from, for routing the ack back down.
#[derive(Debug, Clone)]
enum RegOrigin {
    /// Registered over a direct transport link at this address.
    Direct(String),
    /// Forwarded by an already-registered subordinate.
    Via(GlobalId),
}

#[derive(Debug, Clone)]
struct InterfaceEntry {
    fed: GlobalId,
    handle: weave_core::HandleId,
    kind: InterfaceKind,
    data_type: String,
    units: String,
    flags: MessageFlags,
}

#[derive(Debug)]
struct FedInfo {
    name: String,
    core: GlobalId,
    state: ConnectionState,
}

struct BrokerRunner {
    node: NodeState,
    min_children: usize,
    terminate_on_error: bool,
    // Root id allocation.
    next_broker_id: i32,
    next_fed_id: i32,
    // Direct children, keyed by assigned id.
    children: BTreeMap<GlobalId, ChildEntry>,
    // Every name registered anywhere in the subtree (root: whole federation).
    registered: HashMap<String, (GlobalId, ChildKind, String)>,
    pending_reg: HashMap<String, RegOrigin>,
    // Global interface registry.
    publications: HashMap<String, InterfaceEntry>,
    inputs: HashMap<String, (InterfaceEntry, String)>,
    endpoints: HashMap<String, InterfaceEntry>,
    filters: HashMap<String, (InterfaceEntry, String, String)>,
    aliases: HashMap<String, String>,
    pending_inputs: HashMap<String, Vec<String>>,
    pending_filters: HashMap<String, Vec<String>>,
    // Federates (root authoritative).
    federates: BTreeMap<GlobalId, FedInfo>,
    fed_names: HashMap<String, GlobalId>,
    // Fed-level dependency graph and the core-level fan-out edges derived
    // from it.
    dep_graph: DiGraphMap<i32, ()>,
    core_edges: HashSet<(GlobalId, GlobalId)>,
    core_times: BTreeMap<GlobalId, Time>,
    // Initialization and execution barriers.
    init_granted: bool,
    exec_requests: HashMap<GlobalId, bool>,
    exec_round: i16,
    exec_granted: bool,
    // Active time barrier.
    barrier_sequence: i32,
    active_barrier: Option<Time>,
    // Root-held globals and broker-local tags.
    globals: HashMap<String, String>,
    tags: HashMap<String, String>,
    // Disconnect orchestration.
    disconnect_initiated: bool,
    pending: PendingQueries,
    commands: Arc<Mutex<VecDeque<(String, String)>>>,
}

impl BrokerRunner {
    fn new(
        config: &BrokerConfig,
        node: NodeState,
        pending: PendingQueries,
        commands: Arc<Mutex<VecDeque<(String, String)>>>,
    ) -> Self {
        Self {
            node,
            min_children: config.min_children,
            terminate_on_error: config.node.terminate_on_error,
            next_broker_id: GlobalId::ROOT.0 + 1,
            next_fed_id: FEDERATE_ID_SHIFT,
            children: BTreeMap::new(),
            registered: HashMap::new(),
            pending_reg: HashMap::new(),
            publications: HashMap::new(),
            inputs: HashMap::new(),
            endpoints: HashMap::new(),
            filters: HashMap::new(),
            aliases: HashMap::new(),
            pending_inputs: HashMap::new(),
            pending_filters: HashMap::new(),
            federates: BTreeMap::new(),
            fed_names: HashMap::new(),
            dep_graph: DiGraphMap::new(),
            core_edges: HashSet::new(),
            core_times: BTreeMap::new(),
            init_granted: false,
            exec_requests: HashMap::new(),
            exec_round: 0,
            exec_granted: false,
            barrier_sequence: 0,
            active_barrier: None,
            globals: HashMap::new(),
            tags: HashMap::new(),
            disconnect_initiated: false,
            pending,
            commands,
        }
    }

    #[tracing::instrument(skip_all, fields(broker = %self.node.name))]
    async fn run(mut self, mut queues: fabric::InboundQueues) {
        if self.node.is_root {
            self.node.set_state(ConnectionState::Connected);
        } else {
            // Register with the parent; the ack adopts our assigned id.
            let reg = ActionMessage::new(Action::RegBroker)
                .with_string(&self.node.name)
                .with_string(self.node.comms.address());
            self.node.send_parent(reg);
        }

        loop {
            tokio::select! {
                biased;
                msg = queues.priority_rx.recv() => match msg {
                    Some(msg) => self.process_priority(msg),
                    None => break,
                },
                msg = queues.ordered_rx.recv() => match msg {
                    Some(msg) => self.process_ordered(msg),
                    None => break,
                },
            }
            if self.node.state.is_terminated() {
                break;
            }
        }

        self.node.comms.disconnect();
        tracing::info!(broker = %self.node.name, "broker loop exited");
    }

    fn process_priority(&mut self, msg: ActionMessage) {
        tracing::trace!(broker = %self.node.name, %msg, "priority command");
        match msg.action {
            Action::Protocol => self.handle_protocol(msg),
            Action::Ping => {
                let reply = ActionMessage::routed(Action::Pong, self.node.id, msg.source_id);
                self.node.forward(reply);
            }
            Action::Pong => {}
            Action::RegBroker | Action::RegCore => self.handle_registration(msg),
            Action::RegFed => self.handle_fed_registration(msg),
            Action::Ack => self.handle_ack(msg),
            Action::NewBrokerInformation => self.handle_new_broker_information(msg),
            Action::RegPub | Action::RegInput | Action::RegEndpoint | Action::RegFilter => {
                self.handle_interface(msg)
            }
            Action::AddAlias => self.handle_alias(msg),
            Action::Query => self.handle_query(msg, false),
            Action::QueryReply => self.handle_query_reply(msg),
            Action::SendCommand => self.handle_command(msg),
            Action::SetGlobal => self.handle_set_global(msg),
            Action::NewRoute => {
                self.node
                    .add_route(GlobalId(msg.message_id), msg.name().unwrap_or_default());
            }
            Action::RemoveRoute => self.node.remove_route(GlobalId(msg.message_id)),
            Action::UserDisconnect => self.begin_disconnect(),
            Action::Disconnect => self.handle_disconnect_broadcast(),
            Action::DisconnectFed => self.handle_fed_disconnect(msg),
            Action::DisconnectCore | Action::DisconnectBroker => self.handle_child_disconnect(msg),
            Action::DisconnectAck => self.handle_disconnect_ack(msg),
            Action::DisconnectFedAck => self.node.forward(msg),
            Action::LocalError => self.handle_local_error(msg),
            Action::GlobalError | Action::Terminate => self.enter_errored(msg),
            Action::Error => self.handle_error(msg),
            _ => {
                if msg.dest_id.is_valid() && msg.dest_id != self.node.id {
                    self.node.forward(msg);
                } else {
                    tracing::debug!(broker = %self.node.name, %msg, "ignoring command");
                }
            }
        }
    }

    fn process_ordered(&mut self, msg: ActionMessage) {
        tracing::trace!(broker = %self.node.name, %msg, "ordered command");
        match msg.action {
            Action::TimeRequest => self.handle_time_report(msg),
            Action::Init => self.handle_init(msg),
            Action::InitGrant => {
                self.init_granted = true;
                self.node.broadcast_down(&msg);
            }
            Action::ExecRequest => self.handle_exec_request(msg),
            Action::ExecGrant => {
                self.exec_granted = !msg.flags.iteration_requested();
                if self.exec_granted {
                    self.node.set_state(ConnectionState::Executing);
                }
                self.node.broadcast_down(&msg);
            }
            Action::SetTimeBarrier => self.handle_set_barrier(msg),
            Action::ClearTimeBarrier => self.handle_clear_barrier(msg),
            Action::QueryOrdered => self.handle_query(msg, true),
            Action::QueryReplyOrdered => self.handle_query_reply(msg),
            Action::SendCommandOrdered => self.handle_command(msg),
            Action::Log => self.handle_log(msg),
            Action::SendMessage | Action::FilteredMessage => self.route_endpoint_message(msg),
            Action::PubData
            | Action::NullMessage
            | Action::TimeGrant
            | Action::AddSubscriber
            | Action::AddPublisher
            | Action::AddEndpoint
            | Action::AddFilter
            | Action::AddDependency
            | Action::AddDependent
            | Action::RemoveDependency
            | Action::RemoveDependent => self.node.forward(msg),
            _ => {
                if msg.dest_id.is_valid() && msg.dest_id != self.node.id {
                    self.node.forward(msg);
                } else {
                    tracing::debug!(broker = %self.node.name, %msg, "ignoring command");
                }
            }
        }
    }

    /// The root refused a registration over an address conflict. Once
    /// disconnected a participant cannot rejoin, so the registrant errors out
    /// and must restart with fresh connection details.
    fn handle_new_broker_information(&mut self, msg: ActionMessage) {
        if let Some(name) = msg.name() {
            if let Some(origin) = self.pending_reg.remove(name) {
                self.reply_to_origin(&origin, msg);
                return;
            }
        }
        if self.node.state == ConnectionState::Created {
            tracing::error!(
                broker = %self.node.name,
                "registration address rejected; restart with new connection details"
            );
            self.node.set_state(ConnectionState::Errored);
        }
    }

    /// Error routing: errors answering a registration we forwarded go back
    /// down the pending-name path; our own refusal flips us to errored; the
    /// rest route by destination.
    fn handle_error(&mut self, msg: ActionMessage) {
        if let Some(name) = msg.name() {
            if let Some(origin) = self.pending_reg.remove(name) {
                self.reply_to_origin(&origin, msg);
                return;
            }
            if name == self.node.name && self.node.state == ConnectionState::Created {
                tracing::error!(broker = %self.node.name, "registration refused: {}", msg.payload_str());
                self.node.set_state(ConnectionState::Errored);
                return;
            }
        }
        if msg.dest_id == self.node.id || !msg.dest_id.is_valid() {
            tracing::error!(broker = %self.node.name, "{}", msg.payload_str());
            if self.node.state == ConnectionState::Created {
                self.node.set_state(ConnectionState::Errored);
            }
        } else {
            self.node.forward(msg);
        }
    }

    /// Answer a registration attempt, including ones that are being refused
    /// and therefore have no global id to route by.
    fn reply_to_origin(&mut self, origin: &RegOrigin, msg: ActionMessage) {
        match origin {
            RegOrigin::Direct(address) => {
                let route = self.node.transport_route(address);
                self.node.send_route(route, msg);
            }
            RegOrigin::Via(via) => match self.node.route_for(*via) {
                Some(route) => self.node.send_route(route, msg),
                None => tracing::warn!(broker = %self.node.name, "no route back to registrant"),
            },
        }
    }

    fn handle_protocol(&mut self, msg: ActionMessage) {
        if msg.message_id == protocol::DISCONNECT_ERROR {
            tracing::warn!(broker = %self.node.name, "transport fault: {}", msg.name().unwrap_or("?"));
            if self.node.state == ConnectionState::Created {
                self.node.set_state(ConnectionState::Errored);
            }
        }
    }

    /// A subordinate broker or core asks to join the federation.
    fn handle_registration(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();
        let address = msg.strings.get(1).cloned().unwrap_or_default();
        let kind = if msg.action == Action::RegCore {
            ChildKind::Core
        } else {
            ChildKind::Broker
        };

        let origin = if msg.source_id.is_valid() {
            RegOrigin::Via(msg.source_id)
        } else {
            RegOrigin::Direct(address.clone())
        };

        if !self.node.is_root {
            self.pending_reg.insert(name, origin);
            let mut fwd = msg;
            fwd.source_id = self.node.id;
            self.node.send_parent(fwd);
            return;
        }

        // Root: the federation is sealed once initialization is granted.
        if self.init_granted {
            tracing::warn!(%name, "registration after initialization; refusing");
            // A direct peer gets the disconnect; through intermediates the
            // refusal travels as a name-matched error so it cannot be read
            // as a shutdown broadcast.
            let reply = match &origin {
                RegOrigin::Direct(_) => ActionMessage::new(Action::Disconnect),
                RegOrigin::Via(_) => {
                    let mut reply = ActionMessage::new(Action::Error);
                    reply.message_id = ErrorKind::RegistrationFailure.code();
                    reply.payload = bytes::Bytes::from("federation already initialized");
                    reply.strings.push(name.clone());
                    reply
                }
            };
            self.reply_to_origin(&origin, reply);
            return;
        }
        if self.registered.contains_key(&name) {
            let mut reply = ActionMessage::new(Action::Error);
            reply.message_id = ErrorKind::RegistrationFailure.code();
            reply.payload = bytes::Bytes::from(format!("name '{name}' already registered"));
            reply.strings.push(name.clone());
            self.reply_to_origin(&origin, reply);
            return;
        }
        // A different name advertising an address we already route to is a
        // stale peer; tell it to come back with fresh connection details.
        if !address.is_empty()
            && !address.starts_with('@')
            && self
                .registered
                .values()
                .any(|(_, _, registered_addr)| *registered_addr == address)
        {
            tracing::warn!(%name, %address, "registration address collides with an existing peer");
            let mut reply = ActionMessage::new(Action::NewBrokerInformation);
            reply.strings.push(name.clone());
            reply.strings.push(address);
            self.reply_to_origin(&origin, reply);
            return;
        }

        let id = GlobalId(self.next_broker_id);
        self.next_broker_id += 1;

        let route = match &origin {
            RegOrigin::Direct(addr) => {
                let route = self.node.add_route(id, addr);
                self.children.insert(
                    id,
                    ChildEntry {
                        name: name.clone(),
                        kind,
                        state: ConnectionState::Connected,
                        init_reported: false,
                    },
                );
                route
            }
            RegOrigin::Via(via) => {
                let route = self
                    .node
                    .route_for(*via)
                    .expect("forwarding child has a route");
                self.node.alias_route(id, route);
                route
            }
        };
        self.registered.insert(name.clone(), (id, kind, address));

        tracing::info!(broker = %self.node.name, %name, %id, "registered subordinate");
        let mut ack = ActionMessage::routed(Action::Ack, self.node.id, id);
        ack.strings.push(name);
        if kind == ChildKind::Core {
            ack.flags.set_core(true);
        } else {
            ack.flags.set_broker(true);
        }
        self.node.send_route(route, ack);
    }

    /// A core announces one of its federates.
    fn handle_fed_registration(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();
        let core = msg.source_id;

        if !self.node.is_root {
            self.pending_reg.insert(name, RegOrigin::Via(core));
            self.node.send_parent(msg);
            return;
        }

        if self.init_granted || self.fed_names.contains_key(&name) {
            let mut reply = ActionMessage::routed(Action::Error, self.node.id, core);
            reply.message_id = ErrorKind::RegistrationFailure.code();
            reply.payload = bytes::Bytes::from(format!("federate '{name}' rejected"));
            reply.strings.push(name);
            self.node.forward(reply);
            return;
        }

        let id = GlobalId(self.next_fed_id);
        self.next_fed_id += 1;
        self.federates.insert(
            id,
            FedInfo {
                name: name.clone(),
                core,
                state: ConnectionState::Connected,
            },
        );
        self.fed_names.insert(name.clone(), id);
        self.dep_graph.add_node(id.0);

        if let Some(route) = self.node.route_for(core) {
            self.node.alias_route(id, route);
        }

        tracing::info!(broker = %self.node.name, federate = %name, %id, "registered federate");
        let mut ack = ActionMessage::routed(Action::Ack, self.node.id, id);
        ack.strings.push(name);
        self.node.forward(ack);
    }

    fn handle_ack(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();

        // Our own registration coming back.
        if !self.node.id.is_valid() && name == self.node.name {
            self.node.id = msg.dest_id;
            self.node.set_state(ConnectionState::Connected);
            tracing::info!(broker = %self.node.name, id = %self.node.id, "joined federation");
            return;
        }

        // An ack for a subordinate we forwarded: install the route, cache the
        // registration, and pass it along.
        if let Some(origin) = self.pending_reg.remove(&name) {
            let kind = if msg.flags.core() {
                ChildKind::Core
            } else {
                ChildKind::Broker
            };
            let route = match &origin {
                RegOrigin::Direct(addr) => {
                    let route = self.node.add_route(msg.dest_id, addr);
                    if !msg.dest_id.is_federate() {
                        self.children.insert(
                            msg.dest_id,
                            ChildEntry {
                                name: name.clone(),
                                kind,
                                state: ConnectionState::Connected,
                                init_reported: false,
                            },
                        );
                        self.registered
                            .insert(name.clone(), (msg.dest_id, kind, addr.clone()));
                    }
                    route
                }
                RegOrigin::Via(via) => {
                    let route = self
                        .node
                        .route_for(*via)
                        .expect("forwarding child has a route");
                    self.node.alias_route(msg.dest_id, route);
                    if !msg.dest_id.is_federate() {
                        self.registered
                            .insert(name.clone(), (msg.dest_id, kind, String::new()));
                    }
                    route
                }
            };
            self.node.send_route(route, msg);
            return;
        }

        self.node.forward(msg);
    }

    /// Cache an interface registration; the root also resolves connections.
    fn handle_interface(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();
        let entry = InterfaceEntry {
            fed: msg.source_id,
            handle: msg.source_handle,
            kind: match msg.action {
                Action::RegPub => InterfaceKind::Publication,
                Action::RegInput => InterfaceKind::Input,
                Action::RegEndpoint => InterfaceKind::Endpoint,
                _ => InterfaceKind::Filter,
            },
            data_type: msg.strings.get(1).cloned().unwrap_or_default(),
            units: msg.strings.get(2).cloned().unwrap_or_default(),
            flags: msg.flags,
        };
        let target = msg.strings.get(3).cloned().unwrap_or_default();

        match msg.action {
            Action::RegPub => {
                if self.node.is_root && self.publications.contains_key(&name) {
                    let mut err =
                        ActionMessage::routed(Action::Error, self.node.id, msg.source_id);
                    err.message_id = ErrorKind::RegistrationFailure.code();
                    err.payload =
                        bytes::Bytes::from(format!("duplicate publication name '{name}'"));
                    err.strings.push(name);
                    self.node.forward(err);
                    return;
                }
                self.publications.insert(name.clone(), entry);
                if self.node.is_root {
                    self.resolve_new_publication(&name);
                }
            }
            Action::RegInput => {
                self.inputs.insert(name.clone(), (entry, target.clone()));
                if self.node.is_root && !target.is_empty() {
                    self.resolve_input(&name, &target);
                }
            }
            Action::RegEndpoint => {
                self.endpoints.insert(name.clone(), entry);
                if self.node.is_root {
                    self.resolve_new_endpoint(&name);
                }
            }
            Action::RegFilter => {
                let spec_json = msg.strings.get(4).cloned().unwrap_or_default();
                self.filters
                    .insert(name.clone(), (entry, target.clone(), spec_json));
                if self.node.is_root && !target.is_empty() {
                    self.resolve_filter(&name, &target);
                }
            }
            _ => unreachable!(),
        }

        if !self.node.is_root {
            self.node.send_parent(msg);
        }
    }

    fn handle_alias(&mut self, msg: ActionMessage) {
        let alias = msg.strings.first().cloned().unwrap_or_default();
        let canonical = msg.strings.get(1).cloned().unwrap_or_default();
        self.aliases.insert(alias.clone(), canonical);
        if self.node.is_root {
            // An alias can complete pending subscriptions.
            if let Some(waiting) = self.pending_inputs.remove(&alias) {
                for input in waiting {
                    if let Some((_, target)) = self.inputs.get(&input) {
                        let target = target.clone();
                        self.resolve_input(&input, &target);
                    }
                }
            }
        } else {
            self.node.send_parent(msg);
        }
    }

    fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    fn core_of(&self, fed: GlobalId) -> GlobalId {
        self.federates
            .get(&fed)
            .map(|info| info.core)
            .unwrap_or(GlobalId::UNKNOWN)
    }

    /// A publication appeared: connect every input waiting for it.
    fn resolve_new_publication(&mut self, pub_name: &str) {
        if let Some(waiting) = self.pending_inputs.remove(pub_name) {
            for input in waiting {
                if let Some((_, target)) = self.inputs.get(&input) {
                    let target = target.clone();
                    self.resolve_input(&input, &target);
                }
            }
        }
    }

    fn resolve_input(&mut self, input_name: &str, target: &str) {
        let target = self.canonical(target).to_owned();
        let Some(pub_entry) = self.publications.get(&target).cloned() else {
            self.pending_inputs
                .entry(target)
                .or_default()
                .push(input_name.to_owned());
            return;
        };
        let Some((input_entry, _)) = self.inputs.get(input_name).cloned() else {
            return;
        };
        self.link(&target, &pub_entry, input_name, &input_entry);
    }

    /// Emit link actions to both sides and record the dependency edges.
    fn link(
        &mut self,
        pub_name: &str,
        pub_entry: &InterfaceEntry,
        input_name: &str,
        input_entry: &InterfaceEntry,
    ) {
        tracing::debug!(publication = %pub_name, input = %input_name, "linking interfaces");
        let pub_core = self.core_of(pub_entry.fed);
        let input_core = self.core_of(input_entry.fed);

        // `message_id` carries the owning federate on the receiving core.
        let mut add_sub = ActionMessage::routed(Action::AddSubscriber, input_entry.fed, pub_core);
        add_sub.message_id = pub_entry.fed.0;
        add_sub.source_handle = input_entry.handle;
        add_sub.dest_handle = pub_entry.handle;
        add_sub.strings.push(input_name.to_owned());
        self.node.forward(add_sub);

        let mut add_pub = ActionMessage::routed(Action::AddPublisher, pub_entry.fed, input_core);
        add_pub.message_id = input_entry.fed.0;
        add_pub.source_handle = pub_entry.handle;
        add_pub.dest_handle = input_entry.handle;
        add_pub.strings.push(pub_name.to_owned());
        add_pub.strings.push(pub_entry.data_type.clone());
        add_pub.strings.push(pub_entry.units.clone());
        self.node.forward(add_pub);

        self.dep_graph.add_edge(pub_entry.fed.0, input_entry.fed.0, ());

        // The dependency key a federate waits on: the peer itself when they
        // share a core, otherwise the peer's whole core (reports arrive
        // aggregated per core).
        let dep_key = if pub_core == input_core {
            pub_entry.fed
        } else {
            self.core_edges.insert((pub_core, input_core));
            pub_core
        };
        let dependent_key = if pub_core == input_core {
            input_entry.fed
        } else {
            input_core
        };

        let mut add_dep = ActionMessage::routed(Action::AddDependency, self.node.id, input_entry.fed);
        add_dep.message_id = dep_key.0;
        self.node.forward(add_dep);

        let mut add_dependent =
            ActionMessage::routed(Action::AddDependent, self.node.id, pub_entry.fed);
        add_dependent.message_id = dependent_key.0;
        self.node.forward(add_dependent);
    }

    fn resolve_new_endpoint(&mut self, endpoint: &str) {
        if let Some(waiting) = self.pending_filters.remove(endpoint) {
            for filter in waiting {
                self.resolve_filter(&filter, endpoint);
            }
        }
    }

    /// Ship a filter's stages to the core owning the target endpoint.
    fn resolve_filter(&mut self, filter_name: &str, target: &str) {
        let target = self.canonical(target).to_owned();
        let Some(endpoint) = self.endpoints.get(&target).cloned() else {
            self.pending_filters
                .entry(target)
                .or_default()
                .push(filter_name.to_owned());
            return;
        };
        let Some((filter_entry, _, spec_json)) = self.filters.get(filter_name).cloned() else {
            return;
        };

        let endpoint_core = self.core_of(endpoint.fed);
        let mut add = ActionMessage::routed(Action::AddFilter, filter_entry.fed, endpoint_core);
        add.source_handle = filter_entry.handle;
        add.dest_id = endpoint.fed;
        add.dest_handle = endpoint.handle;
        add.flags = filter_entry.flags;
        add.strings.push(filter_name.to_owned());
        add.strings.push(target);
        add.strings.push(spec_json);
        self.node.forward(add);
    }

    /// Aggregate time report from a child core: note it and fan it out to the
    /// cores that depend on the sender.
    fn handle_time_report(&mut self, msg: ActionMessage) {
        if !self.node.is_root {
            // Aggregates head for the root; the root's fanned-out copies are
            // addressed to a core and route downward.
            if msg.dest_id.is_valid() && msg.dest_id != self.node.id {
                self.node.forward(msg);
            } else {
                self.node.send_parent(msg);
            }
            return;
        }
        self.core_times.insert(msg.source_id, msg.action_time);
        let source = msg.source_id;
        let targets: Vec<GlobalId> = self
            .core_edges
            .iter()
            .filter(|(src, _)| *src == source)
            .map(|(_, dst)| *dst)
            .collect();
        for dest in targets {
            let mut fwd = msg.clone();
            fwd.dest_id = dest;
            self.node.forward(fwd);
        }
    }

    /// A child subtree is ready to initialize.
    fn handle_init(&mut self, msg: ActionMessage) {
        if let Some(child) = self.children.get_mut(&msg.source_id) {
            child.init_reported = true;
        }
        let all_ready = self.children.len() >= self.min_children
            && self
                .children
                .values()
                .all(|c| c.init_reported || c.state.is_terminated());
        if !all_ready {
            return;
        }

        if self.node.is_root {
            self.check_required_connections();
            self.init_granted = true;
            tracing::info!(broker = %self.node.name, "granting initialization");
            let grant = ActionMessage::new(Action::InitGrant);
            self.node.broadcast_down(&grant);
        } else {
            let mut up = ActionMessage::new(Action::Init);
            up.source_id = self.node.id;
            self.node.send_parent(up);
        }
    }

    /// Invariant checks deferred to initialization: required inputs must have
    /// resolved, filter targets must exist.
    fn check_required_connections(&mut self) {
        let mut errors = Vec::new();
        for (input_name, (entry, target)) in &self.inputs {
            if entry.flags.required() && !target.is_empty() {
                let target = self.canonical(target);
                if !self.publications.contains_key(target) {
                    errors.push((
                        entry.fed,
                        format!("required input '{input_name}' has no publication '{target}'"),
                    ));
                }
            }
        }
        for (filter_name, (entry, target, _)) in &self.filters {
            if !target.is_empty() && !self.endpoints.contains_key(self.canonical(target)) {
                errors.push((
                    entry.fed,
                    format!("filter '{filter_name}' targets unknown endpoint '{target}'"),
                ));
            }
        }
        for (fed, text) in errors {
            tracing::error!(%fed, "{text}");
            let mut err = ActionMessage::routed(Action::Error, self.node.id, fed);
            err.message_id = ErrorKind::ConnectionFailure.code();
            err.payload = bytes::Bytes::from(text);
            self.node.forward(err);
        }
    }

    /// One round of the executing-entry barrier. Children re-report every
    /// round; any iteration request anywhere makes the whole round iterate.
    fn handle_exec_request(&mut self, msg: ActionMessage) {
        if self.exec_granted {
            return;
        }
        self.exec_requests
            .entry(msg.source_id)
            .and_modify(|it| *it |= msg.flags.iteration_requested())
            .or_insert(msg.flags.iteration_requested());

        let active: Vec<GlobalId> = self
            .children
            .iter()
            .filter(|(_, c)| !c.state.is_terminated())
            .map(|(id, _)| *id)
            .collect();
        if active.is_empty() || !active.iter().all(|id| self.exec_requests.contains_key(id)) {
            return;
        }

        let iterate = active
            .iter()
            .any(|id| self.exec_requests.get(id).copied().unwrap_or(false));
        self.exec_requests.clear();

        if self.node.is_root {
            self.exec_round = self.exec_round.wrapping_add(1);
            let mut grant = ActionMessage::new(Action::ExecGrant);
            grant.counter = self.exec_round;
            grant.flags.set_iteration_requested(iterate);
            if !iterate {
                self.exec_granted = true;
                self.node.set_state(ConnectionState::Executing);
            }
            tracing::info!(broker = %self.node.name, iterate, "execution round grant");
            self.node.broadcast_down(&grant);
        } else {
            let mut up = ActionMessage::new(Action::ExecRequest);
            up.source_id = self.node.id;
            up.flags.set_iteration_requested(iterate);
            self.node.send_parent(up);
        }
    }

    fn handle_set_barrier(&mut self, msg: ActionMessage) {
        if !self.node.is_root {
            if msg.message_id == 0 {
                // A request heading for the root.
                self.node.send_parent(msg);
            } else {
                self.active_barrier = Some(msg.action_time);
                self.barrier_sequence = msg.message_id;
                self.node.broadcast_down(&msg);
            }
            return;
        }
        let sequence = if msg.message_id == 0 {
            self.barrier_sequence += 1;
            self.barrier_sequence
        } else if msg.message_id >= self.barrier_sequence {
            self.barrier_sequence = msg.message_id;
            msg.message_id
        } else {
            tracing::debug!(sequence = msg.message_id, "stale barrier command ignored");
            return;
        };
        self.active_barrier = Some(msg.action_time);
        let mut out = msg;
        out.message_id = sequence;
        tracing::info!(broker = %self.node.name, time = %out.action_time, sequence, "time barrier set");
        self.node.broadcast_down(&out);
    }

    fn handle_clear_barrier(&mut self, msg: ActionMessage) {
        if !self.node.is_root {
            if msg.message_id == 0 {
                self.node.send_parent(msg);
            } else {
                self.active_barrier = None;
                self.node.broadcast_down(&msg);
            }
            return;
        }
        let sequence = if msg.message_id == 0 {
            self.barrier_sequence
        } else {
            msg.message_id
        };
        if sequence < self.barrier_sequence {
            tracing::debug!(sequence, "stale barrier clear ignored");
            return;
        }
        self.active_barrier = None;
        let mut out = msg;
        out.message_id = sequence;
        tracing::info!(broker = %self.node.name, sequence, "time barrier cleared");
        self.node.broadcast_down(&out);
    }

    /// Endpoint messages with an unresolved destination are resolved from the
    /// registry; resolved ones are plain routed traffic.
    fn route_endpoint_message(&mut self, mut msg: ActionMessage) {
        if msg.dest_id.is_valid() {
            self.node.forward(msg);
            return;
        }
        let dest_name = self.canonical(msg.name().unwrap_or_default()).to_owned();
        match self.endpoints.get(&dest_name) {
            Some(endpoint) => {
                msg.dest_id = endpoint.fed;
                msg.dest_handle = endpoint.handle;
                self.node.forward(msg);
            }
            None if !self.node.is_root => self.node.send_parent(msg),
            None => {
                tracing::warn!(destination = %dest_name, "message to unknown endpoint");
                let mut err = ActionMessage::routed(Action::Error, self.node.id, msg.source_id);
                err.message_id = ErrorKind::InvalidObject.code();
                err.payload =
                    bytes::Bytes::from(format!("unknown destination endpoint '{dest_name}'"));
                self.node.forward(err);
            }
        }
    }

    fn handle_query(&mut self, msg: ActionMessage, ordered: bool) {
        let target = msg.name().unwrap_or_default().to_owned();
        let query = msg.strings.get(1).cloned().unwrap_or_default();

        let local = target.is_empty()
            || target == self.node.name
            || target == "broker"
            || (self.node.is_root && (target == "root" || target == "federation"));

        if local {
            let payload = self.answer_query(&query);
            self.send_query_reply(msg, payload, ordered);
            return;
        }

        // A named participant: forward toward it.
        let dest = self
            .fed_names
            .get(&target)
            .copied()
            .or_else(|| self.registered.get(&target).map(|(id, _, _)| *id));
        match dest {
            Some(dest) => {
                let mut fwd = msg;
                if !fwd.source_id.is_valid() {
                    fwd.source_id = self.node.id;
                }
                fwd.dest_id = dest;
                self.node.forward(fwd);
            }
            None if !self.node.is_root => {
                let mut fwd = msg;
                if !fwd.source_id.is_valid() {
                    fwd.source_id = self.node.id;
                }
                self.node.send_parent(fwd);
            }
            None => {
                let payload = error_json(ErrorKind::InvalidObject, "#invalid");
                self.send_query_reply(msg, payload, ordered);
            }
        }
    }

    fn send_query_reply(&mut self, request: ActionMessage, payload: String, ordered: bool) {
        let action = if ordered {
            Action::QueryReplyOrdered
        } else {
            Action::QueryReply
        };
        let mut reply = ActionMessage::routed(action, self.node.id, request.source_id);
        reply.sequence_id = request.sequence_id;
        reply.payload = bytes::Bytes::from(payload);

        if !request.source_id.is_valid() || request.source_id == self.node.id {
            // Local origin: complete the pending query directly.
            self.complete_query(reply.sequence_id, reply.payload_str().into_owned());
        } else {
            self.node.forward(reply);
        }
    }

    fn complete_query(&mut self, sequence: i32, payload: String) {
        if let Some(tx) = self
            .pending
            .lock()
            .expect("query table poisoned")
            .remove(&sequence)
        {
            let _ = tx.send(payload);
        }
    }

    fn handle_query_reply(&mut self, msg: ActionMessage) {
        if msg.dest_id == self.node.id || !msg.dest_id.is_valid() {
            self.complete_query(msg.sequence_id, msg.payload_str().into_owned());
        } else {
            self.node.forward(msg);
        }
    }

    fn answer_query(&self, query: &str) -> String {
        if let Some(tag) = query.strip_prefix("tag/") {
            return match self.tags.get(tag) {
                Some(value) => json!(value).to_string(),
                None => error_json(ErrorKind::InvalidObject, "#invalid"),
            };
        }
        match query {
            "name" => json!(self.node.name).to_string(),
            "address" => json!(self.node.comms.address()).to_string(),
            "isinit" => json!(self.init_granted).to_string(),
            "isconnected" => json!(!self.node.state.is_terminated()).to_string(),
            "exists" => "true".to_string(),
            "version" => json!(env!("CARGO_PKG_VERSION")).to_string(),
            "current_state" | "state" => json!(format!("{:?}", self.node.state)).to_string(),
            "status" => json!({
                "name": self.node.name,
                "state": format!("{:?}", self.node.state),
            })
            .to_string(),
            "global_status" => json!({
                "name": self.node.name,
                "state": format!("{:?}", self.node.state),
                "federates": self.federates.len(),
            })
            .to_string(),
            "brokers" => {
                let list: Vec<_> = self
                    .registered
                    .iter()
                    .filter(|(_, (_, kind, _))| *kind == ChildKind::Broker)
                    .map(|(name, (id, _, address))| {
                        json!({
                            "name": name,
                            "address": address,
                            "state": self.child_state_string(*id),
                        })
                    })
                    .collect();
                json!(list).to_string()
            }
            "cores" => {
                let list: Vec<_> = self
                    .registered
                    .iter()
                    .filter(|(_, (_, kind, _))| *kind == ChildKind::Core)
                    .map(|(name, (id, _, address))| {
                        json!({
                            "name": name,
                            "address": address,
                            "state": self.child_state_string(*id),
                        })
                    })
                    .collect();
                json!(list).to_string()
            }
            "federates" => {
                let list: Vec<_> = self.federates.values().map(|f| f.name.clone()).collect();
                json!(list).to_string()
            }
            "counts" => json!({
                "brokers": self
                    .registered
                    .values()
                    .filter(|(_, kind, _)| *kind == ChildKind::Broker)
                    .count(),
                "cores": self
                    .registered
                    .values()
                    .filter(|(_, kind, _)| *kind == ChildKind::Core)
                    .count(),
                "federates": self.federates.len(),
            })
            .to_string(),
            "interfaces" => {
                let entry_json = |name: &String, entry: &InterfaceEntry| {
                    json!({
                        "name": name,
                        "kind": format!("{:?}", entry.kind),
                        "type": entry.data_type,
                        "units": entry.units,
                        "federate": entry.fed.to_string(),
                    })
                };
                let list: Vec<_> = self
                    .publications
                    .iter()
                    .map(|(name, entry)| entry_json(name, entry))
                    .chain(self.inputs.iter().map(|(name, (entry, _))| entry_json(name, entry)))
                    .chain(self.endpoints.iter().map(|(name, entry)| entry_json(name, entry)))
                    .chain(
                        self.filters
                            .iter()
                            .map(|(name, (entry, _, _))| entry_json(name, entry)),
                    )
                    .collect();
                json!(list).to_string()
            }
            "dependencies" => {
                let edges: Vec<_> = self
                    .dep_graph
                    .all_edges()
                    .map(|(src, dst, _)| json!([GlobalId(src).to_string(), GlobalId(dst).to_string()]))
                    .collect();
                json!(edges).to_string()
            }
            "global_time" => {
                let times: serde_json::Map<String, serde_json::Value> = self
                    .core_times
                    .iter()
                    .filter_map(|(core, time)| {
                        let name = self
                            .registered
                            .iter()
                            .find(|(_, (id, _, _))| id == core)
                            .map(|(name, _)| name.clone())?;
                        Some((name, json!(time.to_seconds())))
                    })
                    .collect();
                json!(times).to_string()
            }
            "globals" => json!(self.globals).to_string(),
            "config" => json!({
                "name": self.node.name,
                "address": self.node.comms.address(),
                "root": self.node.is_root,
                "min_children": self.min_children,
                "terminate_on_error": self.terminate_on_error,
            })
            .to_string(),
            "barrier" => match self.active_barrier {
                Some(time) => json!({
                    "time": time.to_seconds(),
                    "sequence": self.barrier_sequence,
                })
                .to_string(),
                None => json!(null).to_string(),
            },
            _ => error_json(ErrorKind::InvalidObject, "#invalid"),
        }
    }

    fn child_state_string(&self, id: GlobalId) -> String {
        self.children
            .get(&id)
            .map(|c| format!("{:?}", c.state))
            .unwrap_or_else(|| "Connected".to_string())
    }

    fn handle_command(&mut self, msg: ActionMessage) {
        let target = msg.name().unwrap_or_default().to_owned();
        if target == self.node.name || target == "broker" || (self.node.is_root && target == "root")
        {
            let command = msg.strings.get(1).cloned().unwrap_or_default();
            let source = msg.strings.get(2).cloned().unwrap_or_default();
            self.commands
                .lock()
                .expect("command queue poisoned")
                .push_back((source, command));
            return;
        }
        let dest = self
            .fed_names
            .get(&target)
            .copied()
            .or_else(|| self.registered.get(&target).map(|(id, _, _)| *id));
        match dest {
            Some(dest) => {
                let mut fwd = msg;
                fwd.dest_id = dest;
                self.node.forward(fwd);
            }
            None if !self.node.is_root => self.node.send_parent(msg),
            None => tracing::warn!(%target, "command for unknown target dropped"),
        }
    }

    fn handle_set_global(&mut self, msg: ActionMessage) {
        if self.node.is_root {
            let name = msg.name().unwrap_or_default().to_owned();
            let value = msg.strings.get(1).cloned().unwrap_or_default();
            self.globals.insert(name, value);
        } else {
            self.node.send_parent(msg);
        }
    }

    fn handle_log(&mut self, msg: ActionMessage) {
        if self.node.is_root {
            tracing::info!(
                source = %msg.source_id,
                "federation log: {}",
                msg.payload_str()
            );
        } else {
            self.node.send_parent(msg);
        }
    }

    fn handle_local_error(&mut self, msg: ActionMessage) {
        tracing::error!(
            broker = %self.node.name,
            source = %msg.source_id,
            code = msg.message_id,
            "local error: {}",
            msg.payload_str()
        );
        if let Some(info) = self.federates.get_mut(&msg.source_id) {
            info.state = ConnectionState::Errored;
        }
        if !self.node.is_root {
            self.node.send_parent(msg);
        } else if self.terminate_on_error {
            let mut abort = ActionMessage::new(Action::GlobalError);
            abort.message_id = msg.message_id;
            abort.payload = msg.payload;
            self.enter_errored(abort);
        }
    }

    /// Forced teardown: propagate, fail pending queries, stop.
    fn enter_errored(&mut self, msg: ActionMessage) {
        tracing::error!(
            broker = %self.node.name,
            code = msg.message_id,
            "federation abort: {}",
            msg.payload_str()
        );
        self.node.broadcast_down(&msg);
        self.fail_pending_queries();
        self.node.set_state(ConnectionState::Errored);
    }

    fn fail_pending_queries(&mut self) {
        let mut pending = self.pending.lock().expect("query table poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(error_json(
                ErrorKind::ConnectionFailure,
                "federation terminated",
            ));
        }
    }

    /// Graceful shutdown initiated at this broker.
    fn begin_disconnect(&mut self) {
        if self.disconnect_initiated {
            return;
        }
        self.disconnect_initiated = true;
        self.node.set_state(ConnectionState::Disconnecting);
        if self.children.values().all(|c| c.state.is_terminated()) {
            self.finish_disconnect();
        } else {
            let bye = ActionMessage::new(Action::Disconnect);
            self.node.broadcast_down(&bye);
        }
    }

    /// The parent (or an ancestor) is shutting the federation down.
    fn handle_disconnect_broadcast(&mut self) {
        if self.node.state == ConnectionState::Created {
            // Registration was refused.
            self.node.set_state(ConnectionState::Errored);
            return;
        }
        self.begin_disconnect();
    }

    fn handle_fed_disconnect(&mut self, msg: ActionMessage) {
        if !self.node.is_root {
            self.node.send_parent(msg);
            return;
        }
        let fed = msg.source_id;
        tracing::info!(broker = %self.node.name, federate = %fed, "federate finalized");
        if let Some(info) = self.federates.get_mut(&fed) {
            info.state = ConnectionState::Disconnected;
        }

        // Release everyone who was waiting on this federate.
        let fed_core = self.core_of(fed);
        let dependents: Vec<GlobalId> = self
            .dep_graph
            .neighbors_directed(fed.0, petgraph::Direction::Outgoing)
            .map(GlobalId)
            .collect();
        self.dep_graph.remove_node(fed.0);
        for dependent in dependents {
            let dep_core = self.core_of(dependent);
            let key = if dep_core == fed_core { fed } else { fed_core };
            if key == fed_core && dep_core != fed_core {
                // Another federate of the same core may still feed this
                // dependent; only drop the core-level edge when none do.
                let still_fed = self.federates.iter().any(|(other, info)| {
                    info.core == fed_core
                        && info.state == ConnectionState::Connected
                        && self.dep_graph.contains_edge(other.0, dependent.0)
                });
                if still_fed {
                    continue;
                }
                self.core_edges.remove(&(fed_core, dep_core));
            }
            let mut remove = ActionMessage::routed(Action::RemoveDependency, self.node.id, dependent);
            remove.message_id = key.0;
            self.node.forward(remove);
        }

        let ack = ActionMessage::routed(Action::DisconnectFedAck, self.node.id, fed);
        self.node.forward(ack);
    }

    /// A direct child (core or sub-broker) is leaving.
    fn handle_child_disconnect(&mut self, msg: ActionMessage) {
        let child = msg.source_id;
        let Some(route) = self.node.route_for(child) else {
            return;
        };
        if let Some(entry) = self.children.get_mut(&child) {
            entry.state = ConnectionState::Disconnected;
            tracing::info!(broker = %self.node.name, child = %entry.name, "child disconnected");
        }
        let ack = ActionMessage::routed(Action::DisconnectAck, self.node.id, child);
        self.node.send_route(route, ack);
        self.node.remove_route(child);
        self.core_times.remove(&child);

        if self.children.values().all(|c| c.state.is_terminated())
            && (self.disconnect_initiated || !self.children.is_empty())
        {
            self.finish_disconnect();
        }
    }

    fn handle_disconnect_ack(&mut self, msg: ActionMessage) {
        if msg.dest_id == self.node.id {
            self.node.set_state(ConnectionState::Disconnected);
        } else {
            self.node.forward(msg);
        }
    }

    /// All children are gone: leave the federation ourselves.
    fn finish_disconnect(&mut self) {
        if self.node.is_root {
            self.fail_pending_queries();
            self.node.set_state(ConnectionState::Disconnected);
        } else {
            let mut bye = ActionMessage::new(Action::DisconnectBroker);
            bye.source_id = self.node.id;
            self.node.send_parent(bye);
            // The DisconnectAck from the parent completes the transition.
            self.node.set_state(ConnectionState::Disconnecting);
        }
    }
}
