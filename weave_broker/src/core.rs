//! Core logic: the leaf node that hosts federates.
//!
//! A core owns its federates' handle tables, value caches and message queues,
//! runs one time coordinator per federate plus a subtree aggregator, and
//! executes the filter pipelines for endpoints it owns. Like the broker, all
//! of this is owned by a single dispatch task fed by the transports, the
//! hosted federates, and a small control channel for operations that cannot
//! travel as action messages (federate hosting, boxed filter operators).

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::{rngs::SmallRng, SeedableRng};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use weave_core::{
    protocol, Action, ActionMessage, ConnectionState, ErrorKind, FederateState, GlobalId, HandleId,
    IterationRequest, IterationResult, Time, WeaveError,
};
use weave_network::InboundSink;

use crate::fabric::{self, inbound_queues, NodeConfig, NodeState, PendingQueries};
use crate::filters::{EndpointMessage, FilterPipeline, FilterSpec, FilterStage};
use crate::shared::{FederateShared, GrantNotice, ValueState};
use crate::time_coord::{aggregate_reports, TimeCoordinator, TimeReport};

/// Core construction parameters.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub node: NodeConfig,
    pub query_timeout: Duration,
}

impl CoreConfig {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            query_timeout: Duration::from_secs(4),
        }
    }
}

/// Operations that cross from the federate's address space into the dispatch
/// loop without a wire representation.
pub(crate) enum CoreCtrl {
    HostFederate {
        shared: Arc<FederateShared>,
        reply: oneshot::Sender<Result<GlobalId, WeaveError>>,
    },
    SetFilterOperator {
        fed: GlobalId,
        handle: HandleId,
        stage: FilterStage,
    },
}

/// Installs boxed filter operators into the owning core's pipelines; the one
/// federate-facing operation that cannot travel as an action message.
#[derive(Clone)]
pub struct FilterInstaller {
    ctrl_tx: mpsc::UnboundedSender<CoreCtrl>,
}

impl FilterInstaller {
    pub fn install(&self, fed: GlobalId, handle: HandleId, stage: FilterStage) {
        let _ = self.ctrl_tx.send(CoreCtrl::SetFilterOperator { fed, handle, stage });
    }
}

impl std::fmt::Debug for FilterInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FilterInstaller")
    }
}

/// The pieces a federate needs to talk to its hosting core.
#[derive(Debug, Clone)]
pub struct FederateToken {
    pub id: GlobalId,
    pub shared: Arc<FederateShared>,
    pub sink: InboundSink,
    pub core_name: String,
    pub filters: FilterInstaller,
}

/// Handle to a running core. Clones share the same core.
#[derive(Debug, Clone)]
pub struct Core {
    name: String,
    address: String,
    sink: InboundSink,
    ctrl_tx: mpsc::UnboundedSender<CoreCtrl>,
    state_rx: watch::Receiver<ConnectionState>,
    id_rx: watch::Receiver<GlobalId>,
    pending: PendingQueries,
    sequence: Arc<AtomicI32>,
    commands: Arc<Mutex<VecDeque<(String, String)>>>,
    query_timeout: Duration,
}

impl Core {
    /// Spawn a core and register it with its broker.
    pub async fn connect(config: CoreConfig) -> Result<Core, WeaveError> {
        if config.node.broker_address.is_none() {
            return Err(WeaveError::new(
                ErrorKind::InvalidArgument,
                "a core requires a broker address",
            ));
        }

        let queues = inbound_queues();
        let sink = queues.sink.clone();

        let mut comms = fabric::spawn_comms(&config.node, sink.clone(), false).await?;
        comms
            .wait_connected(config.node.connect_timeout)
            .await
            .map_err(|err| WeaveError::connection(err.to_string()))?;
        let address = comms.address().to_owned();

        let (state_tx, state_rx) = watch::channel(ConnectionState::Created);
        let (id_tx, id_rx) = watch::channel(GlobalId::UNKNOWN);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let pending: PendingQueries = Arc::default();
        let commands: Arc<Mutex<VecDeque<(String, String)>>> = Arc::default();

        let runner = CoreRunner::new(
            &config,
            NodeState::new(config.node.name.clone(), comms, state_tx, false),
            pending.clone(),
            commands.clone(),
            id_tx,
        );
        tokio::spawn(runner.run(queues, ctrl_rx));

        let mut core = Core {
            name: config.node.name.clone(),
            address,
            sink,
            ctrl_tx,
            state_rx,
            id_rx,
            pending,
            sequence: Arc::new(AtomicI32::new(1)),
            commands,
            query_timeout: config.query_timeout,
        };

        let deadline = tokio::time::Instant::now() + config.node.connect_timeout;
        loop {
            let current_state = *core.state_rx.borrow();
            match current_state {
                ConnectionState::Connected | ConnectionState::Executing => return Ok(core),
                ConnectionState::Errored | ConnectionState::Disconnected => {
                    return Err(WeaveError::connection("core failed to connect"));
                }
                _ => {}
            }
            tokio::select! {
                changed = core.state_rx.changed() => {
                    if changed.is_err() {
                        return Err(WeaveError::connection("core task exited"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeaveError::timeout("timed out connecting core"));
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn global_id(&self) -> GlobalId {
        *self.id_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state_rx.borrow(),
            ConnectionState::Connected | ConnectionState::Executing
        )
    }

    /// Host a new federate on this core: registers it with the root and
    /// returns the pieces the federate API is built on.
    pub async fn host_federate(
        &self,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<FederateToken, WeaveError> {
        let shared = FederateShared::new(name);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ctrl_tx
            .send(CoreCtrl::HostFederate {
                shared: shared.clone(),
                reply: reply_tx,
            })
            .map_err(|_| WeaveError::connection("core has shut down"))?;

        let id = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(WeaveError::connection("core dropped the registration")),
            Err(_) => return Err(WeaveError::timeout("federate registration timed out")),
        };

        Ok(FederateToken {
            id,
            shared,
            sink: self.sink.clone(),
            core_name: self.name.clone(),
            filters: FilterInstaller {
                ctrl_tx: self.ctrl_tx.clone(),
            },
        })
    }

    /// Attach a boxed operator to a registered custom or firewall filter.
    pub fn set_filter_operator(&self, fed: GlobalId, handle: HandleId, stage: FilterStage) {
        let _ = self.ctrl_tx.send(CoreCtrl::SetFilterOperator { fed, handle, stage });
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
                json!({"error": {"code": ErrorKind::Timeout.code(), "message": "query timed out"}})
                    .to_string()
            }
        }
    }

    pub fn get_command(&self) -> Option<(String, String)> {
        self.commands
            .lock()
            .expect("command queue poisoned")
            .pop_front()
    }

    pub fn disconnect(&self) {
        self.sink.deliver(ActionMessage::new(Action::UserDisconnect));
    }

    pub fn force_terminate(&self) {
        let mut msg = ActionMessage::new(Action::GlobalError);
        msg.message_id = ErrorKind::UserAbort.code();
        msg.payload = bytes::Bytes::from_static(b"force terminate");
        self.sink.deliver(msg);
    }

    pub async fn wait_for_disconnect(&mut self, timeout: Duration) -> bool {
        fabric::wait_for_state(&mut self.state_rx, timeout).await
    }
}

/// Runner-side record of one hosted federate.
struct FedRecord {
    id: GlobalId,
    shared: Arc<FederateShared>,
    coordinator: TimeCoordinator,
    grant_seq: u64,
    /// Changed data arrived since the last executing-entry round.
    exec_new_data: bool,
    exec_requested: Option<IterationRequest>,
    init_requested: bool,
    finalized: bool,
    /// Subscribers per publication handle: `(fed, input handle, input name)`.
    subscribers: HashMap<HandleId, Vec<(GlobalId, HandleId, String)>>,
}

impl FedRecord {
    fn push_grant(&mut self, time: Time, result: IterationResult) {
        self.grant_seq += 1;
        self.shared.push_grant(GrantNotice {
            seq: self.grant_seq,
            time,
            result: Some(result),
        });
    }
}

struct EndpointFilters {
    source: FilterPipeline,
    dest: FilterPipeline,
}

struct CoreRunner {
    node: NodeState,
    terminate_on_error: bool,
    feds: BTreeMap<GlobalId, FedRecord>,
    pending_feds: HashMap<String, (Arc<FederateShared>, oneshot::Sender<Result<GlobalId, WeaveError>>)>,
    /// Endpoints owned by this core's federates, by global name.
    local_endpoints: HashMap<String, (GlobalId, HandleId)>,
    pipelines: HashMap<(GlobalId, HandleId), EndpointFilters>,
    /// Boxed operators waiting for their filter link, and links waiting for
    /// their operator.
    operators: HashMap<(GlobalId, HandleId), FilterStage>,
    pending_operator_links: HashMap<(GlobalId, HandleId), (GlobalId, HandleId, bool)>,
    rng: SmallRng,
    message_seq: u64,
    init_sent: bool,
    init_granted: bool,
    exec_sent: bool,
    exec_entered: bool,
    last_report: Option<TimeReport>,
    barrier_sequence: i32,
    disconnecting: bool,
    pending: PendingQueries,
    commands: Arc<Mutex<VecDeque<(String, String)>>>,
    id_tx: watch::Sender<GlobalId>,
}

impl CoreRunner {
    fn new(
        config: &CoreConfig,
        node: NodeState,
        pending: PendingQueries,
        commands: Arc<Mutex<VecDeque<(String, String)>>>,
        id_tx: watch::Sender<GlobalId>,
    ) -> Self {
        Self {
            node,
            terminate_on_error: config.node.terminate_on_error,
            feds: BTreeMap::new(),
            pending_feds: HashMap::new(),
            local_endpoints: HashMap::new(),
            pipelines: HashMap::new(),
            operators: HashMap::new(),
            pending_operator_links: HashMap::new(),
            rng: SmallRng::from_entropy(),
            message_seq: 0,
            init_sent: false,
            init_granted: false,
            exec_sent: false,
            exec_entered: false,
            last_report: None,
            barrier_sequence: 0,
            disconnecting: false,
            pending,
            commands,
            id_tx,
        }
    }

    #[tracing::instrument(skip_all, fields(core = %self.node.name))]
    async fn run(
        mut self,
        mut queues: fabric::InboundQueues,
        mut ctrl_rx: mpsc::UnboundedReceiver<CoreCtrl>,
    ) {
        // Register with the parent broker.
        let reg = ActionMessage::new(Action::RegCore)
            .with_string(&self.node.name)
            .with_string(self.node.comms.address());
        self.node.send_parent(reg);

        loop {
            tokio::select! {
                biased;
                msg = queues.priority_rx.recv() => match msg {
                    Some(msg) => self.process_priority(msg),
                    None => break,
                },
                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(ctrl) => self.process_ctrl(ctrl),
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
        tracing::info!(core = %self.node.name, "core loop exited");
    }

    fn process_ctrl(&mut self, ctrl: CoreCtrl) {
        match ctrl {
            CoreCtrl::HostFederate { shared, reply } => {
                let name = shared.name.clone();
                if self.init_granted {
                    let _ = reply.send(Err(WeaveError::registration(
                        "federation already initialized",
                    )));
                    return;
                }
                let mut reg = ActionMessage::new(Action::RegFed).with_string(&name);
                reg.source_id = self.node.id;
                self.pending_feds.insert(name, (shared, reply));
                self.node.send_parent(reg);
            }
            CoreCtrl::SetFilterOperator { fed, handle, stage } => {
                if let Some((ep_fed, ep_handle, dest)) =
                    self.pending_operator_links.remove(&(fed, handle))
                {
                    self.attach_stage(ep_fed, ep_handle, dest, stage);
                } else {
                    self.operators.insert((fed, handle), stage);
                }
            }
        }
    }

    fn process_priority(&mut self, msg: ActionMessage) {
        tracing::trace!(core = %self.node.name, %msg, "priority command");
        match msg.action {
            Action::Protocol => {
                if msg.message_id == protocol::DISCONNECT_ERROR {
                    tracing::warn!(core = %self.node.name, "transport fault: {}", msg.name().unwrap_or("?"));
                    if self.node.state == ConnectionState::Created {
                        self.node.set_state(ConnectionState::Errored);
                    }
                }
            }
            Action::Ping => {
                let reply = ActionMessage::routed(Action::Pong, self.node.id, msg.source_id);
                self.node.send_parent(reply);
            }
            Action::Ack => self.handle_ack(msg),
            Action::NewBrokerInformation => {
                if self.node.state == ConnectionState::Created {
                    tracing::error!(
                        core = %self.node.name,
                        "registration address rejected; restart with new connection details"
                    );
                    self.node.set_state(ConnectionState::Errored);
                }
            }
            Action::RegPub | Action::RegInput | Action::RegEndpoint | Action::RegFilter => {
                self.handle_interface(msg)
            }
            Action::AddAlias | Action::SetGlobal | Action::RegFed | Action::LocalError => {
                // Federate-originated commands for the root.
                if msg.action == Action::LocalError {
                    self.handle_local_error(&msg);
                }
                self.node.send_parent(msg);
            }
            Action::Query => self.handle_query(msg, false),
            Action::QueryReply => self.handle_query_reply(msg),
            Action::SendCommand => self.handle_command(msg),
            Action::Error => self.handle_error(msg),
            Action::GlobalError | Action::Terminate => self.enter_errored(msg),
            Action::Disconnect => self.handle_disconnect_broadcast(),
            Action::UserDisconnect => self.begin_disconnect(),
            Action::DisconnectFed => self.handle_fed_finalize(msg),
            Action::DisconnectFedAck => self.handle_fed_finalize_ack(msg),
            Action::DisconnectAck => {
                if msg.dest_id == self.node.id {
                    self.node.set_state(ConnectionState::Disconnected);
                }
            }
            _ => tracing::debug!(core = %self.node.name, %msg, "ignoring command"),
        }
    }

    fn process_ordered(&mut self, msg: ActionMessage) {
        tracing::trace!(core = %self.node.name, %msg, "ordered command");
        match msg.action {
            Action::Init => self.handle_fed_init(msg),
            Action::InitGrant => self.handle_init_grant(),
            Action::ExecRequest => self.handle_fed_exec_request(msg),
            Action::ExecGrant => self.handle_exec_grant(msg),
            Action::TimeRequest => {
                if msg.source_id.is_federate() && self.feds.contains_key(&msg.source_id) {
                    self.handle_fed_time_request(msg);
                } else {
                    self.handle_remote_report(msg);
                }
            }
            Action::PubData => self.handle_pub_data(msg),
            Action::SendMessage | Action::FilteredMessage => self.handle_send_message(msg),
            Action::AddSubscriber => self.handle_add_subscriber(msg),
            Action::AddPublisher => self.handle_add_publisher(msg),
            Action::AddFilter => self.handle_add_filter(msg),
            Action::AddDependency => {
                if let Some(rec) = self.feds.get_mut(&msg.dest_id) {
                    rec.coordinator.add_dependency(GlobalId(msg.message_id));
                }
            }
            Action::AddDependent => {
                if let Some(rec) = self.feds.get_mut(&msg.dest_id) {
                    rec.coordinator.add_dependent(GlobalId(msg.message_id));
                }
            }
            Action::RemoveDependency => {
                if let Some(rec) = self.feds.get_mut(&msg.dest_id) {
                    rec.coordinator.remove_dependency(GlobalId(msg.message_id));
                }
                self.try_grant(msg.dest_id);
                self.send_aggregate();
            }
            Action::RemoveDependent => {
                if let Some(rec) = self.feds.get_mut(&msg.dest_id) {
                    rec.coordinator.remove_dependent(GlobalId(msg.message_id));
                }
            }
            Action::SetTimeBarrier => self.handle_set_barrier(msg),
            Action::ClearTimeBarrier => self.handle_clear_barrier(msg),
            Action::QueryOrdered => self.handle_query(msg, true),
            Action::QueryReplyOrdered => self.handle_query_reply(msg),
            Action::SendCommandOrdered => self.handle_command(msg),
            Action::Log => self.node.send_parent(msg),
            _ => tracing::debug!(core = %self.node.name, %msg, "ignoring command"),
        }
    }

    fn handle_ack(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();

        if !self.node.id.is_valid() && name == self.node.name {
            self.node.id = msg.dest_id;
            let _ = self.id_tx.send(msg.dest_id);
            self.node.set_state(ConnectionState::Connected);
            tracing::info!(core = %self.node.name, id = %self.node.id, "joined federation");
            return;
        }

        if let Some((shared, reply)) = self.pending_feds.remove(&name) {
            let id = msg.dest_id;
            shared.set_registered(id);
            let props = shared.data().props;
            self.feds.insert(
                id,
                FedRecord {
                    id,
                    shared,
                    coordinator: TimeCoordinator::new(id, props),
                    grant_seq: 0,
                    exec_new_data: false,
                    exec_requested: None,
                    init_requested: false,
                    finalized: false,
                    subscribers: HashMap::new(),
                },
            );
            let _ = reply.send(Ok(id));
            tracing::info!(core = %self.node.name, federate = %name, %id, "federate joined");
        }
    }

    /// Forward a federate's interface registration upward, recording what we
    /// need locally for routing and delivery.
    fn handle_interface(&mut self, msg: ActionMessage) {
        let name = msg.name().unwrap_or_default().to_owned();
        if msg.action == Action::RegEndpoint {
            self.local_endpoints
                .insert(name, (msg.source_id, msg.source_handle));
        }
        self.node.send_parent(msg);
    }

    /// A federate entered initialization; when every hosted federate has, the
    /// core reports ready.
    fn handle_fed_init(&mut self, msg: ActionMessage) {
        if let Some(rec) = self.feds.get_mut(&msg.source_id) {
            rec.init_requested = true;
        }
        if self.init_sent {
            return;
        }
        let all_ready = !self.feds.is_empty()
            && self
                .feds
                .values()
                .all(|rec| rec.init_requested || rec.finalized);
        if all_ready {
            self.init_sent = true;
            let mut up = ActionMessage::new(Action::Init);
            up.source_id = self.node.id;
            self.node.send_parent(up);
        }
    }

    fn handle_init_grant(&mut self) {
        self.init_granted = true;
        for rec in self.feds.values_mut() {
            if !rec.finalized {
                // Pick up any properties the federate set before initializing.
                rec.coordinator.props = rec.shared.data().props;
                rec.shared.set_state(FederateState::Initializing);
            }
        }
        tracing::info!(core = %self.node.name, "initialization granted");
    }

    /// A federate asks to enter execution. Aggregated per round: the core
    /// reports once all hosted federates have asked.
    fn handle_fed_exec_request(&mut self, msg: ActionMessage) {
        let iterate = if msg.flags.iteration_requested() {
            IterationRequest::IterateIfNeeded
        } else if msg.flags.indicator() {
            IterationRequest::ForceIteration
        } else {
            IterationRequest::NoIterations
        };
        if let Some(rec) = self.feds.get_mut(&msg.source_id) {
            rec.exec_requested = Some(iterate);
        }

        if self.exec_sent {
            return;
        }
        let all_ready = self
            .feds
            .values()
            .all(|rec| rec.exec_requested.is_some() || rec.finalized);
        if !all_ready {
            return;
        }

        let iterating = self.feds.values().any(|rec| match rec.exec_requested {
            Some(IterationRequest::ForceIteration) => true,
            Some(IterationRequest::IterateIfNeeded) => rec.exec_new_data,
            _ => false,
        });

        self.exec_sent = true;
        let mut up = ActionMessage::new(Action::ExecRequest);
        up.source_id = self.node.id;
        up.flags.set_iteration_requested(iterating);
        self.node.send_parent(up);
    }

    /// The root's verdict on one executing-entry round.
    fn handle_exec_grant(&mut self, msg: ActionMessage) {
        self.exec_sent = false;
        if msg.flags.iteration_requested() {
            // Another round: every federate that asked gets an iterating
            // result and stays in initialization.
            for rec in self.feds.values_mut() {
                if rec.exec_requested.take().is_some() {
                    rec.exec_new_data = false;
                    rec.shared.set_state(FederateState::Initializing);
                    rec.push_grant(Time::ZERO, IterationResult::Iterating);
                }
            }
            return;
        }

        self.exec_entered = true;
        for rec in self.feds.values_mut() {
            if rec.exec_requested.take().is_some() || !rec.finalized {
                rec.coordinator.props = rec.shared.data().props;
                rec.coordinator.enter_executing();
                rec.shared.data().current_time = Time::ZERO;
                rec.shared.set_state(FederateState::Executing);
                rec.push_grant(Time::ZERO, IterationResult::NextStep);
            }
        }
        self.node.set_state(ConnectionState::Executing);
        tracing::info!(core = %self.node.name, "entered executing mode");
        self.send_aggregate();
    }

    /// Time request from a hosted federate.
    fn handle_fed_time_request(&mut self, msg: ActionMessage) {
        let fed = msg.source_id;
        let iterate = if msg.flags.iteration_requested() {
            IterationRequest::IterateIfNeeded
        } else if msg.flags.indicator() {
            IterationRequest::ForceIteration
        } else {
            IterationRequest::NoIterations
        };
        if let Some(rec) = self.feds.get_mut(&fed) {
            rec.coordinator.props = rec.shared.data().props;
            rec.coordinator.request_time(msg.action_time, iterate);
        }
        self.try_grant(fed);
        self.propagate_local_report(fed);
        self.send_aggregate();
    }

    /// Aggregate report from another core, fanned out by the root.
    fn handle_remote_report(&mut self, msg: ActionMessage) {
        let report = TimeReport {
            te: msg.te,
            tdemin: msg.tdemin,
            granted: msg.action_time,
            iterating: msg.flags.iteration_requested(),
        };
        let source = msg.source_id;
        let ids: Vec<GlobalId> = self.feds.keys().copied().collect();
        for fed in ids {
            if let Some(rec) = self.feds.get_mut(&fed) {
                rec.coordinator.update_dependency(source, report);
            }
            self.try_grant(fed);
        }
        self.send_aggregate();
    }

    /// Evaluate one federate's pending request against its coordinator.
    fn try_grant(&mut self, fed: GlobalId) {
        let Some(rec) = self.feds.get_mut(&fed) else {
            return;
        };
        if let Some(grant) = rec.coordinator.check_grant() {
            tracing::debug!(
                core = %self.node.name,
                federate = %fed,
                time = %grant.time,
                result = ?grant.result,
                "granting time"
            );
            {
                let mut data = rec.shared.data();
                data.current_time = grant.time;
                let next = data.next_event_after(grant.time).unwrap_or(Time::MAX_TIME);
                rec.coordinator.set_event_time(next);
            }
            rec.shared.set_state(FederateState::Executing);
            rec.push_grant(grant.time, grant.result);
            self.propagate_local_report(fed);
        }
    }

    /// Push one federate's report to co-hosted dependents.
    fn propagate_local_report(&mut self, fed: GlobalId) {
        let Some(rec) = self.feds.get(&fed) else {
            return;
        };
        let report = rec.coordinator.report();
        let targets: Vec<GlobalId> = self
            .feds
            .iter()
            .filter(|(id, other)| {
                **id != fed && other.coordinator.dependencies().any(|dep| dep == fed)
            })
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            if let Some(other) = self.feds.get_mut(&target) {
                other.coordinator.update_dependency(fed, report);
            }
            self.try_grant(target);
        }
    }

    /// Send the merged subtree report upstream when it changes.
    fn send_aggregate(&mut self) {
        if !self.exec_entered {
            return;
        }
        let reports: Vec<TimeReport> = self
            .feds
            .values()
            .filter(|rec| !rec.finalized)
            .map(|rec| rec.coordinator.report())
            .collect();
        if reports.is_empty() {
            return;
        }
        let agg = aggregate_reports(reports.iter());
        if self.last_report == Some(agg) {
            return;
        }
        self.last_report = Some(agg);

        let mut up = ActionMessage::new(Action::TimeRequest);
        up.source_id = self.node.id;
        up.te = agg.te;
        up.tdemin = agg.tdemin;
        up.action_time = agg.granted;
        up.flags.set_iteration_requested(agg.iterating);
        self.node.send_parent(up);
    }

    /// Value published by a local federate or arriving from a remote core.
    fn handle_pub_data(&mut self, msg: ActionMessage) {
        if self.feds.contains_key(&msg.source_id) && !msg.dest_id.is_valid() {
            // Local publication: fan out to every subscriber.
            let targets = self
                .feds
                .get(&msg.source_id)
                .and_then(|rec| rec.subscribers.get(&msg.source_handle))
                .cloned()
                .unwrap_or_default();
            for (sub_fed, sub_handle, _) in targets {
                if self.feds.contains_key(&sub_fed) {
                    self.deliver_value(sub_fed, sub_handle, &msg);
                } else {
                    let mut fwd = msg.clone();
                    fwd.dest_id = sub_fed;
                    fwd.dest_handle = sub_handle;
                    self.node.send_parent(fwd);
                }
            }
        } else if self.feds.contains_key(&msg.dest_id) {
            self.deliver_value(msg.dest_id, msg.dest_handle, &msg);
        } else {
            self.node.forward(msg);
        }
    }

    fn deliver_value(&mut self, fed: GlobalId, handle: HandleId, msg: &ActionMessage) {
        let Some(rec) = self.feds.get_mut(&fed) else {
            return;
        };
        let input_delay = rec.coordinator.props.input_delay;
        let arrival = msg.action_time + input_delay;
        let changed = {
            let mut data = rec.shared.data();
            let only_on_change = data
                .handles
                .get(&handle)
                .map(|h| h.flags.contains(weave_core::InterfaceFlags::ONLY_ON_CHANGE))
                .unwrap_or(false);
            let entry = data.values.entry(handle).or_insert_with(ValueState::default);
            let changed = (!entry.updated && entry.data.is_empty()) || entry.data != msg.payload;
            if only_on_change && !changed {
                return;
            }
            entry.data = msg.payload.clone();
            entry.last_update_time = arrival;
            entry.updated = true;
            if let Some(source) = msg.strings.first() {
                entry.source = source.clone();
                match entry.by_source.iter_mut().find(|(name, _)| name == source) {
                    Some((_, data)) => *data = msg.payload.clone(),
                    None => entry.by_source.push((source.clone(), msg.payload.clone())),
                }
            }
            changed
        };
        rec.exec_new_data |= changed;
        rec.coordinator.note_event(arrival, changed);
        rec.shared.arrivals.notify_waiters();
        self.try_grant(fed);
        self.propagate_local_report(fed);
        self.send_aggregate();
    }

    /// Message traffic: apply filters, deliver locally or forward for
    /// resolution.
    fn handle_send_message(&mut self, msg: ActionMessage) {
        let dest_name = msg.name().unwrap_or_default().to_owned();
        let source_name = msg.strings.get(1).cloned().unwrap_or_default();
        let mut message =
            EndpointMessage::new(source_name, dest_name, msg.action_time, msg.payload.clone());

        // Source-side filtering happens once, at the core hosting the sender.
        if msg.action == Action::SendMessage && self.feds.contains_key(&msg.source_id) {
            let key = (msg.source_id, msg.source_handle);
            if let Some(filters) = self.pipelines.get_mut(&key) {
                let output = filters.source.apply(message, &mut self.rng);
                for clone in output.clones {
                    self.dispatch_message(clone, true);
                }
                match output.message {
                    Some(filtered) => message = filtered,
                    None => return,
                }
            }
            self.dispatch_message(message, false);
            return;
        }

        // Arriving for one of our endpoints.
        self.deliver_message(msg.dest_id, msg.dest_handle, message);
    }

    /// Route a message toward its destination endpoint by name.
    fn dispatch_message(&mut self, message: EndpointMessage, filtered: bool) {
        match self.local_endpoints.get(&message.destination).copied() {
            Some((fed, handle)) => self.deliver_message(fed, handle, message),
            None => {
                let action = if filtered {
                    Action::FilteredMessage
                } else {
                    Action::SendMessage
                };
                let mut out = ActionMessage::new(action);
                out.action_time = message.time;
                out.payload = message.payload.clone();
                out.strings.push(message.destination.clone());
                out.strings.push(message.source.clone());
                out.strings.push(message.original_destination.clone());
                self.node.send_parent(out);
            }
        }
    }

    /// Run the destination pipeline and queue the message for the endpoint's
    /// federate.
    fn deliver_message(&mut self, fed: GlobalId, handle: HandleId, message: EndpointMessage) {
        let key = (fed, handle);
        let mut message = message;
        if let Some(filters) = self.pipelines.get_mut(&key) {
            let output = filters.dest.apply(message, &mut self.rng);
            for clone in output.clones {
                self.dispatch_message(clone, true);
            }
            match output.message {
                Some(filtered) => message = filtered,
                None => return,
            }
            // A destination filter may have rerouted the message away.
            if let Some(&(new_fed, new_handle)) = self.local_endpoints.get(&message.destination) {
                if (new_fed, new_handle) != key {
                    self.enqueue_message(new_fed, new_handle, message);
                    return;
                }
            } else if message.destination != message.original_destination {
                self.dispatch_message(message, true);
                return;
            }
        }
        self.enqueue_message(fed, handle, message);
    }

    fn enqueue_message(&mut self, fed: GlobalId, handle: HandleId, message: EndpointMessage) {
        let Some(rec) = self.feds.get_mut(&fed) else {
            tracing::warn!(core = %self.node.name, %fed, "message for unknown federate dropped");
            return;
        };
        let time = message.time;
        self.message_seq += 1;
        rec.shared
            .data()
            .messages
            .insert((time, self.message_seq), (handle, message));
        rec.exec_new_data = true;
        rec.coordinator.note_event(time, true);
        rec.shared.arrivals.notify_waiters();
        self.try_grant(fed);
        self.propagate_local_report(fed);
        self.send_aggregate();
    }

    fn handle_add_subscriber(&mut self, msg: ActionMessage) {
        let pub_fed = GlobalId(msg.message_id);
        let input_name = msg.name().unwrap_or_default().to_owned();
        if let Some(rec) = self.feds.get_mut(&pub_fed) {
            let subs = rec.subscribers.entry(msg.dest_handle).or_default();
            let entry = (msg.source_id, msg.source_handle, input_name);
            if !subs.contains(&entry) {
                subs.push(entry);
            }
        }
    }

    fn handle_add_publisher(&mut self, msg: ActionMessage) {
        let input_fed = GlobalId(msg.message_id);
        if let Some(rec) = self.feds.get(&input_fed) {
            let mut data = rec.shared.data();
            let entry = data
                .values
                .entry(msg.dest_handle)
                .or_insert_with(ValueState::default);
            if let Some(name) = msg.strings.first() {
                entry.source = name.clone();
            }
            if let Some(data_type) = msg.strings.get(1) {
                entry.data_type = data_type.clone();
            }
        }
    }

    fn handle_add_filter(&mut self, msg: ActionMessage) {
        let endpoint_fed = msg.dest_id;
        let endpoint_handle = msg.dest_handle;
        let dest_side = msg.flags.destination_target();
        let spec_json = msg.strings.get(2).cloned().unwrap_or_default();

        let stage = if spec_json.is_empty() {
            // Custom filter: the boxed operator may already be here, or will
            // arrive over the control channel.
            match self.operators.remove(&(msg.source_id, msg.source_handle)) {
                Some(stage) => stage,
                None => {
                    self.pending_operator_links.insert(
                        (msg.source_id, msg.source_handle),
                        (endpoint_fed, endpoint_handle, dest_side),
                    );
                    return;
                }
            }
        } else {
            match serde_json::from_str::<FilterSpec>(&spec_json) {
                Ok(spec) => FilterStage::Builtin(spec),
                Err(err) => {
                    tracing::error!(core = %self.node.name, "bad filter spec: {err}");
                    return;
                }
            }
        };
        self.attach_stage(endpoint_fed, endpoint_handle, dest_side, stage);
    }

    fn attach_stage(&mut self, fed: GlobalId, handle: HandleId, dest_side: bool, stage: FilterStage) {
        let filters = self.pipelines.entry((fed, handle)).or_insert_with(|| {
            EndpointFilters {
                source: FilterPipeline::default(),
                dest: FilterPipeline::default(),
            }
        });
        if dest_side {
            filters.dest.push(stage);
        } else {
            filters.source.push(stage);
        }
        tracing::debug!(core = %self.node.name, %fed, %handle, dest_side, "filter attached");
    }

    fn handle_set_barrier(&mut self, msg: ActionMessage) {
        if msg.message_id < self.barrier_sequence {
            return;
        }
        self.barrier_sequence = msg.message_id;
        tracing::debug!(core = %self.node.name, time = %msg.action_time, "barrier set");
        let ids: Vec<GlobalId> = self.feds.keys().copied().collect();
        for fed in ids {
            if let Some(rec) = self.feds.get_mut(&fed) {
                rec.coordinator.set_barrier(msg.action_time);
            }
            // A raised barrier can unblock a waiting request.
            self.try_grant(fed);
        }
        self.send_aggregate();
    }

    fn handle_clear_barrier(&mut self, msg: ActionMessage) {
        if msg.message_id < self.barrier_sequence {
            return;
        }
        self.barrier_sequence = msg.message_id;
        tracing::debug!(core = %self.node.name, "barrier cleared");
        let ids: Vec<GlobalId> = self.feds.keys().copied().collect();
        for fed in ids {
            if let Some(rec) = self.feds.get_mut(&fed) {
                rec.coordinator.clear_barrier();
            }
            self.try_grant(fed);
        }
        self.send_aggregate();
    }

    fn handle_query(&mut self, msg: ActionMessage, ordered: bool) {
        let target = msg.name().unwrap_or_default().to_owned();
        let query = msg.strings.get(1).cloned().unwrap_or_default();

        if target == self.node.name || target == "core" {
            let payload = self.answer_query(&query);
            self.send_query_reply(msg, payload, ordered);
            return;
        }

        // A federate hosted here, addressed by name.
        let local_fed = self
            .feds
            .values()
            .find(|rec| rec.shared.name == target)
            .map(|rec| rec.id);
        if let Some(fed) = local_fed {
            let payload = self.answer_federate_query(fed, &query);
            self.send_query_reply(msg, payload, ordered);
            return;
        }

        let mut fwd = msg;
        if !fwd.source_id.is_valid() {
            fwd.source_id = self.node.id;
        }
        self.node.send_parent(fwd);
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
        self.handle_query_reply(reply);
    }

    fn handle_query_reply(&mut self, msg: ActionMessage) {
        // Reply for the core facade.
        if msg.dest_id == self.node.id || !msg.dest_id.is_valid() {
            if let Some(tx) = self
                .pending
                .lock()
                .expect("query table poisoned")
                .remove(&msg.sequence_id)
            {
                let _ = tx.send(msg.payload_str().into_owned());
            }
            return;
        }
        // Reply for a hosted federate.
        if let Some(rec) = self.feds.get(&msg.dest_id) {
            if let Some(tx) = rec.shared.data().pending_queries.remove(&msg.sequence_id) {
                let _ = tx.send(msg.payload_str().into_owned());
            }
            return;
        }
        self.node.send_parent(msg);
    }

    fn answer_query(&self, query: &str) -> String {
        match query {
            "name" => json!(self.node.name).to_string(),
            "address" => json!(self.node.comms.address()).to_string(),
            "isinit" => json!(self.init_granted).to_string(),
            "isconnected" => json!(!self.node.state.is_terminated()).to_string(),
            "exists" => "true".to_string(),
            "version" => json!(env!("CARGO_PKG_VERSION")).to_string(),
            "current_state" | "state" => json!(format!("{:?}", self.node.state)).to_string(),
            "federates" => {
                let list: Vec<_> = self
                    .feds
                    .values()
                    .map(|rec| rec.shared.name.clone())
                    .collect();
                json!(list).to_string()
            }
            "current_time" | "global_time" => {
                let times: serde_json::Map<String, serde_json::Value> = self
                    .feds
                    .values()
                    .map(|rec| {
                        (
                            rec.shared.name.clone(),
                            json!(rec.coordinator.current_time().to_seconds()),
                        )
                    })
                    .collect();
                json!(times).to_string()
            }
            _ => json!({"error": {"code": ErrorKind::InvalidObject.code(), "message": "#invalid"}})
                .to_string(),
        }
    }

    fn answer_federate_query(&self, fed: GlobalId, query: &str) -> String {
        let Some(rec) = self.feds.get(&fed) else {
            return json!({"error": {"code": ErrorKind::InvalidObject.code(), "message": "#invalid"}})
                .to_string();
        };
        if let Some(tag) = query.strip_prefix("tag/") {
            return match rec.shared.data().tags.get(tag) {
                Some(value) => json!(value).to_string(),
                None => json!("").to_string(),
            };
        }
        match query {
            "name" => json!(rec.shared.name).to_string(),
            "exists" => "true".to_string(),
            "current_state" | "state" => json!(format!("{:?}", rec.shared.state())).to_string(),
            "current_time" => json!(rec.coordinator.current_time().to_seconds()).to_string(),
            _ => json!({"error": {"code": ErrorKind::InvalidObject.code(), "message": "#invalid"}})
                .to_string(),
        }
    }

    fn handle_command(&mut self, msg: ActionMessage) {
        let target = msg.name().unwrap_or_default().to_owned();
        let command = msg.strings.get(1).cloned().unwrap_or_default();
        let source = msg.strings.get(2).cloned().unwrap_or_default();

        if target == self.node.name || target == "core" {
            self.commands
                .lock()
                .expect("command queue poisoned")
                .push_back((source, command));
            return;
        }
        let local_fed = self
            .feds
            .values()
            .find(|rec| rec.shared.name == target || rec.id == msg.dest_id)
            .map(|rec| rec.id);
        if let Some(fed) = local_fed {
            if let Some(rec) = self.feds.get(&fed) {
                rec.shared.data().commands.push_back((source, command));
                rec.shared.arrivals.notify_waiters();
            }
            return;
        }
        self.node.send_parent(msg);
    }

    /// An error routed to this core, one of its federates, or a federate
    /// registration still in flight.
    fn handle_error(&mut self, msg: ActionMessage) {
        if let Some(rec) = self.feds.get(&msg.dest_id) {
            let kind = ErrorKind::from_code(msg.message_id);
            rec.shared
                .set_error(WeaveError::new(kind, msg.payload_str().into_owned()));
            return;
        }
        if let Some(name) = msg.name() {
            if let Some((shared, reply)) = self.pending_feds.remove(name) {
                let error = WeaveError::new(
                    ErrorKind::from_code(msg.message_id),
                    msg.payload_str().into_owned(),
                );
                shared.set_error(error.clone());
                let _ = reply.send(Err(error));
                return;
            }
        }
        tracing::error!(core = %self.node.name, "{}", msg.payload_str());
        if self.node.state == ConnectionState::Created {
            self.node.set_state(ConnectionState::Errored);
        }
    }

    fn handle_local_error(&mut self, msg: &ActionMessage) {
        let fed = msg.source_id;
        if let Some(rec) = self.feds.get_mut(&fed) {
            rec.finalized = true;
            rec.shared.set_state(FederateState::Errored);
        }
        // Stop waiting on the errored federate locally.
        let ids: Vec<GlobalId> = self.feds.keys().copied().collect();
        for other in ids {
            if other == fed {
                continue;
            }
            if let Some(rec) = self.feds.get_mut(&other) {
                rec.coordinator.remove_dependency(fed);
            }
            self.try_grant(other);
        }
        self.send_aggregate();
    }

    /// A federate's `finalize` call.
    fn handle_fed_finalize(&mut self, msg: ActionMessage) {
        let fed = msg.source_id;
        if let Some(rec) = self.feds.get_mut(&fed) {
            rec.finalized = true;
            rec.coordinator.halt();
            rec.shared.set_state(FederateState::Terminating);
        }
        // Local dependents stop waiting immediately; remote ones are released
        // by the root via RemoveDependency.
        let ids: Vec<GlobalId> = self.feds.keys().copied().collect();
        for other in ids {
            if other == fed {
                continue;
            }
            if let Some(rec) = self.feds.get_mut(&other) {
                rec.coordinator.remove_dependency(fed);
            }
            self.try_grant(other);
        }
        self.node.send_parent(msg);
        self.send_aggregate();
    }

    fn handle_fed_finalize_ack(&mut self, msg: ActionMessage) {
        if let Some(rec) = self.feds.get_mut(&msg.dest_id) {
            rec.shared.set_state(FederateState::Finished);
        }
        if !self.feds.is_empty() && self.feds.values().all(|rec| rec.finalized) {
            self.begin_disconnect();
        }
    }

    fn begin_disconnect(&mut self) {
        if self.disconnecting {
            return;
        }
        self.disconnecting = true;
        self.node.set_state(ConnectionState::Disconnecting);
        // Any federate still alive is halted.
        for rec in self.feds.values_mut() {
            if !rec.finalized {
                rec.finalized = true;
                rec.coordinator.halt();
                rec.push_grant(rec.coordinator.current_time(), IterationResult::Halted);
                rec.shared.set_state(FederateState::Finished);
            }
        }
        let mut bye = ActionMessage::new(Action::DisconnectCore);
        bye.source_id = self.node.id;
        self.node.send_parent(bye);
    }

    /// The broker tree is shutting down around us.
    fn handle_disconnect_broadcast(&mut self) {
        if self.node.state == ConnectionState::Created {
            self.node.set_state(ConnectionState::Errored);
            for (_, (shared, reply)) in self.pending_feds.drain() {
                shared.set_state(FederateState::Errored);
                let _ = reply.send(Err(WeaveError::registration("registration refused")));
            }
            return;
        }
        self.begin_disconnect();
    }

    /// Forced federation abort.
    fn enter_errored(&mut self, msg: ActionMessage) {
        tracing::error!(
            core = %self.node.name,
            code = msg.message_id,
            "federation abort: {}",
            msg.payload_str()
        );
        // Pending federate calls resolve as connection failures; the
        // original code is preserved in the message.
        let error = WeaveError::new(
            ErrorKind::ConnectionFailure,
            format!("federation terminated ({}): {}", msg.message_id, msg.payload_str()),
        );
        for rec in self.feds.values_mut() {
            rec.finalized = true;
            rec.shared.data().error = Some(error.clone());
            rec.shared.set_state(FederateState::Errored);
            rec.push_grant(rec.coordinator.current_time(), IterationResult::Error);
            rec.shared.arrivals.notify_waiters();
        }
        let mut pending = self.pending.lock().expect("query table poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(
                json!({"error": {"code": ErrorKind::ConnectionFailure.code(), "message": "federation terminated"}})
                    .to_string(),
            );
        }
        drop(pending);
        self.node.set_state(ConnectionState::Errored);
    }
}
