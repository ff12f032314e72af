//! The federate: a participant in the federation, hosted by a core in the
//! same process.
//!
//! API calls post action messages into the core's queues and block on watch
//! channels for the reply. Every blocking call is bounded by the federate's
//! timeout; expiry returns [`ErrorKind::Timeout`] and leaves the pending
//! request in place, so the matching `*_complete` call can be retried.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use weave_broker::{
    Core, EndpointMessage, FederateToken, FilterSpec, FilterStage, GrantNotice, TimeProps,
};
use weave_core::{
    Action, ActionMessage, ErrorKind, FederateState, GlobalId, HandleId, InterfaceFlags,
    InterfaceKind, IterationRequest, IterationResult, Time, WeaveError,
};

use crate::config::{ConnectionConfig, FederateConfig};
use crate::value::{AggregationMethod, Value};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

macro_rules! handle_types {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            #[repr(transparent)]
            pub struct $name(pub HandleId);
        )*
    };
}

handle_types! {
    /// A registered publication.
    PublicationHandle,
    /// A registered input.
    InputHandle,
    /// A registered endpoint.
    EndpointHandle,
    /// A registered filter.
    FilterHandle,
}

/// Time-valued federate properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeProperty {
    TimeDelta,
    Period,
    Offset,
    InputDelay,
    OutputDelay,
    RtLag,
    RtLead,
}

/// Boolean federate flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederateFlag {
    Realtime,
}

/// A federate participating in a federation.
pub struct Federate {
    token: FederateToken,
    timeout: Duration,
    state_rx: watch::Receiver<FederateState>,
    grant_rx: watch::Receiver<GrantNotice>,
    last_grant_seq: u64,
    sequence: AtomicI32,
    aggregations: HashMap<HandleId, AggregationMethod>,
    /// Wall-clock origin for real-time pacing, set at executing entry.
    exec_started: Option<tokio::time::Instant>,
}

impl std::fmt::Debug for Federate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federate")
            .field("name", &self.token.shared.name)
            .field("id", &self.token.id)
            .field("state", &self.token.shared.state())
            .finish()
    }
}

impl Federate {
    /// Create a federate hosted on `core` and register it with the root.
    pub async fn new(core: &Core, name: impl Into<String>) -> Result<Federate, WeaveError> {
        Self::with_timeout(core, name, DEFAULT_TIMEOUT).await
    }

    pub async fn with_timeout(
        core: &Core,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Federate, WeaveError> {
        let token = core.host_federate(name, timeout).await?;
        let state_rx = token.shared.state_watch();
        let grant_rx = token.shared.grant_watch();
        Ok(Federate {
            token,
            timeout,
            state_rx,
            grant_rx,
            last_grant_seq: 0,
            sequence: AtomicI32::new(1),
            aggregations: HashMap::new(),
            exec_started: None,
        })
    }

    /// Create a federate and register everything a config file declares.
    pub async fn from_config(core: &Core, config: &FederateConfig) -> Result<Federate, WeaveError> {
        let mut fed = Self::new(core, &config.name).await?;

        {
            let mut data = fed.token.shared.data();
            data.props = TimeProps {
                time_delta: config.time_delta(),
                period: Time::from_seconds(config.period),
                offset: Time::from_seconds(config.offset),
                input_delay: Time::from_seconds(config.input_delay),
                output_delay: Time::from_seconds(config.output_delay),
                max_iterations: if config.max_iterations > 0 {
                    config.max_iterations
                } else {
                    50
                },
                realtime: config.realtime,
                ..TimeProps::default()
            };
            for (key, value) in &config.tags {
                data.tags.insert(key.clone(), value.clone());
            }
        }

        for publication in &config.publications {
            fed.register_publication_full(
                &publication.name,
                &publication.data_type,
                &publication.units,
                publication.global,
            )?;
        }
        for target in &config.subscriptions {
            fed.subscribe(target)?;
        }
        for input in &config.inputs {
            let handle = fed.register_input_full(
                &input.name,
                &input.data_type,
                &input.units,
                input.global,
                input.required,
                input.only_update_on_change,
            )?;
            if !input.target.is_empty() {
                fed.add_target(handle, &input.target)?;
            }
        }
        for endpoint in &config.endpoints {
            fed.register_endpoint_full(&endpoint.name, &endpoint.data_type, endpoint.global)?;
        }
        for filter in &config.filters {
            for target in &filter.source_endpoints {
                fed.register_filter(&filter.name, &filter.operation, &filter.properties, target, false)?;
            }
            for target in &filter.dest_endpoints {
                fed.register_filter(&filter.name, &filter.operation, &filter.properties, target, true)?;
            }
        }
        for connection in &config.connections {
            fed.apply_connection(connection);
        }
        for (name, value) in &config.globals {
            fed.set_global(name, value);
        }

        Ok(fed)
    }

    pub fn name(&self) -> &str {
        &self.token.shared.name
    }

    pub fn id(&self) -> GlobalId {
        self.token.id
    }

    pub fn state(&self) -> FederateState {
        self.token.shared.state()
    }

    pub fn current_time(&self) -> Time {
        self.token.shared.data().current_time
    }

    /// The last asynchronous error reported for this federate, if any.
    pub fn last_error(&self) -> Option<WeaveError> {
        self.token.shared.data().error.clone()
    }

    fn check_error(&self) -> Result<(), WeaveError> {
        if let Some(error) = self.token.shared.data().error.clone() {
            return Err(error);
        }
        if self.state() == FederateState::Errored {
            return Err(WeaveError::new(
                ErrorKind::ConnectionFailure,
                "federate is in the errored state",
            ));
        }
        Ok(())
    }

    /// Global interface name: qualified with the federate name unless already
    /// global.
    fn qualify(&self, name: &str, global: bool) -> String {
        if global || name.contains('/') {
            name.to_owned()
        } else {
            format!("{}/{}", self.name(), name)
        }
    }

    fn require_registration_open(&self, op: &str) -> Result<(), WeaveError> {
        match self.state() {
            FederateState::Created | FederateState::Initializing => Ok(()),
            state => Err(WeaveError::invalid_call(format!(
                "{op} requires an unstarted federate, state is {state:?}"
            ))),
        }
    }

    // ---- interface registration -------------------------------------------

    /// Register a publication under its global name.
    pub fn register_publication(
        &self,
        name: &str,
        data_type: &str,
        units: &str,
    ) -> Result<PublicationHandle, WeaveError> {
        self.register_publication_full(name, data_type, units, true)
    }

    /// Register a publication qualified with this federate's name.
    pub fn register_local_publication(
        &self,
        name: &str,
        data_type: &str,
        units: &str,
    ) -> Result<PublicationHandle, WeaveError> {
        self.register_publication_full(name, data_type, units, false)
    }

    fn register_publication_full(
        &self,
        name: &str,
        data_type: &str,
        units: &str,
        global: bool,
    ) -> Result<PublicationHandle, WeaveError> {
        self.require_registration_open("register_publication")?;
        let global_name = self.qualify(name, global);
        let handle = self.allocate(
            InterfaceKind::Publication,
            &global_name,
            data_type,
            units,
            InterfaceFlags::default(),
        );

        let mut msg = ActionMessage::new(Action::RegPub);
        msg.source_id = self.token.id;
        msg.source_handle = handle;
        msg.strings = vec![global_name, data_type.to_owned(), units.to_owned()];
        self.token.sink.deliver(msg);
        Ok(PublicationHandle(handle))
    }

    pub fn register_input(
        &self,
        name: &str,
        data_type: &str,
        units: &str,
    ) -> Result<InputHandle, WeaveError> {
        self.register_input_full(name, data_type, units, false, false, false)
    }

    fn register_input_full(
        &self,
        name: &str,
        data_type: &str,
        units: &str,
        global: bool,
        required: bool,
        only_on_change: bool,
    ) -> Result<InputHandle, WeaveError> {
        self.require_registration_open("register_input")?;
        let global_name = if name.is_empty() {
            format!("_input_{}_{}", self.name(), self.token.shared.data().handles.len())
        } else {
            self.qualify(name, global)
        };
        let mut flags = InterfaceFlags::default();
        flags.set(InterfaceFlags::REQUIRED, required);
        flags.set(InterfaceFlags::ONLY_ON_CHANGE, only_on_change);
        let handle = self.allocate(InterfaceKind::Input, &global_name, data_type, units, flags);

        let mut msg = ActionMessage::new(Action::RegInput);
        msg.source_id = self.token.id;
        msg.source_handle = handle;
        if required {
            msg.flags.set_required(true);
        }
        msg.strings = vec![
            global_name,
            data_type.to_owned(),
            units.to_owned(),
            String::new(),
        ];
        self.token.sink.deliver(msg);
        Ok(InputHandle(handle))
    }

    /// Create an anonymous input subscribed to `target`.
    pub fn subscribe(&self, target: &str) -> Result<InputHandle, WeaveError> {
        let handle = self.register_input_full("", "", "", false, false, false)?;
        self.add_target(handle, target)?;
        Ok(handle)
    }

    /// Point an input at a publication by name.
    pub fn add_target(&self, input: InputHandle, target: &str) -> Result<(), WeaveError> {
        let data = self.token.shared.data();
        let local = data
            .handles
            .get(&input.0)
            .ok_or_else(|| WeaveError::new(ErrorKind::InvalidObject, "unknown input handle"))?;
        let mut msg = ActionMessage::new(Action::RegInput);
        msg.source_id = self.token.id;
        msg.source_handle = input.0;
        if local.flags.contains(InterfaceFlags::REQUIRED) {
            msg.flags.set_required(true);
        }
        msg.strings = vec![
            local.name.clone(),
            local.data_type.clone(),
            local.units.clone(),
            target.to_owned(),
        ];
        drop(data);
        self.token.sink.deliver(msg);
        Ok(())
    }

    pub fn register_endpoint(&self, name: &str, data_type: &str) -> Result<EndpointHandle, WeaveError> {
        self.register_endpoint_full(name, data_type, true)
    }

    pub fn register_local_endpoint(
        &self,
        name: &str,
        data_type: &str,
    ) -> Result<EndpointHandle, WeaveError> {
        self.register_endpoint_full(name, data_type, false)
    }

    fn register_endpoint_full(
        &self,
        name: &str,
        data_type: &str,
        global: bool,
    ) -> Result<EndpointHandle, WeaveError> {
        self.require_registration_open("register_endpoint")?;
        let global_name = self.qualify(name, global);
        let handle = self.allocate(
            InterfaceKind::Endpoint,
            &global_name,
            data_type,
            "",
            InterfaceFlags::default(),
        );

        let mut msg = ActionMessage::new(Action::RegEndpoint);
        msg.source_id = self.token.id;
        msg.source_handle = handle;
        msg.strings = vec![global_name, data_type.to_owned()];
        self.token.sink.deliver(msg);
        Ok(EndpointHandle(handle))
    }

    /// Register a built-in filter stage on a target endpoint.
    ///
    /// `operation` is one of delay, random_delay, random_drop, reroute,
    /// clone; `properties` is its argument (e.g. the delay in seconds).
    pub fn register_filter(
        &self,
        name: &str,
        operation: &str,
        properties: &str,
        target_endpoint: &str,
        dest_side: bool,
    ) -> Result<FilterHandle, WeaveError> {
        let spec = FilterSpec::parse(operation, properties).ok_or_else(|| {
            WeaveError::new(
                ErrorKind::InvalidArgument,
                format!("unrecognized filter operation '{operation}'"),
            )
        })?;
        let spec_json = serde_json::to_string(&spec)
            .map_err(|err| WeaveError::new(ErrorKind::InvalidArgument, err.to_string()))?;
        self.register_filter_raw(name, operation, target_endpoint, dest_side, spec_json)
    }

    /// Register a cloning filter delivering copies to `deliveries`.
    pub fn register_cloning_filter(
        &self,
        name: &str,
        target_endpoint: &str,
        deliveries: &[&str],
    ) -> Result<FilterHandle, WeaveError> {
        let spec = FilterSpec::Clone {
            deliveries: deliveries.iter().map(|s| s.to_string()).collect(),
        };
        let spec_json = serde_json::to_string(&spec)
            .map_err(|err| WeaveError::new(ErrorKind::InvalidArgument, err.to_string()))?;
        self.register_filter_raw(name, "clone", target_endpoint, true, spec_json)
    }

    /// Register a filter backed by a boxed operator. The operator runs in the
    /// hosting core, so the target endpoint must live on the same core.
    pub fn register_custom_filter(
        &self,
        name: &str,
        target_endpoint: &str,
        dest_side: bool,
        stage: FilterStage,
    ) -> Result<FilterHandle, WeaveError> {
        let handle =
            self.register_filter_raw(name, "custom", target_endpoint, dest_side, String::new())?;
        self.token.filters.install(self.token.id, handle.0, stage);
        Ok(handle)
    }

    fn register_filter_raw(
        &self,
        name: &str,
        operation: &str,
        target_endpoint: &str,
        dest_side: bool,
        spec_json: String,
    ) -> Result<FilterHandle, WeaveError> {
        self.require_registration_open("register_filter")?;
        let global_name = self.qualify(name, true);
        let handle = self.allocate(
            InterfaceKind::Filter,
            &global_name,
            operation,
            "",
            InterfaceFlags::default(),
        );

        let mut msg = ActionMessage::new(Action::RegFilter);
        msg.source_id = self.token.id;
        msg.source_handle = handle;
        msg.flags.set_destination_target(dest_side);
        msg.strings = vec![
            global_name,
            operation.to_owned(),
            String::new(),
            target_endpoint.to_owned(),
            spec_json,
        ];
        self.token.sink.deliver(msg);
        Ok(FilterHandle(handle))
    }

    fn allocate(
        &self,
        kind: InterfaceKind,
        name: &str,
        data_type: &str,
        units: &str,
        flags: InterfaceFlags,
    ) -> HandleId {
        self.token.shared.data().allocate_handle(weave_broker::LocalHandle {
            kind,
            name: name.to_owned(),
            data_type: data_type.to_owned(),
            units: units.to_owned(),
            flags,
        })
    }

    /// Look up one of this federate's handles by its global name.
    pub fn handle_by_name(&self, name: &str) -> Option<HandleId> {
        let data = self.token.shared.data();
        data.handles_by_name
            .get(name)
            .or_else(|| data.handles_by_name.get(&format!("{}/{name}", self.name())))
            .copied()
    }

    // ---- options and properties -------------------------------------------

    pub fn set_property(&self, property: TimeProperty, value: Time) {
        let mut data = self.token.shared.data();
        match property {
            TimeProperty::TimeDelta => data.props.time_delta = value.max(Time::EPSILON),
            TimeProperty::Period => data.props.period = value,
            TimeProperty::Offset => data.props.offset = value,
            TimeProperty::InputDelay => data.props.input_delay = value,
            TimeProperty::OutputDelay => data.props.output_delay = value,
            TimeProperty::RtLag => data.props.rt_lag = value,
            TimeProperty::RtLead => data.props.rt_lead = value,
        }
    }

    pub fn set_max_iterations(&self, limit: u16) {
        self.token.shared.data().props.max_iterations = limit;
    }

    pub fn set_flag(&self, flag: FederateFlag, value: bool) {
        match flag {
            FederateFlag::Realtime => self.token.shared.data().props.realtime = value,
        }
    }

    /// Set an interface option flag on a registered handle.
    pub fn set_handle_option(&self, handle: HandleId, option: u16, value: bool) {
        if let Some(local) = self.token.shared.data().handles.get_mut(&handle) {
            local.flags.set(option, value);
        }
    }

    /// Choose how a multi-sourced input folds its values at read time.
    pub fn set_aggregation(&mut self, input: InputHandle, method: AggregationMethod) {
        self.aggregations.insert(input.0, method);
    }

    pub fn set_tag(&self, key: &str, value: &str) {
        self.token
            .shared
            .data()
            .tags
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.token.shared.data().tags.get(key).cloned()
    }

    pub fn set_global(&self, name: &str, value: &str) {
        let mut msg = ActionMessage::new(Action::SetGlobal);
        msg.source_id = self.token.id;
        msg.strings = vec![name.to_owned(), value.to_owned()];
        self.token.sink.deliver(msg);
    }

    /// Register an alternate name that interface targets resolve through.
    pub fn add_alias(&self, alias: &str, canonical: &str) {
        let mut msg = ActionMessage::new(Action::AddAlias);
        msg.source_id = self.token.id;
        msg.strings = vec![alias.to_owned(), canonical.to_owned()];
        self.token.sink.deliver(msg);
    }

    // ---- lifecycle --------------------------------------------------------

    pub async fn enter_initializing(&mut self) -> Result<(), WeaveError> {
        self.enter_initializing_async()?;
        self.enter_initializing_complete().await
    }

    pub fn enter_initializing_async(&mut self) -> Result<(), WeaveError> {
        self.check_error()?;
        if self.state() == FederateState::PendingInit {
            return Err(WeaveError::invalid_call("initialization already pending"));
        }
        self.state()
            .require(FederateState::Created, "enter_initializing")?;
        self.token.shared.set_state(FederateState::PendingInit);
        let mut msg = ActionMessage::new(Action::Init);
        msg.source_id = self.token.id;
        self.token.sink.deliver(msg);
        Ok(())
    }

    pub async fn enter_initializing_complete(&mut self) -> Result<(), WeaveError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match *self.state_rx.borrow() {
                FederateState::Initializing => return Ok(()),
                FederateState::Errored => return Err(self.stored_error()),
                _ => {}
            }
            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return Err(WeaveError::connection("core has shut down"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeaveError::timeout("timed out entering initialization"));
                }
            }
        }
    }

    pub async fn enter_executing(
        &mut self,
        iterate: IterationRequest,
    ) -> Result<IterationResult, WeaveError> {
        self.enter_executing_async(iterate)?;
        self.enter_executing_complete().await
    }

    pub fn enter_executing_async(&mut self, iterate: IterationRequest) -> Result<(), WeaveError> {
        self.check_error()?;
        if self.state() == FederateState::PendingExec {
            return Err(WeaveError::invalid_call("executing entry already pending"));
        }
        self.state()
            .require(FederateState::Initializing, "enter_executing")?;
        self.token.shared.set_state(FederateState::PendingExec);

        let mut msg = ActionMessage::new(Action::ExecRequest);
        msg.source_id = self.token.id;
        encode_iteration(&mut msg, iterate);
        self.token.sink.deliver(msg);
        Ok(())
    }

    pub async fn enter_executing_complete(&mut self) -> Result<IterationResult, WeaveError> {
        let notice = self.await_grant().await?;
        let result = notice.result.unwrap_or(IterationResult::NextStep);
        if result == IterationResult::NextStep {
            self.exec_started = Some(tokio::time::Instant::now());
        }
        Ok(result)
    }

    /// Request an advance to `time`. Returns the granted time and whether the
    /// federate should iterate at it.
    pub async fn request_time(
        &mut self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<(Time, IterationResult), WeaveError> {
        self.request_time_async(time, iterate)?;
        self.request_time_complete().await
    }

    pub fn request_time_async(
        &mut self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<(), WeaveError> {
        self.check_error()?;
        if self.state().is_pending() {
            return Err(WeaveError::invalid_call("a time request is already pending"));
        }
        self.state()
            .require(FederateState::Executing, "request_time")?;
        self.token.shared.set_state(match iterate {
            IterationRequest::NoIterations => FederateState::PendingTime,
            _ => FederateState::PendingIterativeTime,
        });

        let mut msg = ActionMessage::new(Action::TimeRequest);
        msg.source_id = self.token.id;
        msg.action_time = time;
        msg.te = time;
        encode_iteration(&mut msg, iterate);
        self.token.sink.deliver(msg);
        Ok(())
    }

    pub async fn request_time_complete(&mut self) -> Result<(Time, IterationResult), WeaveError> {
        let notice = self.await_grant().await?;
        let result = notice.result.unwrap_or(IterationResult::NextStep);
        if result == IterationResult::Halted {
            self.token.shared.set_state(FederateState::Finished);
        }
        self.pace_realtime(notice.time).await;
        Ok((notice.time, result))
    }

    /// Advance by the federate's minimum step.
    pub async fn request_next_step(&mut self) -> Result<(Time, IterationResult), WeaveError> {
        let next = self.current_time() + self.token.shared.data().props.time_delta;
        self.request_time(next, IterationRequest::NoIterations).await
    }

    async fn await_grant(&mut self) -> Result<GrantNotice, WeaveError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            {
                let notice = *self.grant_rx.borrow();
                if notice.seq > self.last_grant_seq {
                    self.last_grant_seq = notice.seq;
                    if notice.result == Some(IterationResult::Error) {
                        return Err(self.stored_error());
                    }
                    return Ok(notice);
                }
            }
            if self.state() == FederateState::Errored {
                return Err(self.stored_error());
            }
            tokio::select! {
                changed = self.grant_rx.changed() => {
                    if changed.is_err() {
                        return Err(WeaveError::connection("core has shut down"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // The request stays pending; the caller may re-complete.
                    return Err(WeaveError::timeout("timed out waiting for a grant"));
                }
            }
        }
    }

    /// Hold the grant until the wall clock catches up, when real-time mode is
    /// on.
    async fn pace_realtime(&self, granted: Time) {
        let props = self.token.shared.data().props;
        if !props.realtime {
            return;
        }
        let Some(start) = self.exec_started else {
            return;
        };
        let Ok(sim_offset) = Duration::try_from(granted) else {
            return;
        };
        let lead = Duration::try_from(props.rt_lead).unwrap_or_default();
        let target = start + sim_offset.saturating_sub(lead);
        tokio::time::sleep_until(target).await;
    }

    fn stored_error(&self) -> WeaveError {
        self.token
            .shared
            .data()
            .error
            .clone()
            .unwrap_or_else(|| WeaveError::new(ErrorKind::ConnectionFailure, "federation failed"))
    }

    /// Finalize the federate: release peers and leave the federation.
    /// Idempotent once finished or errored.
    pub async fn finalize(&mut self) -> Result<(), WeaveError> {
        match self.state() {
            FederateState::Finished | FederateState::Errored => return Ok(()),
            FederateState::PendingFinalize => {}
            _ => {
                self.token.shared.set_state(FederateState::PendingFinalize);
                let mut msg = ActionMessage::new(Action::DisconnectFed);
                msg.source_id = self.token.id;
                self.token.sink.deliver(msg);
            }
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match *self.state_rx.borrow() {
                FederateState::Finished | FederateState::Errored => return Ok(()),
                _ => {}
            }
            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        // The core is gone; nothing further to wait on.
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeaveError::timeout("timed out finalizing"));
                }
            }
        }
    }

    /// Report a local error: this federate stops, the federation continues
    /// unless the root is configured to terminate on error.
    pub fn local_error(&self, code: i32, message: &str) {
        self.token
            .shared
            .set_error(WeaveError::new(ErrorKind::from_code(code), message));
        let mut msg = ActionMessage::new(Action::LocalError);
        msg.source_id = self.token.id;
        msg.message_id = code;
        msg.payload = Bytes::from(message.to_owned());
        self.token.sink.deliver(msg);
    }

    /// Report a federation-fatal error: every participant aborts.
    pub fn global_error(&self, code: i32, message: &str) {
        let mut msg = ActionMessage::new(Action::GlobalError);
        msg.source_id = self.token.id;
        msg.message_id = code;
        msg.payload = Bytes::from(message.to_owned());
        self.token.sink.deliver(msg);
    }

    // ---- values -----------------------------------------------------------

    /// Publish a value. The declared type is not enforced; the encoded value
    /// carries its own tag.
    pub fn publish(
        &self,
        publication: PublicationHandle,
        value: impl Into<Value>,
    ) -> Result<(), WeaveError> {
        self.check_error()?;
        let state = self.state();
        if !matches!(
            state,
            FederateState::Executing
                | FederateState::Initializing
                | FederateState::PendingExec
                | FederateState::PendingTime
                | FederateState::PendingIterativeTime
        ) {
            return Err(WeaveError::invalid_call(format!(
                "publish requires an initialized federate, state is {state:?}"
            )));
        }

        let (name, time) = {
            let data = self.token.shared.data();
            let local = data.handles.get(&publication.0).ok_or_else(|| {
                WeaveError::new(ErrorKind::InvalidObject, "unknown publication handle")
            })?;
            if local.kind != InterfaceKind::Publication {
                return Err(WeaveError::new(
                    ErrorKind::InvalidObject,
                    "handle is not a publication",
                ));
            }
            (
                local.name.clone(),
                data.current_time + data.props.output_delay,
            )
        };

        let mut msg = ActionMessage::new(Action::PubData);
        msg.source_id = self.token.id;
        msg.source_handle = publication.0;
        msg.action_time = time;
        msg.payload = value.into().encode()?;
        msg.strings.push(name);
        self.token.sink.deliver(msg);
        Ok(())
    }

    /// Read an input's current value, with the declared-type default if it
    /// was never updated. Clears the update flag.
    pub fn get_value(&self, input: InputHandle) -> Result<Value, WeaveError> {
        let mut data = self.token.shared.data();
        let declared = data
            .handles
            .get(&input.0)
            .ok_or_else(|| WeaveError::new(ErrorKind::InvalidObject, "unknown input handle"))?
            .data_type
            .clone();

        let aggregation = self
            .aggregations
            .get(&input.0)
            .copied()
            .unwrap_or_default();

        match data.values.get_mut(&input.0) {
            Some(entry) if !entry.data.is_empty() => {
                entry.updated = false;
                if aggregation == AggregationMethod::None {
                    Value::decode(&entry.data)
                } else {
                    let values = entry
                        .by_source
                        .iter()
                        .filter_map(|(_, bytes)| Value::decode(bytes).ok())
                        .collect::<Vec<_>>();
                    Ok(aggregation.apply(&values))
                }
            }
            _ => Ok(Value::default_for(&declared)),
        }
    }

    /// Whether an input has an unread update.
    pub fn is_updated(&self, input: InputHandle) -> bool {
        self.token
            .shared
            .data()
            .values
            .get(&input.0)
            .map(|entry| entry.updated)
            .unwrap_or(false)
    }

    pub fn last_update_time(&self, input: InputHandle) -> Option<Time> {
        self.token
            .shared
            .data()
            .values
            .get(&input.0)
            .filter(|entry| !entry.data.is_empty())
            .map(|entry| entry.last_update_time)
    }

    // ---- messages ---------------------------------------------------------

    /// Send a message from an endpoint to a named destination endpoint.
    /// Without an explicit time it is delivered as soon as the destination's
    /// time allows.
    pub fn send_message(
        &self,
        endpoint: EndpointHandle,
        destination: &str,
        payload: impl Into<Bytes>,
        time: Option<Time>,
    ) -> Result<(), WeaveError> {
        self.check_error()?;
        let state = self.state();
        if !matches!(
            state,
            FederateState::Executing
                | FederateState::Initializing
                | FederateState::PendingTime
                | FederateState::PendingIterativeTime
        ) {
            return Err(WeaveError::invalid_call(format!(
                "send_message requires an initialized federate, state is {state:?}"
            )));
        }

        let (source_name, current, output_delay) = {
            let data = self.token.shared.data();
            let local = data.handles.get(&endpoint.0).ok_or_else(|| {
                WeaveError::new(ErrorKind::InvalidObject, "unknown endpoint handle")
            })?;
            if local.kind != InterfaceKind::Endpoint {
                return Err(WeaveError::new(
                    ErrorKind::InvalidObject,
                    "handle is not an endpoint",
                ));
            }
            (
                local.name.clone(),
                data.current_time,
                data.props.output_delay,
            )
        };

        let at = time.unwrap_or(current + output_delay).max(current);
        let mut msg = ActionMessage::new(Action::SendMessage);
        msg.source_id = self.token.id;
        msg.source_handle = endpoint.0;
        msg.action_time = at;
        msg.payload = payload.into();
        msg.strings.push(destination.to_owned());
        msg.strings.push(source_name);
        self.token.sink.deliver(msg);
        Ok(())
    }

    /// Pop the earliest readable message across all endpoints.
    pub fn get_message(&self) -> Option<EndpointMessage> {
        let mut data = self.token.shared.data();
        let now = data.current_time;
        data.pop_message(now, None)
    }

    /// Pop the earliest readable message for one endpoint.
    pub fn get_message_for(&self, endpoint: EndpointHandle) -> Option<EndpointMessage> {
        let mut data = self.token.shared.data();
        let now = data.current_time;
        data.pop_message(now, Some(endpoint.0))
    }

    pub fn has_message(&self) -> bool {
        let data = self.token.shared.data();
        data.pending_messages(data.current_time) > 0
    }

    // ---- queries and commands ---------------------------------------------

    /// Fast-channel query: answered as soon as the target sees it.
    pub async fn query(&self, target: &str, query: &str) -> String {
        self.query_impl(target, query, Action::Query).await
    }

    /// Ordered-channel query: answered after all prior ordered traffic.
    pub async fn query_ordered(&self, target: &str, query: &str) -> String {
        self.query_impl(target, query, Action::QueryOrdered).await
    }

    async fn query_impl(&self, target: &str, query: &str, action: Action) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.token
            .shared
            .data()
            .pending_queries
            .insert(sequence, tx);

        let mut msg = ActionMessage::new(action);
        msg.source_id = self.token.id;
        msg.sequence_id = sequence;
        msg.strings = vec![target.to_owned(), query.to_owned()];
        self.token.sink.deliver(msg);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.token.shared.data().pending_queries.remove(&sequence);
                serde_json::json!({
                    "error": {"code": ErrorKind::Timeout.code(), "message": "query timed out"}
                })
                .to_string()
            }
        }
    }

    /// Send a free-form command string to a named participant.
    pub fn send_command(&self, target: &str, command: &str) {
        let mut msg = ActionMessage::new(Action::SendCommand);
        msg.source_id = self.token.id;
        msg.strings = vec![
            target.to_owned(),
            command.to_owned(),
            self.name().to_owned(),
        ];
        self.token.sink.deliver(msg);
    }

    /// Pop the next queued command without blocking.
    pub fn get_command(&self) -> Option<(String, String)> {
        self.token.shared.data().commands.pop_front()
    }

    /// Block until a command arrives.
    pub async fn wait_command(&self) -> Result<(String, String), WeaveError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let notified = self.token.shared.arrivals.notified();
            if let Some(command) = self.token.shared.data().commands.pop_front() {
                return Ok(command);
            }
            self.check_error()?;
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeaveError::timeout("timed out waiting for a command"));
                }
            }
        }
    }

    /// Forward a log line to the root broker's sink.
    pub fn log(&self, message: &str) {
        let mut msg = ActionMessage::new(Action::Log);
        msg.source_id = self.token.id;
        msg.payload = Bytes::from(message.to_owned());
        self.token.sink.deliver(msg);
    }

    fn apply_connection(&self, connection: &ConnectionConfig) {
        let pairs: Vec<(String, String)> = match connection {
            ConnectionConfig::Pair([publication, input]) => {
                vec![(publication.clone(), input.clone())]
            }
            ConnectionConfig::Targets {
                publication,
                targets,
            } => targets
                .iter()
                .map(|t| (publication.clone(), t.clone()))
                .collect(),
        };
        for (publication, input) in pairs {
            // Only connections terminating at this federate's own inputs can
            // be applied here; the rest belong in the target federate's
            // configuration.
            match self.handle_by_name(&input) {
                Some(handle) => {
                    let _ = self.add_target(InputHandle(handle), &publication);
                }
                None => {
                    tracing::warn!(
                        federate = %self.name(),
                        %input,
                        "connection references an input not owned by this federate"
                    );
                }
            }
        }
    }
}

fn encode_iteration(msg: &mut ActionMessage, iterate: IterationRequest) {
    match iterate {
        IterationRequest::NoIterations => {}
        IterationRequest::IterateIfNeeded => msg.flags.set_iteration_requested(true),
        IterationRequest::ForceIteration => msg.flags.set_indicator(true),
    }
}
