//! State shared between a core's dispatch loop and the federates it hosts.
//!
//! A federate lives in the same address space as its core. Its API calls post
//! action messages into the core's queues; results come back through this
//! structure: a state watch, a grant watch, and a mutex-guarded snapshot of
//! values, messages and commands. The dispatch loop is the only writer of the
//! snapshot except for handle allocation and property updates, which the
//! federate performs directly before blocking calls.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use tokio::sync::{watch, Notify};

use weave_core::{
    FederateState, GlobalId, HandleId, InterfaceFlags, InterfaceKind, IterationResult, Time,
    WeaveError,
};

use crate::filters::EndpointMessage;
use crate::time_coord::TimeProps;

/// A granted transition delivered to a blocked federate call. `seq` strictly
/// increases so the API can tell a fresh grant from a stale one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GrantNotice {
    pub seq: u64,
    pub time: Time,
    pub result: Option<IterationResult>,
}

/// The latest value seen by one input handle.
#[derive(Debug, Default, Clone)]
pub struct ValueState {
    pub data: Bytes,
    /// Publication time plus the federate's input delay.
    pub last_update_time: Time,
    /// Set on delivery, cleared when the federate reads.
    pub updated: bool,
    pub source: String,
    pub data_type: String,
    /// Latest value per source, for multi-connection inputs aggregated at
    /// read time.
    pub by_source: Vec<(String, Bytes)>,
}

/// A federate-local interface record.
#[derive(Debug, Clone)]
pub struct LocalHandle {
    pub kind: InterfaceKind,
    pub name: String,
    pub data_type: String,
    pub units: String,
    pub flags: InterfaceFlags,
}

/// Mutable federate data guarded by one lock.
#[derive(Debug, Default)]
pub struct FedData {
    pub props: TimeProps,
    pub current_time: Time,
    pub values: HashMap<HandleId, ValueState>,
    /// Messages queued for this federate's endpoints, ordered by delivery
    /// time then arrival.
    pub messages: BTreeMap<(Time, u64), (HandleId, EndpointMessage)>,
    pub commands: VecDeque<(String, String)>,
    pub pending_queries: HashMap<i32, tokio::sync::oneshot::Sender<String>>,
    pub tags: HashMap<String, String>,
    pub error: Option<WeaveError>,
    pub handles: HashMap<HandleId, LocalHandle>,
    pub handles_by_name: HashMap<String, HandleId>,
    next_handle: i32,
}

impl FedData {
    /// Allocate the next federate-local handle index.
    pub fn allocate_handle(&mut self, handle: LocalHandle) -> HandleId {
        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        self.handles_by_name.insert(handle.name.clone(), id);
        self.handles.insert(id, handle);
        id
    }

    /// The earliest queued message time, if any.
    pub fn next_message_time(&self) -> Option<Time> {
        self.messages.keys().next().map(|(time, _)| *time)
    }

    /// The earliest queued message strictly after `t`; messages at or before
    /// `t` are already readable.
    pub fn next_event_after(&self, t: Time) -> Option<Time> {
        self.messages
            .keys()
            .map(|(time, _)| *time)
            .find(|time| *time > t)
    }

    /// Pop the earliest message at or before `now`, optionally restricted to
    /// one endpoint.
    pub fn pop_message(&mut self, now: Time, endpoint: Option<HandleId>) -> Option<EndpointMessage> {
        let key = self
            .messages
            .iter()
            .find(|((time, _), (handle, _))| {
                *time <= now && endpoint.map(|e| e == *handle).unwrap_or(true)
            })
            .map(|(key, _)| *key)?;
        self.messages.remove(&key).map(|(_, msg)| msg)
    }

    /// Count of readable messages at or before `now`.
    pub fn pending_messages(&self, now: Time) -> usize {
        self.messages.keys().filter(|(time, _)| *time <= now).count()
    }
}

/// The shared half of a hosted federate.
#[derive(Debug)]
pub struct FederateShared {
    pub name: String,
    state_tx: watch::Sender<FederateState>,
    grant_tx: watch::Sender<GrantNotice>,
    registered_tx: watch::Sender<Option<GlobalId>>,
    data: Mutex<FedData>,
    /// Pinged on message/command arrival for `wait_command`-style blocking.
    pub arrivals: Notify,
}

impl FederateShared {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(FederateState::Created);
        let (grant_tx, _) = watch::channel(GrantNotice::default());
        let (registered_tx, _) = watch::channel(None);
        Arc::new(Self {
            name: name.into(),
            state_tx,
            grant_tx,
            registered_tx,
            data: Mutex::new(FedData::default()),
            arrivals: Notify::new(),
        })
    }

    pub fn state(&self) -> FederateState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<FederateState> {
        self.state_tx.subscribe()
    }

    pub fn grant_watch(&self) -> watch::Receiver<GrantNotice> {
        self.grant_tx.subscribe()
    }

    pub fn registered_watch(&self) -> watch::Receiver<Option<GlobalId>> {
        self.registered_tx.subscribe()
    }

    pub fn data(&self) -> MutexGuard<'_, FedData> {
        self.data.lock().expect("federate data poisoned")
    }

    /// Transition the federate's observable state. Called by the dispatch
    /// loop and by the federate API when entering pending states.
    pub fn set_state(&self, state: FederateState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn set_registered(&self, id: GlobalId) {
        self.registered_tx.send_replace(Some(id));
    }

    pub(crate) fn push_grant(&self, notice: GrantNotice) {
        self.grant_tx.send_replace(notice);
    }

    /// Store an asynchronous error and surface it through the state watch.
    pub fn set_error(&self, error: WeaveError) {
        self.data().error = Some(error);
        self.set_state(FederateState::Errored);
        self.arrivals.notify_waiters();
    }
}
