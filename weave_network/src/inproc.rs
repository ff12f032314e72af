//! In-process transport: routes resolve through a process-scoped registry of
//! node names, and delivery is a direct channel send into the destination's
//! inbound queues.
//!
//! The registry is an explicit object handed to every participant at
//! construction (there is no global), so a test can run several federations
//! side by side and destruction is deterministic.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, watch};

use crate::{
    CommsError, CommsHandle, CommsStatus, ControlCommand, InboundSink, CONNECT_RETRY_INTERVAL,
};
use weave_core::RouteId;

/// Process-scoped name table for in-process federations.
#[derive(Debug, Default)]
pub struct CommsRegistry {
    nodes: Mutex<HashMap<String, InboundSink>>,
}

impl CommsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `name`. Fails if another node already holds it.
    pub fn register(&self, name: &str, sink: InboundSink) -> Result<(), CommsError> {
        let mut nodes = self.nodes.lock().expect("comms registry poisoned");
        if nodes.contains_key(name) {
            return Err(CommsError::ConnectionFailure(format!(
                "node name '{name}' already registered"
            )));
        }
        nodes.insert(name.to_owned(), sink);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<InboundSink> {
        self.nodes
            .lock()
            .expect("comms registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) {
        self.nodes
            .lock()
            .expect("comms registry poisoned")
            .remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct InProcConfig {
    /// Name this node is reachable at inside the registry.
    pub name: String,
    /// Registry name of the parent, if any.
    pub broker_address: Option<String>,
    /// Bound on the parent-resolution retry schedule.
    pub connect_timeout: std::time::Duration,
}

/// Spawn an in-process transport driver. The node is visible in the registry
/// from the moment this returns, so registration messages sent upstream can
/// already be answered.
pub fn spawn(
    config: InProcConfig,
    registry: Arc<CommsRegistry>,
    sink: InboundSink,
) -> Result<CommsHandle, CommsError> {
    registry.register(&config.name, sink.clone())?;

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(CommsStatus::Created);
    let address = config.name.clone();

    let driver = Driver {
        config,
        registry,
        sink,
        routes: HashMap::new(),
        parent: None,
    };
    tokio::spawn(driver.run(control_rx, status_tx));

    Ok(CommsHandle::new(control_tx, status_rx, address))
}

struct Driver {
    config: InProcConfig,
    registry: Arc<CommsRegistry>,
    sink: InboundSink,
    /// Installed routes: route id to registry name.
    routes: HashMap<RouteId, String>,
    parent: Option<InboundSink>,
}

impl Driver {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlCommand>,
        status_tx: watch::Sender<CommsStatus>,
    ) {
        if let Err(err) = self.resolve_parent().await {
            tracing::error!(name = %self.config.name, "in-proc connect failed: {err}");
            self.sink
                .deliver_error(weave_core::GlobalId::UNKNOWN, err.to_string());
            let _ = status_tx.send(CommsStatus::Errored);
            self.registry.remove(&self.config.name);
            return;
        }
        let _ = status_tx.send(CommsStatus::Connected);

        while let Some(cmd) = control_rx.recv().await {
            match cmd {
                ControlCommand::NewRoute(route, address) => {
                    self.routes.insert(route, address);
                }
                ControlCommand::RemoveRoute(route) => {
                    self.routes.remove(&route);
                }
                ControlCommand::Send(route, msg) => self.send(route, msg),
                ControlCommand::Disconnect => break,
            }
        }

        self.registry.remove(&self.config.name);
        let _ = status_tx.send(CommsStatus::Terminated);
    }

    /// The parent may register after us; retry until the connect window closes.
    async fn resolve_parent(&mut self) -> Result<(), CommsError> {
        let Some(parent_name) = self.config.broker_address.clone() else {
            return Ok(());
        };
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            if let Some(sink) = self.registry.lookup(&parent_name) {
                self.parent = Some(sink);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CommsError::ConnectionFailure(format!(
                    "parent '{parent_name}' not found in registry"
                )));
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    fn send(&mut self, route: RouteId, msg: weave_core::ActionMessage) {
        let target = match route {
            RouteId::CONTROL => Some(self.sink.clone()),
            RouteId::PARENT => self.parent.clone(),
            _ => match self.routes.get(&route) {
                Some(name) => {
                    let resolved = self.registry.lookup(name);
                    if resolved.is_none() {
                        tracing::warn!(
                            name = %self.config.name,
                            %route,
                            target = %name,
                            "route target vanished from registry"
                        );
                    }
                    resolved
                }
                // Unknown route: the parent is the default path if we have one.
                None => self.parent.clone(),
            },
        };

        match target {
            Some(sink) => {
                if !sink.deliver(msg) {
                    tracing::warn!(name = %self.config.name, %route, "destination queues closed");
                }
            }
            None => {
                tracing::warn!(name = %self.config.name, %route, "dropping message on unknown route");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::{Action, ActionMessage};

    fn sink() -> (
        InboundSink,
        mpsc::UnboundedReceiver<ActionMessage>,
        mpsc::UnboundedReceiver<ActionMessage>,
    ) {
        let (ptx, prx) = mpsc::unbounded_channel();
        let (otx, orx) = mpsc::unbounded_channel();
        (InboundSink::new(ptx, otx), prx, orx)
    }

    #[test_log::test(tokio::test)]
    async fn delivers_by_channel_class() {
        let registry = CommsRegistry::new();
        let (broker_sink, mut broker_priority, mut broker_ordered) = sink();
        let (core_sink, _p, _o) = sink();

        let _broker = spawn(
            InProcConfig {
                name: "brk".into(),
                broker_address: None,
                connect_timeout: std::time::Duration::from_secs(1),
            },
            registry.clone(),
            broker_sink,
        )
        .unwrap();

        let mut core = spawn(
            InProcConfig {
                name: "core0".into(),
                broker_address: Some("brk".into()),
                connect_timeout: std::time::Duration::from_secs(1),
            },
            registry.clone(),
            core_sink,
        )
        .unwrap();
        core.wait_connected(std::time::Duration::from_secs(1))
            .await
            .unwrap();

        core.transmit(RouteId::PARENT, ActionMessage::new(Action::RegCore))
            .unwrap();
        core.transmit(RouteId::PARENT, ActionMessage::new(Action::TimeRequest))
            .unwrap();

        let reg = broker_priority.recv().await.unwrap();
        assert_eq!(reg.action, Action::RegCore);
        let req = broker_ordered.recv().await.unwrap();
        assert_eq!(req.action, Action::TimeRequest);
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_names_are_refused() {
        let registry = CommsRegistry::new();
        let (a, _pa, _oa) = sink();
        let (b, _pb, _ob) = sink();
        let cfg = InProcConfig {
            name: "dup".into(),
            broker_address: None,
            connect_timeout: std::time::Duration::from_millis(100),
        };
        spawn(cfg.clone(), registry.clone(), a).unwrap();
        assert!(spawn(cfg, registry, b).is_err());
    }
}
