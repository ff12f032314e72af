//! TCP transport.
//!
//! Every link is a framed stream of length-prefixed action messages. A node
//! with children runs a listener; the first frame on any accepted connection
//! is a `Protocol{CONNECTION_REQUEST}` carrying the peer's name, answered with
//! `CONNECTION_ACK`. Accepted connections are bidirectional, so a leaf can run
//! in single-socket mode: it dials its parent once and sends and receives on
//! that one link. Such a peer advertises the address `"@<name>"`, which the
//! parent resolves through its table of accepted connections.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Framed;

use crate::{
    CommsError, CommsHandle, CommsStatus, ControlCommand, InboundSink, CONNECT_RETRY_INTERVAL,
};
use weave_core::{protocol, Action, ActionCodec, ActionMessage, GlobalId, RouteId};

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Name announced in the connection handshake.
    pub name: String,
    pub local_interface: String,
    /// Listener port; 0 picks an ephemeral port. Ignored without
    /// `server_mode`.
    pub port: u16,
    /// Whether to accept inbound connections (brokers and mid-tree nodes).
    pub server_mode: bool,
    /// Parent address ("host:port"), if this node has a parent.
    pub broker_address: Option<String>,
    pub connect_timeout: Duration,
    /// First port handed out in reply to a `REQUEST_PORTS` negotiation.
    pub port_base: u16,
}

impl TcpConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_interface: "127.0.0.1".into(),
            port: 0,
            server_mode: false,
            broker_address: None,
            connect_timeout: crate::DEFAULT_CONNECT_TIMEOUT,
            port_base: 24_160,
        }
    }
}

type PeerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ActionMessage>>>>;

/// Spawn the TCP driver. If `server_mode` is set the listener is bound before
/// this returns, so the advertised address is final.
pub async fn spawn(config: TcpConfig, sink: InboundSink) -> Result<CommsHandle, CommsError> {
    let accepted: PeerMap = Arc::default();

    let (listener, address) = if config.server_mode {
        let bind_addr = format!("{}:{}", config.local_interface, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| CommsError::ConnectionFailure(format!("bind {bind_addr}: {err}")))?;
        let address = listener.local_addr()?.to_string();
        (Some(listener), address)
    } else {
        // Reachable only over the link to the parent.
        (None, format!("@{}", config.name))
    };

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(CommsStatus::Created);

    let accept_task = listener.map(|listener| {
        tokio::spawn(accept_loop(
            listener,
            sink.clone(),
            accepted.clone(),
            AtomicU16::new(config.port_base),
        ))
    });

    let driver = Driver {
        config,
        sink,
        accepted,
        routes: HashMap::new(),
        dialed: HashMap::new(),
        parent: None,
        accept_task,
    };
    tokio::spawn(driver.run(control_rx, status_tx));

    Ok(CommsHandle::new(control_tx, status_rx, address))
}

struct Driver {
    config: TcpConfig,
    sink: InboundSink,
    accepted: PeerMap,
    /// Installed routes: id to address string.
    routes: HashMap<RouteId, String>,
    /// Writer channels for addresses this node dialed itself.
    dialed: HashMap<String, mpsc::UnboundedSender<ActionMessage>>,
    parent: Option<mpsc::UnboundedSender<ActionMessage>>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlCommand>,
        status_tx: watch::Sender<CommsStatus>,
    ) {
        if let Some(addr) = self.config.broker_address.clone() {
            let (tx, ready) = dial(
                addr.clone(),
                self.config.name.clone(),
                self.sink.clone(),
                self.config.connect_timeout,
            );
            match ready.await {
                Ok(Ok(())) => self.parent = Some(tx),
                Ok(Err(err)) => {
                    tracing::error!(name = %self.config.name, %addr, "failed to reach parent: {err}");
                    self.sink
                        .deliver_error(GlobalId::UNKNOWN, format!("cannot reach parent at {addr}"));
                    let _ = status_tx.send(CommsStatus::Errored);
                    self.shutdown();
                    return;
                }
                Err(_) => {
                    tracing::error!(name = %self.config.name, %addr, "dial task dropped before handshake");
                    let _ = status_tx.send(CommsStatus::Errored);
                    self.shutdown();
                    return;
                }
            }
        }
        let _ = status_tx.send(CommsStatus::Connected);

        while let Some(cmd) = control_rx.recv().await {
            match cmd {
                ControlCommand::NewRoute(route, address) => {
                    if !address.starts_with('@') && !self.dialed.contains_key(&address) {
                        let (tx, _ready) = dial(
                            address.clone(),
                            self.config.name.clone(),
                            self.sink.clone(),
                            self.config.connect_timeout,
                        );
                        self.dialed.insert(address.clone(), tx);
                    }
                    self.routes.insert(route, address);
                }
                ControlCommand::RemoveRoute(route) => {
                    if let Some(address) = self.routes.remove(&route) {
                        // Keep the dialed link if another route still uses it.
                        if !self.routes.values().any(|a| *a == address) {
                            self.dialed.remove(&address);
                        }
                    }
                }
                ControlCommand::Send(route, msg) => self.send(route, msg),
                ControlCommand::Disconnect => break,
            }
        }

        self.shutdown();
        let _ = status_tx.send(CommsStatus::Terminated);
    }

    fn send(&mut self, route: RouteId, msg: ActionMessage) {
        if route == RouteId::CONTROL {
            self.sink.deliver(msg);
            return;
        }

        let target = if route == RouteId::PARENT {
            self.parent.clone()
        } else if let Some(address) = self.routes.get(&route) {
            self.resolve(address)
        } else {
            self.parent.clone()
        };

        match target {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::warn!(name = %self.config.name, %route, "peer connection closed");
                }
            }
            None => {
                tracing::warn!(name = %self.config.name, %route, "dropping message on unknown route");
            }
        }
    }

    fn resolve(&self, address: &str) -> Option<mpsc::UnboundedSender<ActionMessage>> {
        if let Some(peer) = address.strip_prefix('@') {
            self.accepted
                .lock()
                .expect("peer table poisoned")
                .get(peer)
                .cloned()
        } else {
            self.dialed.get(address).cloned()
        }
    }

    /// Close the receive side before the transmit side: stop accepting and
    /// let in-flight writer channels drain as they drop.
    fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.accepted.lock().expect("peer table poisoned").clear();
        self.dialed.clear();
        self.parent = None;
    }
}

async fn accept_loop(
    listener: TcpListener,
    sink: InboundSink,
    accepted: PeerMap,
    next_port: AtomicU16,
) {
    let next_port = Arc::new(next_port);
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                tracing::debug!(?addr, "accepted connection");
                tokio::spawn(handle_peer(
                    socket,
                    sink.clone(),
                    accepted.clone(),
                    next_port.clone(),
                ));
            }
            Err(err) => {
                tracing::error!("accept failed: {err}");
                sink.deliver_error(GlobalId::UNKNOWN, format!("accept failed: {err}"));
                return;
            }
        }
    }
}

/// Run the server side of one accepted connection: handshake, register the
/// writer half under the announced peer name, then pump inbound frames.
async fn handle_peer(
    socket: TcpStream,
    sink: InboundSink,
    accepted: PeerMap,
    next_port: Arc<AtomicU16>,
) {
    let mut framed = Framed::new(socket, ActionCodec::new());

    let first = match framed.next().await {
        Some(Ok(msg)) => msg,
        other => {
            tracing::warn!("connection closed before handshake: {other:?}");
            return;
        }
    };

    if first.action != Action::Protocol {
        tracing::warn!(action = ?first.action, "expected a protocol handshake; closing");
        let _ = framed.close().await;
        return;
    }

    let peer_name = match first.message_id {
        protocol::CONNECTION_REQUEST => first.name().unwrap_or_default().to_owned(),
        protocol::REQUEST_PORTS => {
            // Port negotiation: hand out the next port in the configured block.
            let mut reply = ActionMessage::new(Action::Protocol);
            reply.message_id = protocol::PORT_DEFINITIONS;
            reply.sequence_id = i32::from(next_port.fetch_add(1, Ordering::Relaxed));
            if framed.send(reply).await.is_err() {
                return;
            }
            first.name().unwrap_or_default().to_owned()
        }
        other => {
            tracing::warn!(message_id = other, "unrecognized handshake operation");
            let _ = framed.close().await;
            return;
        }
    };

    let mut ack = ActionMessage::new(Action::Protocol);
    ack.message_id = protocol::CONNECTION_ACK;
    if framed.send(ack).await.is_err() {
        tracing::warn!(peer = %peer_name, "failed to acknowledge connection");
        return;
    }

    let (frame_sink, mut frame_stream) = framed.split();

    // Writer half: everything routed at this peer goes through one channel so
    // per-route ordering is the enqueue ordering.
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(UnboundedReceiverStream::new(rx).map(Ok).forward(frame_sink));
    accepted
        .lock()
        .expect("peer table poisoned")
        .insert(peer_name.clone(), tx);

    while let Some(res) = frame_stream.next().await {
        match res {
            Ok(msg) => {
                if !sink.deliver(msg) {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(peer = %peer_name, "decode error on peer link: {err}");
                break;
            }
        }
    }

    tracing::debug!(peer = %peer_name, "peer link closed");
    accepted.lock().expect("peer table poisoned").remove(&peer_name);
}

/// Dial `address`, handshake, and return a writer channel immediately. Frames
/// queued before the link is up are flushed in order once it is. The oneshot
/// resolves when the handshake completes or the retry schedule is exhausted.
fn dial(
    address: String,
    local_name: String,
    sink: InboundSink,
    connect_timeout: Duration,
) -> (
    mpsc::UnboundedSender<ActionMessage>,
    oneshot::Receiver<Result<(), CommsError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(&address).await {
                Ok(stream) => break stream,
                Err(err) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!(%address, "connect attempt failed, retrying: {err}");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(CommsError::ConnectionFailure(format!(
                        "connect {address}: {err}"
                    ))));
                    return;
                }
            }
        };

        let mut framed = Framed::new(stream, ActionCodec::new());
        let mut request = ActionMessage::new(Action::Protocol);
        request.message_id = protocol::CONNECTION_REQUEST;
        request.strings.push(local_name.clone());
        if let Err(err) = framed.send(request).await {
            let _ = ready_tx.send(Err(err.into()));
            return;
        }
        match framed.next().await {
            Some(Ok(msg))
                if msg.action == Action::Protocol
                    && msg.message_id == protocol::CONNECTION_ACK => {}
            other => {
                let _ = ready_tx.send(Err(CommsError::ConnectionFailure(format!(
                    "unexpected handshake reply: {other:?}"
                ))));
                return;
            }
        }
        let _ = ready_tx.send(Ok(()));

        let (frame_sink, mut frame_stream) = framed.split();
        tokio::spawn(UnboundedReceiverStream::new(rx).map(Ok).forward(frame_sink));

        // The dialed link is bidirectional: replies for single-socket peers
        // come back here.
        while let Some(res) = frame_stream.next().await {
            match res {
                Ok(msg) => {
                    if !sink.deliver(msg) {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(%address, "decode error on dialed link: {err}");
                    sink.deliver_error(GlobalId::UNKNOWN, format!("link to {address} failed"));
                    break;
                }
            }
        }
    });

    (tx, ready_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn sink() -> (
        InboundSink,
        mpsc::UnboundedReceiver<ActionMessage>,
        mpsc::UnboundedReceiver<ActionMessage>,
    ) {
        let (ptx, prx) = unbounded_channel();
        let (otx, orx) = unbounded_channel();
        (InboundSink::new(ptx, otx), prx, orx)
    }

    #[test_log::test(tokio::test)]
    async fn single_socket_roundtrip() {
        let (server_sink, mut server_priority, _so) = sink();
        let (client_sink, _cp, mut client_ordered) = sink();

        let mut server_cfg = TcpConfig::new("server");
        server_cfg.server_mode = true;
        let server = spawn(server_cfg, server_sink).await.unwrap();

        let mut client_cfg = TcpConfig::new("leaf");
        client_cfg.broker_address = Some(server.address().to_owned());
        let mut client = spawn(client_cfg, client_sink).await.unwrap();
        client.wait_connected(Duration::from_secs(2)).await.unwrap();

        // Leaf registers upstream over its single socket.
        let mut reg = ActionMessage::new(Action::RegCore);
        reg.strings.push("leaf".into());
        reg.strings.push("@leaf".into());
        client.transmit(RouteId::PARENT, reg.clone()).unwrap();

        let got = server_priority.recv().await.unwrap();
        assert_eq!(got.action, Action::RegCore);

        // Server installs a route back to the leaf via its accepted link.
        server.add_route(RouteId(3), "@leaf").unwrap();
        let grant = ActionMessage::new(Action::TimeGrant);
        server.transmit(RouteId(3), grant.clone()).unwrap();

        let got = client_ordered.recv().await.unwrap();
        assert_eq!(got.action, Action::TimeGrant);

        client.disconnect();
        assert!(client.join(Duration::from_secs(1)).await);
        server.disconnect();
    }

    #[test_log::test(tokio::test)]
    async fn dial_fails_within_bounded_schedule() {
        let (s, _p, _o) = sink();
        let mut cfg = TcpConfig::new("orphan");
        cfg.broker_address = Some("127.0.0.1:1".into());
        cfg.connect_timeout = Duration::from_millis(200);
        let mut handle = spawn(cfg, s).await.unwrap();
        assert!(handle.wait_connected(Duration::from_secs(2)).await.is_err());
    }
}
