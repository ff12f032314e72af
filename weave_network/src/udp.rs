//! UDP transport.
//!
//! One socket per node; each datagram is exactly one encoded action message
//! with no stream prefix. Frames larger than the configured MTU are rejected
//! at transmit time and reported back to the owning node; nothing is silently
//! truncated or dropped on size grounds.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};

use crate::{CommsError, CommsHandle, CommsStatus, ControlCommand, InboundSink};
use weave_core::{codec, GlobalId, RouteId};

/// Largest payload a single unfragmented UDP datagram can carry.
pub const DEFAULT_MTU: usize = 65_507;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub name: String,
    pub local_interface: String,
    /// Local port; 0 picks an ephemeral port.
    pub port: u16,
    /// Parent address ("host:port"), if this node has a parent.
    pub broker_address: Option<String>,
    pub connect_timeout: Duration,
    pub mtu: usize,
}

impl UdpConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_interface: "127.0.0.1".into(),
            port: 0,
            broker_address: None,
            connect_timeout: crate::DEFAULT_CONNECT_TIMEOUT,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Spawn the UDP driver. The socket is bound before this returns, so the
/// advertised address is final.
pub async fn spawn(config: UdpConfig, sink: InboundSink) -> Result<CommsHandle, CommsError> {
    let bind_addr = format!("{}:{}", config.local_interface, config.port);
    let socket = UdpSocket::bind(&bind_addr)
        .await
        .map_err(|err| CommsError::ConnectionFailure(format!("bind {bind_addr}: {err}")))?;
    let socket = Arc::new(socket);
    let address = socket.local_addr()?.to_string();

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(CommsStatus::Created);

    let rx_task = tokio::spawn(receive_loop(socket.clone(), sink.clone(), config.mtu));

    let driver = Driver {
        config,
        socket,
        sink,
        routes: HashMap::new(),
        parent: None,
        rx_task,
    };
    tokio::spawn(driver.run(control_rx, status_tx));

    Ok(CommsHandle::new(control_tx, status_rx, address))
}

struct Driver {
    config: UdpConfig,
    socket: Arc<UdpSocket>,
    sink: InboundSink,
    routes: HashMap<RouteId, SocketAddr>,
    parent: Option<SocketAddr>,
    rx_task: tokio::task::JoinHandle<()>,
}

impl Driver {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlCommand>,
        status_tx: watch::Sender<CommsStatus>,
    ) {
        if let Some(addr) = self.config.broker_address.clone() {
            match resolve(&addr, self.config.connect_timeout).await {
                Ok(resolved) => self.parent = Some(resolved),
                Err(err) => {
                    tracing::error!(name = %self.config.name, %addr, "cannot resolve parent: {err}");
                    self.sink.deliver_error(GlobalId::UNKNOWN, err.to_string());
                    let _ = status_tx.send(CommsStatus::Errored);
                    self.rx_task.abort();
                    return;
                }
            }
        }
        let _ = status_tx.send(CommsStatus::Connected);

        while let Some(cmd) = control_rx.recv().await {
            match cmd {
                ControlCommand::NewRoute(route, address) => {
                    match resolve(&address, self.config.connect_timeout).await {
                        Ok(resolved) => {
                            self.routes.insert(route, resolved);
                        }
                        Err(err) => {
                            tracing::warn!(%route, %address, "route resolution failed: {err}");
                        }
                    }
                }
                ControlCommand::RemoveRoute(route) => {
                    self.routes.remove(&route);
                }
                ControlCommand::Send(route, msg) => self.send(route, msg).await,
                ControlCommand::Disconnect => break,
            }
        }

        // Receiver closes first so in-flight datagrams are consumed, then the
        // socket drops with the driver.
        self.rx_task.abort();
        let _ = status_tx.send(CommsStatus::Terminated);
    }

    async fn send(&mut self, route: RouteId, msg: weave_core::ActionMessage) {
        if route == RouteId::CONTROL {
            self.sink.deliver(msg);
            return;
        }

        let dest = if route == RouteId::PARENT {
            self.parent
        } else {
            self.routes.get(&route).copied().or(self.parent)
        };
        let Some(dest) = dest else {
            tracing::warn!(name = %self.config.name, %route, "dropping message on unknown route");
            return;
        };

        let mut buf = BytesMut::new();
        codec::encode_frame(&msg, &mut buf);
        if buf.len() > self.config.mtu {
            tracing::error!(
                name = %self.config.name,
                size = buf.len(),
                mtu = self.config.mtu,
                "frame exceeds the UDP MTU; rejecting"
            );
            self.sink.deliver_error(
                msg.source_id,
                format!("{}", CommsError::OversizeFrame(buf.len())),
            );
            return;
        }

        if let Err(err) = self.socket.send_to(&buf, dest).await {
            tracing::warn!(name = %self.config.name, %dest, "send failed: {err}");
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, sink: InboundSink, mtu: usize) {
    let mut buf = vec![0u8; mtu.max(DEFAULT_MTU)];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => match codec::decode_frame(bytes::Bytes::copy_from_slice(&buf[..len]))
            {
                Ok(msg) => {
                    if !sink.deliver(msg) {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(%from, "dropping malformed datagram: {err}");
                }
            },
            Err(err) => {
                tracing::error!("receive failed: {err}");
                sink.deliver_error(GlobalId::UNKNOWN, format!("receive failed: {err}"));
                return;
            }
        }
    }
}

async fn resolve(address: &str, timeout: Duration) -> Result<SocketAddr, CommsError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::net::lookup_host(address).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return Ok(addr);
                }
            }
            Err(err) if tokio::time::Instant::now() >= deadline => {
                return Err(CommsError::ConnectionFailure(format!(
                    "resolve {address}: {err}"
                )));
            }
            Err(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CommsError::ConnectionFailure(format!(
                "resolve {address}: no addresses"
            )));
        }
        tokio::time::sleep(crate::CONNECT_RETRY_INTERVAL).await;
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
    async fn datagram_roundtrip() {
        let (server_sink, mut server_priority, _so) = sink();
        let server = spawn(UdpConfig::new("server"), server_sink).await.unwrap();

        let (client_sink, _cp, _co) = sink();
        let mut cfg = UdpConfig::new("client");
        cfg.broker_address = Some(server.address().to_owned());
        let mut client = spawn(cfg, client_sink).await.unwrap();
        client.wait_connected(Duration::from_secs(1)).await.unwrap();

        let mut msg = ActionMessage::new(Action::RegCore);
        msg.strings.push("client".into());
        client.transmit(RouteId::PARENT, msg.clone()).unwrap();

        let got = server_priority.recv().await.unwrap();
        assert_eq!(got.action, Action::RegCore);
        assert_eq!(got.strings, msg.strings);
    }

    #[test_log::test(tokio::test)]
    async fn oversize_frames_are_rejected() {
        let (server_sink, _sp, _so) = sink();
        let server = spawn(UdpConfig::new("server"), server_sink).await.unwrap();

        let (client_sink, mut client_priority, _co) = sink();
        let mut cfg = UdpConfig::new("client");
        cfg.broker_address = Some(server.address().to_owned());
        cfg.mtu = 256;
        let mut client = spawn(cfg, client_sink).await.unwrap();
        client.wait_connected(Duration::from_secs(1)).await.unwrap();

        let mut msg = ActionMessage::new(Action::PubData);
        msg.payload = bytes::Bytes::from(vec![0u8; 1024]);
        client.transmit(RouteId::PARENT, msg).unwrap();

        // The rejection surfaces as an inbound protocol error on the sender.
        let err = client_priority.recv().await.unwrap();
        assert_eq!(err.action, Action::Protocol);
        assert!(err.strings[0].contains("MTU"));
    }
}
