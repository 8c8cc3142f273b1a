// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Datagram transport seam.
//!
//! The overlay core only needs fire-and-forget datagrams: no delivery
//! guarantee, one message per datagram, losses handled by timeouts. The
//! default implementation speaks UDP over IPv4 with a second socket joined
//! to the discovery multicast group; tests wire nodes together through an
//! in-process [`memory::MemoryNetwork`] instead.

use crate::error::{Error, Result};
use crate::log_markers::LogMarker;
use crate::messages::WireMsg;
use crate::peer::NodeInfo;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// One received datagram: source address and undecoded payload.
pub type ConnectionEvent = (SocketAddr, Bytes);

/// Where incoming datagrams are handed to the owning node's event loop.
pub type IncomingSender = mpsc::Sender<ConnectionEvent>;

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Fire-and-forget datagram transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address peers can reach us at.
    fn local_addr(&self) -> SocketAddr;

    /// Sends one datagram to a peer.
    async fn send(&self, recipient: SocketAddr, bytes: Bytes) -> Result<()>;

    /// Sends one datagram to the discovery group.
    async fn send_discovery(&self, group: SocketAddrV4, bytes: Bytes) -> Result<()>;
}

/// UDP transport: one unicast socket for overlay traffic plus one socket
/// subscribed to the bootstrap multicast group.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Binds the unicast socket and the discovery listener, forwarding all
    /// received datagrams into `incoming`.
    pub async fn bind(
        local_addr: SocketAddr,
        discovery_group: SocketAddrV4,
        incoming: IncomingSender,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        trace!("{} on {}", LogMarker::ConnectionOpened, local_addr);

        let transport = Arc::new(Self { socket, local_addr });

        // The bound socket is shared for sending and receiving; a separate
        // task drains it into the node's event queue.
        let reader = transport.clone();
        let unicast_incoming = incoming.clone();
        let _ = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match reader.socket.recv_from(&mut buffer).await {
                    Ok((len, sender)) => {
                        let bytes = Bytes::copy_from_slice(&buffer[..len]);
                        if unicast_incoming.send((sender, bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("udp recv failed, stopping reader: {}", error);
                        break;
                    }
                }
            }
        });

        Self::spawn_discovery_listener(discovery_group, incoming).await?;
        Ok(transport)
    }

    async fn spawn_discovery_listener(
        group: SocketAddrV4,
        incoming: IncomingSender,
    ) -> Result<()> {
        let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
        let socket = match UdpSocket::bind(listen).await {
            Ok(socket) => socket,
            Err(error) => {
                // The discovery port may be taken by another local node;
                // that node will answer probes for this host.
                debug!("discovery listener unavailable on {}: {}", listen, error);
                return Ok(());
            }
        };
        socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;

        let _ = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, sender)) => {
                        let bytes = Bytes::copy_from_slice(&buffer[..len]);
                        if incoming.send((sender, bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("discovery recv failed, stopping listener: {}", error);
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, recipient: SocketAddr, bytes: Bytes) -> Result<()> {
        let sent = self.socket.send_to(&bytes, recipient).await?;
        if sent != bytes.len() {
            return Err(Error::FailedSend(recipient));
        }
        Ok(())
    }

    async fn send_discovery(&self, group: SocketAddrV4, bytes: Bytes) -> Result<()> {
        let _ = self.socket.send_to(&bytes, SocketAddr::V4(group)).await?;
        Ok(())
    }
}

/// Serialization boundary between the node core and the raw transport.
pub(crate) struct Comm {
    transport: Arc<dyn Transport>,
    discovery_group: SocketAddrV4,
}

impl Comm {
    pub(crate) fn new(transport: Arc<dyn Transport>, discovery_group: SocketAddrV4) -> Self {
        Self {
            transport,
            discovery_group,
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Serializes and sends; an unreachable or endpoint-less peer surfaces
    /// as `FailedSend`, which the dispatcher turns into peer-lost handling.
    pub(crate) async fn send(&self, recipient: &NodeInfo, wire_msg: &WireMsg) -> Result<()> {
        let endpoint = recipient
            .endpoint()
            .ok_or_else(|| Error::FailedSend(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))?;
        let bytes = wire_msg.to_bytes()?;
        self.transport
            .send(endpoint, bytes)
            .await
            .map_err(|_| Error::FailedSend(endpoint))
    }

    pub(crate) async fn send_raw(&self, recipient: SocketAddr, wire_msg: &WireMsg) -> Result<()> {
        let bytes = wire_msg.to_bytes()?;
        self.transport
            .send(recipient, bytes)
            .await
            .map_err(|_| Error::FailedSend(recipient))
    }

    pub(crate) async fn send_discovery(&self, wire_msg: &WireMsg) -> Result<()> {
        let bytes = wire_msg.to_bytes()?;
        self.transport.send_discovery(self.discovery_group, bytes).await
    }
}

pub mod memory {
    //! In-process transport used by multi-node tests: a hub of channels
    //! keyed by fake socket addresses, with loss-free ordered delivery.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// The shared hub connecting every in-process node.
    #[derive(Default)]
    pub struct MemoryNetwork {
        peers: Mutex<HashMap<SocketAddr, IncomingSender>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Registers a node under `addr` and returns its transport handle.
        pub fn endpoint(
            self: &Arc<Self>,
            addr: SocketAddr,
            incoming: IncomingSender,
        ) -> Arc<MemoryTransport> {
            let _ = self
                .peers
                .lock()
                .expect("memory network lock")
                .insert(addr, incoming);
            Arc::new(MemoryTransport {
                addr,
                network: self.clone(),
            })
        }

        /// Drops a node, turning sends to it into failures.
        pub fn disconnect(&self, addr: &SocketAddr) {
            let _ = self.peers.lock().expect("memory network lock").remove(addr);
        }

        fn sender_for(&self, addr: &SocketAddr) -> Option<IncomingSender> {
            self.peers
                .lock()
                .expect("memory network lock")
                .get(addr)
                .cloned()
        }

        fn all_except(&self, addr: &SocketAddr) -> Vec<IncomingSender> {
            self.peers
                .lock()
                .expect("memory network lock")
                .iter()
                .filter(|(peer, _)| *peer != addr)
                .map(|(_, sender)| sender.clone())
                .collect()
        }
    }

    /// One node's view of the hub.
    pub struct MemoryTransport {
        addr: SocketAddr,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn local_addr(&self) -> SocketAddr {
            self.addr
        }

        async fn send(&self, recipient: SocketAddr, bytes: Bytes) -> Result<()> {
            let sender = self
                .network
                .sender_for(&recipient)
                .ok_or(Error::FailedSend(recipient))?;
            sender
                .send((self.addr, bytes))
                .await
                .map_err(|_| Error::FailedSend(recipient))
        }

        async fn send_discovery(&self, _group: SocketAddrV4, bytes: Bytes) -> Result<()> {
            for sender in self.network.all_except(&self.addr) {
                let _ = sender.send((self.addr, bytes.clone())).await;
            }
            Ok(())
        }
    }
}
