//! Darknode libp2p host: the listener, the overlay DHT and the bootstrap dialer.
//!
//! The swarm is owned by [`Libp2pHost::run`]. Everything else talks to it
//! through [`SwarmCommand`]s, usually via a [`SwarmDialer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{connection_limits, identify, kad, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::error::DialError;
use crate::keys;
use crate::net::dial::Dialer;
use crate::node_config::NodeConfiguration;

pub const KADEMLIA_PROTOCOL: &str = "/republic/kad/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/republic/id/1.0.0";
const AGENT_VERSION: &str = concat!("darknode/", env!("CARGO_PKG_VERSION"));

/// Commands sent from the bootstrap phase to the swarm event loop.
pub enum SwarmCommand {
    Dial {
        peer: PeerAddress,
        reply: oneshot::Sender<Result<(), DialError>>,
    },
    /// Start a Kademlia bootstrap query over whatever peers are known.
    Bootstrap {
        reply: oneshot::Sender<Result<(), kad::NoKnownPeers>>,
    },
}

/// Network behaviour for darknodes.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct NodeBehaviour {
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub limits: connection_limits::Behaviour,
}

/// Libp2p host wrapper for a darknode.
pub struct Libp2pHost {
    swarm: Swarm<NodeBehaviour>,
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    cmd_rx: mpsc::Receiver<SwarmCommand>,
}

impl Libp2pHost {
    /// Build the swarm from the node's identity and policy and start listening
    /// on the configured host and port.
    pub fn new(config: Arc<NodeConfiguration>) -> Result<Self> {
        let keypair = keys::to_libp2p(config.key())?;
        let peer_id = keypair.public().to_peer_id();
        let policy = config.network();

        let mut kad = kad::Behaviour::with_config(
            peer_id,
            kad::store::MemoryStore::new(peer_id),
            policy.kademlia_config(StreamProtocol::new(KADEMLIA_PROTOCOL)),
        );
        kad.set_mode(Some(kad::Mode::Server));

        let behaviour = NodeBehaviour {
            kad,
            identify: identify::Behaviour::new(
                identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                    .with_agent_version(AGENT_VERSION.to_string()),
            ),
            limits: connection_limits::Behaviour::new(policy.connection_limits()),
        };

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                Default::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|_| behaviour)?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen_addr = config.listen_multiaddr();
        swarm
            .listen_on(listen_addr.clone())
            .with_context(|| format!("Failed to listen on {listen_addr}"))?;
        info!(peer_id = %peer_id, address = %config.address(), listen_addr = %listen_addr, "Darknode host listening");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Ok(Self {
            swarm,
            local_peer_id: peer_id,
            cmd_tx,
            cmd_rx,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// A handle for dialing through this host. The event loop stops once the
    /// host and every dialer have been dropped.
    pub fn dialer(&self) -> SwarmDialer {
        SwarmDialer {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            mut swarm,
            cmd_tx,
            mut cmd_rx,
            ..
        } = self;
        // Only outstanding dialers keep the loop alive.
        drop(cmd_tx);

        let mut pending_dials: HashMap<ConnectionId, (PeerAddress, oneshot::Sender<Result<(), DialError>>)> =
            HashMap::new();

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(address = %address, "Listening on address");
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                            swarm
                                .behaviour_mut()
                                .kad
                                .add_address(&peer_id, endpoint.get_remote_address().clone());

                            if let Some((peer, reply)) = pending_dials.remove(&connection_id) {
                                debug!(peer = %peer, peer_id = %peer_id, "Dial completed");
                                let _ = reply.send(Ok(()));
                            }
                        }
                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            debug!(peer_id = %peer_id, "Connection closed");
                        }
                        SwarmEvent::OutgoingConnectionError { connection_id, error, .. } => {
                            if let Some((peer, reply)) = pending_dials.remove(&connection_id) {
                                let _ = reply.send(Err(DialError::Connect {
                                    addr: peer.to_string(),
                                    reason: error.to_string(),
                                }));
                            }
                        }
                        SwarmEvent::Behaviour(NodeBehaviourEvent::Kad(
                            kad::Event::OutboundQueryProgressed { result: kad::QueryResult::Bootstrap(result), .. },
                        )) => match result {
                            Ok(ok) => debug!(remaining = ok.num_remaining, "DHT bootstrap progressed"),
                            Err(e) => warn!(error = ?e, "DHT bootstrap failed"),
                        },
                        SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                            peer_id,
                            info,
                            ..
                        })) => {
                            debug!(peer_id = %peer_id, agent = %info.agent_version, "Identified peer");
                            for addr in info.listen_addrs {
                                swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                            }
                        }
                        _ => {}
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial { peer, reply }) => {
                            let opts = DialOpts::unknown_peer_id()
                                .address(peer.to_multiaddr())
                                .build();
                            let connection_id = opts.connection_id();

                            match swarm.dial(opts) {
                                Ok(()) => {
                                    pending_dials.insert(connection_id, (peer, reply));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(DialError::Connect {
                                        addr: peer.to_string(),
                                        reason: e.to_string(),
                                    }));
                                }
                            }
                        }
                        Some(SwarmCommand::Bootstrap { reply }) => {
                            let _ = reply.send(swarm.behaviour_mut().kad.bootstrap().map(|_| ()));
                        }
                        None => {
                            // Channel closed, shut down
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// [`Dialer`] backed by a running [`Libp2pHost`].
#[derive(Clone)]
pub struct SwarmDialer {
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmDialer {
    /// Kick off a DHT bootstrap once at least one peer is connected.
    pub async fn bootstrap_dht(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Bootstrap { reply })
            .await
            .context("host stopped")?;
        rx.await
            .context("host stopped")?
            .context("no known peers to bootstrap the DHT from")?;
        info!("Triggered DHT bootstrap");
        Ok(())
    }
}

impl Dialer for SwarmDialer {
    async fn dial(&self, peer: &PeerAddress) -> Result<(), DialError> {
        let stopped = || DialError::Connect {
            addr: peer.to_string(),
            reason: "host stopped".into(),
        };

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Dial {
                peer: peer.clone(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}
