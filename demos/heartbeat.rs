//! Hub and host exchanging heartbeats.
//!
//! The hub runs on its own thread and listens on an ephemeral port. The host
//! connects, sends a heartbeat every 200ms carrying its send time as local
//! context, logs the round trip of each response and stops both nodes after
//! five of them.
//!
//! ```text
//! RUST_LOG=debug cargo run --example heartbeat
//! ```

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use emews_net::event::{ConnectionOptions, InboundHandshake};
use emews_net::protocol::ids::CLIENT_HEARTBEAT;
use emews_net::{node_id, EventLoop, NodeConfig, NodeHooks, NodeType, ProtocolTable, StopHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEATS: u32 = 5;
const INTERVAL: Duration = Duration::from_millis(200);

fn run_hub(ready: mpsc::Sender<(u16, StopHandle)>) -> emews_net::Result<()> {
    let mut protocols = ProtocolTable::emews();
    protocols.set_request_handler(CLIENT_HEARTBEAT, |_, peer, _| {
        info!("Heartbeat from node {}", peer);
        Ok(Vec::new())
    })?;

    let mut hub = EventLoop::new(NodeConfig::new("hub"), NodeType::Hub, protocols)?;
    hub.set_node_id(node_id::HUB);
    let next_id = Rc::new(Cell::new(node_id::HUB + 1));
    let listening = hub.add_listener(0, move |node, handshake: InboundHandshake| {
        let peer_id = next_id.get();
        next_id.set(peer_id + 1);
        info!(
            "{} ({}) connected from {}, assigning id {}",
            handshake.name,
            NodeType::from_u16(handshake.node_type).map_or("unknown", NodeType::name),
            handshake.peer_address,
            peer_id
        );
        node.add_peer(peer_id, handshake.node_type, handshake.peer_address.ip());
        if let Err(e) = node.add_connection(
            handshake.token,
            peer_id,
            |_, peer, reason| warn!("Node {} disconnected: {}", peer, reason),
            ConnectionOptions::default(),
        ) {
            error!("Failed to add connection: {}", e);
        }
    });
    if !listening {
        return Err(emews_net::NodeError::Config("hub could not listen".into()));
    }

    let port = hub.listen_addrs()[0].port();
    if ready.send((port, hub.stop_handle())).is_err() {
        return Ok(());
    }
    hub.run()
}

struct Host {
    hub_port: u16,
    hub_stop: StopHandle,
}

impl NodeHooks for Host {
    fn start(&mut self, node: &mut EventLoop) {
        node.add_peer(node_id::HUB, NodeType::Hub.into(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let hub_stop = self.hub_stop.clone();
        let received = Rc::new(Cell::new(0u32));
        let result = node.protocols_mut().set_response_handler(
            CLIENT_HEARTBEAT,
            move |node, _, context, _| {
                if let Some(sent) = context.and_then(|c| c.downcast::<Instant>().ok()) {
                    info!("Heartbeat round trip: {:?}", sent.elapsed());
                }
                received.set(received.get() + 1);
                if received.get() >= HEARTBEATS {
                    hub_stop.stop();
                    node.stop();
                }
                Ok(())
            },
        );
        if let Err(e) = result {
            error!("{}", e);
            node.stop();
            return;
        }

        let timer = node.add_timer(|node, _, _| {
            if let Err(e) = node.send_request(
                node_id::HUB,
                CLIENT_HEARTBEAT,
                &[],
                Some(Box::new(Instant::now())),
            ) {
                error!("Heartbeat not sent: {}", e);
            }
        });
        match timer {
            Ok(timer) => {
                if let Err(e) = node.set_timer(timer, INTERVAL, true) {
                    error!("{}", e);
                }
            }
            Err(e) => error!("{}", e),
        }

        node.add_outbound_connecting(
            self.hub_port,
            node_id::HUB,
            |node, address, reason| {
                error!("Could not reach hub at {}: {}", address, reason);
                node.stop();
            },
            |node, handshake| {
                info!("Connected to hub, assigned id {}", handshake.node_id);
                node.set_node_id(handshake.node_id);
                if let Err(e) = node.add_connection(
                    handshake.token,
                    handshake.peer_id,
                    |node, _, reason| {
                        warn!("Lost hub: {}", reason);
                        node.stop();
                    },
                    ConnectionOptions::default(),
                ) {
                    error!("Failed to add connection: {}", e);
                }
            },
        );
    }

    fn shutdown(&mut self, node: &mut EventLoop) {
        let pending = node.peer(node_id::HUB).map_or(0, |p| p.pending_len());
        info!("Host shutting down with {} heartbeat(s) pending", pending);
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,emews_net=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (ready_tx, ready_rx) = mpsc::channel();
    let hub_thread = std::thread::spawn(move || {
        if let Err(e) = run_hub(ready_tx) {
            error!("Hub failed: {}", e);
        }
    });
    let Ok((hub_port, hub_stop)) = ready_rx.recv() else {
        error!("Hub did not start");
        return;
    };

    let host = EventLoop::new(NodeConfig::new("host-1"), NodeType::Host, ProtocolTable::emews());
    match host {
        Ok(mut host) => {
            let mut hooks = Host {
                hub_port,
                hub_stop: hub_stop.clone(),
            };
            if let Err(e) = host.run_with(&mut hooks) {
                error!("Host failed: {}", e);
            }
        }
        Err(e) => error!("Host failed to start: {}", e),
    }

    hub_stop.stop();
    if hub_thread.join().is_err() {
        error!("Hub thread panicked");
    }
}
