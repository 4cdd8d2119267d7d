//! Integration tests for emews-net.
//!
//! Each test drives real event loops on one thread over 127.0.0.1, turning
//! them in small steps until the expected state is reached. Raw std sockets
//! stand in for misbehaving peers.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use emews_net::error::HandlerError;
use emews_net::event::handshake::{Identity, IdentityReply};
use emews_net::event::ConnectionOptions;
use emews_net::protocol::{build_envelope, Category, ProtocolId, ProtocolTable, Value};
use emews_net::{node_id, ConnectionState, EventLoop, NodeConfig, NodeHooks, NodeType, PeerId};

const ASK: u16 = 100;
const NOTIFY: u16 = 101;
const ECHO: u16 = 102;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

fn id(raw: u16) -> ProtocolId {
    ProtocolId::new(raw).unwrap()
}

/// Shapes shared by every node in these tests.
fn table() -> ProtocolTable {
    ProtocolTable::new()
        .with_protocol(ASK, Some("H"), Some("L"))
        .unwrap()
        .with_protocol(NOTIFY, Some("s"), None)
        .unwrap()
        .with_protocol(ECHO, Some("sL"), Some("sL"))
        .unwrap()
}

/// Hub-side table: ASK answers 42, NOTIFY returns values that must be
/// ignored, ECHO echoes.
fn hub_table(ask_calls: Rc<Cell<u32>>) -> ProtocolTable {
    let mut protocols = table();
    protocols
        .set_request_handler(id(ASK), move |_, _, _| {
            ask_calls.set(ask_calls.get() + 1);
            Ok(vec![Value::U32(42)])
        })
        .unwrap();
    protocols
        .set_request_handler(id(NOTIFY), |_, _, _| Ok(vec![Value::from("ignored")]))
        .unwrap();
    protocols
        .set_request_handler(id(ECHO), |_, _, fields| Ok(fields.to_vec()))
        .unwrap();
    protocols
}

fn config(name: &str) -> NodeConfig {
    NodeConfig::new(name).with_signal_handling(false)
}

fn connected(node: &EventLoop, peer_id: PeerId) -> bool {
    node.peer(peer_id).is_some_and(ConnectionState::is_connected)
}

/// Turn every node until `done` holds or the timeout passes.
fn pump(nodes: &mut [&mut EventLoop], mut done: impl FnMut(&[&mut EventLoop]) -> bool) -> bool {
    let deadline = Instant::now() + PUMP_TIMEOUT;
    while Instant::now() < deadline {
        for node in nodes.iter_mut() {
            node.turn(Some(Duration::from_millis(2))).unwrap();
        }
        if done(nodes) {
            return true;
        }
    }
    false
}

/// Turn every node a fixed number of times.
fn settle(nodes: &mut [&mut EventLoop], turns: usize) {
    for _ in 0..turns {
        for node in nodes.iter_mut() {
            node.turn(Some(Duration::from_millis(2))).unwrap();
        }
    }
}

struct Hub {
    node: EventLoop,
    port: u16,
    /// Peer ids in the order their connections were added.
    connections: Rc<RefCell<Vec<PeerId>>>,
    ask_calls: Rc<Cell<u32>>,
}

/// Listening hub that assigns peer ids by node name, starting at 2.
fn start_hub(options: ConnectionOptions) -> Hub {
    let ask_calls = Rc::new(Cell::new(0));
    let mut node = EventLoop::new(config("hub"), NodeType::Hub, hub_table(ask_calls.clone())).unwrap();
    node.set_node_id(node_id::HUB);

    let names: Rc<RefCell<HashMap<String, PeerId>>> = Rc::default();
    let connections: Rc<RefCell<Vec<PeerId>>> = Rc::default();
    let log = connections.clone();
    assert!(node.add_listener(0, move |node, handshake| {
        let peer_id = {
            let mut names = names.borrow_mut();
            let next = names.len() as PeerId + 2;
            *names.entry(handshake.name.clone()).or_insert(next)
        };
        node.add_peer(peer_id, handshake.node_type, handshake.peer_address.ip());
        node.add_connection(handshake.token, peer_id, |_, _, _| {}, options)
            .unwrap();
        log.borrow_mut().push(peer_id);
    }));
    let port = node.listen_addrs()[0].port();

    Hub {
        node,
        port,
        connections,
        ask_calls,
    }
}

fn client(name: &str, protocols: ProtocolTable) -> EventLoop {
    let mut node = EventLoop::new(config(name), NodeType::Host, protocols).unwrap();
    node.add_peer(node_id::HUB, NodeType::Hub.into(), LOCALHOST);
    node
}

/// Start connecting `client` to the hub.
fn connect(client: &mut EventLoop, port: u16, disconnections: Rc<RefCell<Vec<String>>>) {
    let token = client.add_outbound_connecting(
        port,
        node_id::HUB,
        |_, address, reason| panic!("connect to {} failed: {}", address, reason),
        move |node, handshake| {
            node.set_node_id(handshake.node_id);
            let log = disconnections.clone();
            node.add_connection(
                handshake.token,
                handshake.peer_id,
                move |_, _, reason| log.borrow_mut().push(reason.to_string()),
                ConnectionOptions::default(),
            )
            .unwrap();
        },
    );
    assert!(token.is_some());
}

/// Raw peer speaking the handshake by hand.
fn raw_peer(hub: &mut Hub, name: &str) -> (TcpStream, PeerId) {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, hub.port)).unwrap();
    let identity = Identity {
        node_type: NodeType::Host.into(),
        connection_count: 0,
        name: name.to_string(),
    };
    stream.write_all(&identity.encode()).unwrap();
    stream.set_nonblocking(true).unwrap();

    let mut reply = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut stream, &mut reply, &mut eof);
        reply.len() >= 6
    }));
    let reply = IdentityReply::decode(&reply).unwrap();
    assert_eq!(reply.node_type, u16::from(NodeType::Hub));
    (stream, reply.node_id)
}

fn read_available(stream: &mut TcpStream, out: &mut Vec<u8>, eof: &mut bool) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                *eof = true;
                return;
            }
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                *eof = true;
                return;
            }
            Err(e) => panic!("raw read failed: {}", e),
        }
    }
}

/// Test the basic request/response round trip between two loops.
#[test]
fn test_request_response_round_trip() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses: Rc<RefCell<Vec<(PeerId, Option<u32>)>>> = Rc::default();
    let log = responses.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, peer, _, fields| {
            log.borrow_mut().push((peer, fields[0].as_u32()));
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);

    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| {
        connected(n[0], 2) && connected(n[1], node_id::HUB)
    }));
    assert_eq!(client.node_id(), 2);
    assert_eq!(client.peer(node_id::HUB).unwrap().connection_count(), 1);

    let request_number = client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(7)], None)
        .unwrap();
    assert_eq!(request_number, 1);
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 1);

    assert!(pump(&mut [&mut hub.node, &mut client], |_| !responses.borrow().is_empty()));
    assert_eq!(*responses.borrow(), vec![(node_id::HUB, Some(42))]);
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 0);
    assert_eq!(hub.ask_calls.get(), 1);
}

/// Test that fire-and-forget requests never queue or trigger a response.
#[test]
fn test_fire_and_forget() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses = Rc::new(Cell::new(0));
    let count = responses.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, _, _, _| {
            count.set(count.get() + 1);
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    client
        .send_request_no_response(node_id::HUB, id(ASK), &[Value::U16(1)])
        .unwrap();
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 0);

    let ask_calls = hub.ask_calls.clone();
    assert!(pump(&mut [&mut hub.node, &mut client], |_| ask_calls.get() == 1));
    settle(&mut [&mut hub.node, &mut client], 20);
    assert_eq!(responses.get(), 0);
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 0);
}

/// Test that a response with request number 0 is dropped without touching
/// the pending queue or the connection.
#[test]
fn test_response_to_fire_and_forget_is_dropped() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses = Rc::new(Cell::new(0));
    let count = responses.clone();
    hub.node
        .protocols_mut()
        .set_response_handler(id(ASK), move |_, _, _, _| {
            count.set(count.get() + 1);
            Ok(())
        })
        .unwrap();
    let (mut raw, peer_id) = raw_peer(&mut hub, "raw");

    raw.write_all(&build_envelope(Category::Response, ASK, 0, &42u32.to_be_bytes()))
        .unwrap();
    raw.write_all(&build_envelope(Category::Request, ASK, 9, &1u16.to_be_bytes()))
        .unwrap();

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        received.len() >= 16
    }));
    assert_eq!(responses.get(), 0);
    assert!(connected(&hub.node, peer_id));
    assert_eq!(
        received,
        build_envelope(Category::Response, ASK, 9, &42u32.to_be_bytes())
    );
}

/// Test that a protocol without a response shape is answered by a bare
/// envelope, and a fire-and-forget request by nothing at all.
#[test]
fn test_no_response_shape() {
    let mut hub = start_hub(ConnectionOptions::default());
    let (mut raw, _) = raw_peer(&mut hub, "raw");

    let mut payload = 5u32.to_be_bytes().to_vec();
    payload.extend_from_slice(b"hello");
    raw.write_all(&build_envelope(Category::Request, NOTIFY, 5, &payload))
        .unwrap();
    raw.write_all(&build_envelope(Category::Request, NOTIFY, 0, &payload))
        .unwrap();
    raw.write_all(&build_envelope(Category::Request, NOTIFY, 6, &payload))
        .unwrap();

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        received.len() >= 24
    }));
    settle(&mut [&mut hub.node], 10);
    read_available(&mut raw, &mut received, &mut eof);

    let mut expected = build_envelope(Category::Response, NOTIFY, 5, &[]);
    expected.extend(build_envelope(Category::Response, NOTIFY, 6, &[]));
    assert_eq!(received, expected);
    assert_eq!(&received[..12], &[0, 0, 0, 8, 0, 1, 0, 101, 0, 0, 0, 5]);
}

/// Test that a sender accepts the bare reply to a protocol without a
/// response shape and drains its pending queue without a response handler.
#[test]
fn test_no_response_shape_drains_sender_queue() {
    let mut hub = start_hub(ConnectionOptions::default());
    let answers: Rc<RefCell<Vec<Option<u32>>>> = Rc::default();
    let log = answers.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, _, _, fields| {
            log.borrow_mut().push(fields[0].as_u32());
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    let first = client
        .send_request(node_id::HUB, id(NOTIFY), &[Value::from("one")], None)
        .unwrap();
    let second = client
        .send_request(node_id::HUB, id(NOTIFY), &[Value::from("two")], None)
        .unwrap();
    assert_eq!((first, second), (1, 2));
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 2);

    assert!(pump(&mut [&mut hub.node, &mut client], |n| {
        n[1].peer(node_id::HUB).unwrap().pending_len() == 0
    }));
    assert!(connected(&client, node_id::HUB));

    // The queue is still aligned for the next shaped response.
    client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(1)], None)
        .unwrap();
    assert!(pump(&mut [&mut hub.node, &mut client], |_| !answers.borrow().is_empty()));
    assert_eq!(*answers.borrow(), vec![Some(42)]);
    assert!(connected(&client, node_id::HUB));
}

/// Test that responses are matched in send order even when sizes differ.
#[test]
fn test_pending_queue_fifo() {
    let mut hub = start_hub(ConnectionOptions::default());
    let order: Rc<RefCell<Vec<(u32, usize, &'static str)>>> = Rc::default();
    let log = order.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ECHO), move |_, _, context, fields| {
            let tag = context
                .and_then(|c| c.downcast::<&'static str>().ok())
                .map(|c| *c)
                .unwrap_or("missing");
            let len = fields[0].as_bytes().map_or(0, |b| b.len());
            log.borrow_mut().push((fields[1].as_u32().unwrap_or(0), len, tag));
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    let big = vec![b'x'; 70_000];
    let requests: [(Value, u32, &'static str); 3] = [
        (Value::from("a"), 1, "r1"),
        (Value::from(big), 2, "r2"),
        (Value::from("c"), 3, "r3"),
    ];
    for (text, tag, context) in requests {
        let number = client
            .send_request(node_id::HUB, id(ECHO), &[text, Value::U32(tag)], Some(Box::new(context)))
            .unwrap();
        assert_eq!(number, tag);
    }

    assert!(pump(&mut [&mut hub.node, &mut client], |_| order.borrow().len() == 3));
    assert_eq!(
        *order.borrow(),
        vec![(1, 1, "r1"), (2, 70_000, "r2"), (3, 1, "r3")]
    );
}

/// Test that a message larger than one turn's read budget still arrives.
#[test]
fn test_message_larger_than_read_budget() {
    let mut hub = start_hub(ConnectionOptions::default());
    let echoed: Rc<RefCell<Option<(usize, Option<u32>)>>> = Rc::default();
    let log = echoed.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ECHO), move |_, _, _, fields| {
            let len = fields[0].as_bytes().map_or(0, |b| b.len());
            *log.borrow_mut() = Some((len, fields[1].as_u32()));
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    let big = vec![b'y'; 1_200_000];
    client
        .send_request(node_id::HUB, id(ECHO), &[Value::from(big), Value::U32(5)], None)
        .unwrap();
    assert!(pump(&mut [&mut hub.node, &mut client], |_| echoed.borrow().is_some()));
    assert_eq!(*echoed.borrow(), Some((1_200_000, Some(5))));
    assert!(connected(&hub.node, 2));
}

/// Test that sending while disconnected defers and the request goes out
/// once the peer connects.
#[test]
fn test_disconnected_send_is_deferred() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses: Rc<RefCell<Vec<Option<u32>>>> = Rc::default();
    let log = responses.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, _, _, fields| {
            log.borrow_mut().push(fields[0].as_u32());
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);

    let number = client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(3)], None)
        .unwrap();
    assert_eq!(number, 1);
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 1);
    client
        .send_request_no_response(node_id::HUB, id(ASK), &[Value::U16(4)])
        .unwrap();

    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |_| !responses.borrow().is_empty()));
    assert_eq!(*responses.borrow(), vec![Some(42)]);
    // The fire-and-forget request was dropped, not queued.
    assert_eq!(hub.ask_calls.get(), 1);
}

/// Test that pending requests survive a reconnect and are re-sent.
#[test]
fn test_reconnect_resends_pending() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses = Rc::new(Cell::new(0));
    let count = responses.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, _, _, _| {
            count.set(count.get() + 1);
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    let disconnections: Rc<RefCell<Vec<String>>> = Rc::default();

    connect(&mut client, hub.port, disconnections.clone());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| {
        connected(n[0], 2) && connected(n[1], node_id::HUB)
    }));

    let hub_side = hub.node.peer(2).unwrap().assigned_event().unwrap();
    assert!(hub.node.close_event(hub_side));
    assert!(!connected(&hub.node, 2));
    assert!(pump(&mut [&mut hub.node, &mut client], |n| !connected(n[1], node_id::HUB)));
    assert_eq!(disconnections.borrow().len(), 1);

    client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(1)], None)
        .unwrap();
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 1);

    connect(&mut client, hub.port, disconnections.clone());
    assert!(pump(&mut [&mut hub.node, &mut client], |_| responses.get() == 1));
    assert_eq!(client.peer(node_id::HUB).unwrap().connection_count(), 2);
    assert_eq!(hub.node.peer(2).unwrap().connection_count(), 2);
    assert_eq!(*hub.connections.borrow(), vec![2, 2]);
}

/// Test that requests the hub queued while an outbound peer was away are
/// re-sent once that peer connects again.
#[test]
fn test_hub_resends_pending_to_reconnected_peer() {
    let mut hub = start_hub(ConnectionOptions::default());
    let answers: Rc<RefCell<Vec<Option<u32>>>> = Rc::default();
    let log = answers.clone();
    hub.node
        .protocols_mut()
        .set_response_handler(id(ASK), move |_, peer, _, fields| {
            assert_eq!(peer, 2);
            log.borrow_mut().push(fields[0].as_u32());
            Ok(())
        })
        .unwrap();
    let client_calls = Rc::new(Cell::new(0));
    let mut client = client("host-a", hub_table(client_calls.clone()));
    let disconnections: Rc<RefCell<Vec<String>>> = Rc::default();

    connect(&mut client, hub.port, disconnections.clone());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| {
        connected(n[0], 2) && connected(n[1], node_id::HUB)
    }));
    let hub_side = hub.node.peer(2).unwrap().assigned_event().unwrap();
    assert!(hub.node.close_event(hub_side));
    assert!(pump(&mut [&mut hub.node, &mut client], |n| !connected(n[1], node_id::HUB)));

    for value in 1..=3u16 {
        hub.node
            .send_request(2, id(ASK), &[Value::U16(value)], None)
            .unwrap();
    }
    assert_eq!(hub.node.peer(2).unwrap().pending_len(), 3);
    assert_eq!(client_calls.get(), 0);

    connect(&mut client, hub.port, disconnections.clone());
    assert!(pump(&mut [&mut hub.node, &mut client], |_| answers.borrow().len() == 3));
    assert_eq!(client_calls.get(), 3);
    assert_eq!(*answers.borrow(), vec![Some(42); 3]);
    assert_eq!(hub.node.peer(2).unwrap().pending_len(), 0);
    assert_eq!(*hub.connections.borrow(), vec![2, 2]);
}

/// Test that a malformed envelope closes only the offending connection.
#[test]
fn test_malformed_envelope_is_isolated() {
    let mut hub = start_hub(ConnectionOptions::default());
    let responses = Rc::new(Cell::new(0));
    let count = responses.clone();
    let mut protocols = table();
    protocols
        .set_response_handler(id(ASK), move |_, _, _, _| {
            count.set(count.get() + 1);
            Ok(())
        })
        .unwrap();
    let mut client = client("host-a", protocols);
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    let (mut raw, raw_id) = raw_peer(&mut hub, "raw");
    assert!(connected(&hub.node, raw_id));
    // Length prefix shorter than the envelope header.
    raw.write_all(&[0, 0, 0, 4, 0, 0, 0, 0]).unwrap();

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node, &mut client], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        eof
    }));
    assert!(!connected(&hub.node, raw_id));
    assert!(hub.node.peer(raw_id).is_some());

    client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(1)], None)
        .unwrap();
    assert!(pump(&mut [&mut hub.node, &mut client], |_| responses.get() == 1));
    assert!(connected(&hub.node, 2));
}

/// Test that a valid request read together with a bad length prefix is
/// still answered before the connection closes.
#[test]
fn test_request_before_malformed_envelope_is_answered() {
    let mut hub = start_hub(ConnectionOptions::default());
    let (mut raw, raw_id) = raw_peer(&mut hub, "raw");

    let mut data = build_envelope(Category::Request, ASK, 3, &9u16.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0]);
    raw.write_all(&data).unwrap();

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        eof
    }));
    assert_eq!(hub.ask_calls.get(), 1);
    assert_eq!(received, build_envelope(Category::Response, ASK, 3, &42u32.to_be_bytes()));
    assert!(!connected(&hub.node, raw_id));
}

/// Test that an out-of-order response number closes the connection and
/// keeps the request pending.
#[test]
fn test_mismatched_response_is_fatal() {
    let mut hub = start_hub(ConnectionOptions::default());
    let (mut raw, raw_id) = raw_peer(&mut hub, "raw");

    let number = hub
        .node
        .send_request(raw_id, id(ASK), &[Value::U16(11)], None)
        .unwrap();
    assert_eq!(number, 1);

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        received.len() >= 14
    }));
    assert_eq!(
        received,
        build_envelope(Category::Request, ASK, 1, &11u16.to_be_bytes())
    );

    raw.write_all(&build_envelope(Category::Response, ASK, 7, &1u32.to_be_bytes()))
        .unwrap();
    assert!(pump(&mut [&mut hub.node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        eof
    }));
    assert!(!connected(&hub.node, raw_id));
    assert_eq!(hub.node.peer(raw_id).unwrap().pending_len(), 1);
}

/// Test that an unassigned request handler is answered with a NACK that
/// reaches the sender's NACK handler with its local context.
#[test]
fn test_nack_for_unassigned_handler() {
    let mut hub = start_hub(ConnectionOptions::default());
    hub.node.protocols_mut().clear_handlers(id(ASK)).unwrap();

    let nacks: Rc<RefCell<Vec<(u32, u16, Option<u64>)>>> = Rc::default();
    let log = nacks.clone();
    let mut client = client("host-a", table());
    client.set_nack_handler(move |_, err, context| {
        let context = context.and_then(|c| c.downcast::<u64>().ok()).map(|c| *c);
        log.borrow_mut()
            .push((err.request_number, err.protocol_id, context));
    });
    connect(&mut client, hub.port, Rc::default());
    assert!(pump(&mut [&mut hub.node, &mut client], |n| connected(n[1], node_id::HUB)));

    client
        .send_request(node_id::HUB, id(ASK), &[Value::U16(1)], Some(Box::new(99u64)))
        .unwrap();
    assert!(pump(&mut [&mut hub.node, &mut client], |_| !nacks.borrow().is_empty()));
    assert_eq!(*nacks.borrow(), vec![(1, ASK, Some(99))]);
    assert_eq!(client.peer(node_id::HUB).unwrap().pending_len(), 0);
    assert!(connected(&client, node_id::HUB));
    assert!(connected(&hub.node, 2));
}

/// Test that a failing handler is answered with a NACK when the connection
/// asks for it, and closes the connection otherwise.
#[test]
fn test_handler_error_nack_option() {
    for nack_on_request_error in [true, false] {
        let mut hub = start_hub(ConnectionOptions {
            nack_on_request_error,
        });
        hub.node
            .protocols_mut()
            .set_request_handler(id(ASK), |_, _, _| Err(HandlerError::new("boom")))
            .unwrap();
        let (mut raw, raw_id) = raw_peer(&mut hub, "raw");

        raw.write_all(&build_envelope(Category::Request, ASK, 3, &1u16.to_be_bytes()))
            .unwrap();
        let mut received = Vec::new();
        let mut eof = false;
        assert!(pump(&mut [&mut hub.node], |_| {
            read_available(&mut raw, &mut received, &mut eof);
            received.len() >= 12 || eof
        }));

        if nack_on_request_error {
            assert_eq!(received, build_envelope(Category::Response, 0, 3, &[]));
            assert!(connected(&hub.node, raw_id));
        } else {
            assert!(received.is_empty());
            assert!(eof);
            assert!(!connected(&hub.node, raw_id));
        }
    }
}

/// Test that a refused connect reaches the failure callback.
#[test]
fn test_connect_refused() {
    let port = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    let failures: Rc<RefCell<Vec<String>>> = Rc::default();
    let log = failures.clone();
    let mut client = client("host-a", table());
    client.add_outbound_connecting(
        port,
        node_id::HUB,
        move |_, address, reason| {
            assert_eq!(address.port(), port);
            log.borrow_mut().push(reason.to_string());
        },
        |_, _| panic!("unexpected handshake"),
    );

    assert!(pump(&mut [&mut client], |_| !failures.borrow().is_empty()));
    assert_eq!(failures.borrow().len(), 1);
    assert_eq!(client.event_count(), 1);
}

/// Test that a second listener on a taken port fails and stops the loop.
#[test]
fn test_listener_bind_failure_stops() {
    let hub = start_hub(ConnectionOptions::default());
    let mut node = EventLoop::new(config("second"), NodeType::Hub, table()).unwrap();
    assert!(!node.add_listener(hub.port, |_, _| {}));
    assert!(node.is_interrupted());
    assert!(node.listen_addrs().is_empty());
}

/// Test that an unclaimed handshake is closed by the loop.
#[test]
fn test_unclaimed_inbound_is_closed() {
    let mut node = EventLoop::new(config("hub"), NodeType::Hub, table()).unwrap();
    let handshakes = Rc::new(Cell::new(0));
    let count = handshakes.clone();
    assert!(node.add_listener(0, move |_, _| count.set(count.get() + 1)));
    let port = node.listen_addrs()[0].port();

    let mut raw = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let identity = Identity {
        node_type: 1,
        connection_count: 0,
        name: "raw".to_string(),
    };
    raw.write_all(&identity.encode()).unwrap();
    raw.set_nonblocking(true).unwrap();

    let mut received = Vec::new();
    let mut eof = false;
    assert!(pump(&mut [&mut node], |_| {
        read_available(&mut raw, &mut received, &mut eof);
        eof
    }));
    assert_eq!(handshakes.get(), 1);
    assert!(received.is_empty());
    // Unblock counter and listener.
    assert_eq!(node.event_count(), 2);
}

/// Test repeating timers and cross-thread counters.
#[test]
fn test_timer_and_counter() {
    let mut node = EventLoop::new(config("timers"), NodeType::Host, table()).unwrap();

    let ticks = Rc::new(Cell::new(0u64));
    let count = ticks.clone();
    let timer = node
        .add_timer(move |_, _, n| count.set(count.get() + n))
        .unwrap();
    node.set_timer(timer, Duration::from_millis(5), true).unwrap();

    let increments = Rc::new(Cell::new(0u64));
    let count = increments.clone();
    let counter = node.add_counter(move |_, _, n| count.set(count.get() + n));
    let remote = counter.clone();
    std::thread::spawn(move || {
        for _ in 0..10 {
            remote.increment();
        }
    })
    .join()
    .unwrap();

    assert!(pump(&mut [&mut node], |_| ticks.get() >= 3 && increments.get() == 10));

    node.set_timer(timer, Duration::ZERO, false).unwrap();
    let before = ticks.get();
    settle(&mut [&mut node], 10);
    assert_eq!(ticks.get(), before);

    assert!(node.close_event(counter.token()));
    assert!(counter.is_closed());
    assert!(node.set_timer(counter.token(), Duration::from_millis(1), false).is_err());
}

/// Test stopping a running loop from another thread.
#[test]
fn test_stop_from_other_thread() {
    let mut hub = start_hub(ConnectionOptions::default());
    let handle = hub.node.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        handle.stop();
    });

    hub.node.run().unwrap();
    stopper.join().unwrap();
    assert!(hub.node.is_interrupted());
    assert_eq!(hub.node.event_count(), 0);
    assert_eq!(hub.node.turn(Some(Duration::from_millis(1))).unwrap(), 0);
}

/// Test that hooks run around the loop and a timer can stop it.
#[test]
fn test_run_with_hooks() {
    #[derive(Default)]
    struct Hooks {
        started: bool,
        shut_down: bool,
        events_at_shutdown: usize,
    }

    impl NodeHooks for Hooks {
        fn start(&mut self, node: &mut EventLoop) {
            self.started = true;
            let fired = Rc::new(Cell::new(0u64));
            let timer = node
                .add_timer(move |node, _, n| {
                    fired.set(fired.get() + n);
                    if fired.get() >= 3 {
                        node.stop();
                    }
                })
                .unwrap();
            node.set_timer(timer, Duration::from_millis(2), true).unwrap();
        }

        fn shutdown(&mut self, node: &mut EventLoop) {
            self.shut_down = true;
            self.events_at_shutdown = node.event_count();
        }
    }

    let mut node = EventLoop::new(config("hooks"), NodeType::Monitor, table()).unwrap();
    let mut hooks = Hooks::default();
    node.run_with(&mut hooks).unwrap();

    assert!(hooks.started);
    assert!(hooks.shut_down);
    // Unblock counter and timer were still registered at shutdown.
    assert_eq!(hooks.events_at_shutdown, 2);
    assert_eq!(node.event_count(), 0);
}
