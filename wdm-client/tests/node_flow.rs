//! A node served over the mock transport, end to end.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wdm_client::{Config, MockTransport, OffloadOutcome, Transport, WdmNode};
use wdm_core::{EventBatch, LogOptions};
use wdm_types::{
    BlockEofAck, BlockQuery, CancelRequest, Envelope, EventSchema, ExchangeId, Importance,
    Message, NodeId, SchemaVersionRange, SendAccept, StatusReport, SubscribeRequest,
    TraitInstance, TraitPathRequest,
};

const PHONE: NodeId = NodeId::new(0x20);
const COLLECTOR: NodeId = NodeId::new(0xC0);
const THERMOSTAT: TraitInstance = TraitInstance {
    profile_id: 0x0E03,
    resource_id: 0x10,
    instance_id: 0,
};

const CONFIG: &str = r#"
[node]
node_id = 16

[event_log]
logging_threshold = "info"
flush_threshold_bytes = 100000

[[event_log.tiers]]
importance = "info"
capacity_bytes = 2048

[[event_log.tiers]]
importance = "production"
capacity_bytes = 4096

[subscriptions]
max_subscriptions = 2
"#;

fn node() -> WdmNode {
    let node = WdmNode::from_config(&Config::from_toml(CONFIG).unwrap()).unwrap();
    node.catalog()
        .register(THERMOSTAT, SchemaVersionRange::new(1, 2), vec![21]);
    node
}

fn emit(node: &mut WdmNode, importance: Importance, payload: &[u8]) {
    node.log_event(
        &EventSchema::new(0x0A01, 1, importance),
        &LogOptions::new(),
        |w| w.write_all(payload),
    )
    .unwrap();
}

/// A phone that acknowledges every Notify and remembers what it saw.
fn phone(seen: Arc<Mutex<Vec<Message>>>) -> MockTransport {
    MockTransport::new().with_responder(move |envelope| {
        seen.lock().unwrap().push(envelope.message.clone());
        match envelope.message {
            Message::Notify(_) => vec![envelope.reply(Message::StatusReport(StatusReport::success()))],
            _ => Vec::new(),
        }
    })
}

fn subscribe_request(node_id: NodeId) -> Envelope {
    Envelope::new(
        ExchangeId::new(0x4000),
        PHONE,
        node_id,
        Message::SubscribeRequest(SubscribeRequest {
            paths: vec![TraitPathRequest {
                instance: THERMOSTAT,
                versions: SchemaVersionRange::new(2, 3),
            }],
            last_observed: Vec::new(),
            liveness_timeout_secs: Some(120),
        }),
    )
}

#[tokio::test]
async fn subscriber_receives_data_then_events() {
    let mut node = node();
    emit(&mut node, Importance::Production, b"boot");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = phone(seen.clone());
    transport.connect(PHONE).await.unwrap();
    transport
        .queue_envelope(&subscribe_request(node.node_id()))
        .unwrap();

    node.run(&transport).await.unwrap();
    {
        let seen = seen.lock().unwrap();
        let Message::Notify(initial) = &seen[0] else {
            panic!("expected the initial Notify, got {:?}", seen[0]);
        };
        assert_eq!(initial.data.len(), 1);
        assert_eq!(initial.data[0].schema_version, 2);
        assert_eq!(initial.events.len(), 1);
        assert_eq!(initial.events[0].payload, b"boot");
        assert!(matches!(seen[1], Message::SubscribeResponse(_)));
    }
    assert_eq!(node.subscriptions().active_count(), 1);

    emit(&mut node, Importance::Info, b"door");
    emit(&mut node, Importance::Debug, b"below threshold");
    node.run(&transport).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    assert!(node.request_flush());
    node.advance(Duration::ZERO);
    node.run(&transport).await.unwrap();

    let seen = seen.lock().unwrap();
    let Message::Notify(update) = &seen[2] else {
        panic!("expected an event Notify, got {:?}", seen[2]);
    };
    assert!(update.data.is_empty());
    assert_eq!(update.events.len(), 1);
    assert_eq!(update.events[0].payload, b"door");
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn peer_cancel_frees_the_slot() {
    let mut node = node();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = phone(seen.clone());
    transport.connect(PHONE).await.unwrap();
    transport
        .queue_envelope(&subscribe_request(node.node_id()))
        .unwrap();
    node.run(&transport).await.unwrap();

    let subscription_id = seen
        .lock()
        .unwrap()
        .iter()
        .find_map(|m| match m {
            Message::SubscribeResponse(r) => Some(r.subscription_id),
            _ => None,
        })
        .unwrap();
    transport
        .queue_envelope(&Envelope::new(
            ExchangeId::new(0x4001),
            PHONE,
            node.node_id(),
            Message::CancelRequest(CancelRequest {
                subscription_id,
                reason: StatusReport::success(),
            }),
        ))
        .unwrap();
    node.run(&transport).await.unwrap();

    assert_eq!(node.subscriptions().active_count(), 0);
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&Message::StatusReport(StatusReport::success()))
    );
}

#[tokio::test]
async fn upload_through_the_node() {
    let mut node = node();
    for n in 0..5u8 {
        emit(&mut node, Importance::Production, &[n; 16]);
    }
    emit(&mut node, Importance::Info, b"info");

    let blocks = Arc::new(Mutex::new(Vec::new()));
    let received = blocks.clone();
    let transport = MockTransport::new().with_responder(move |envelope| {
        let answer = match &envelope.message {
            Message::SendInit(_) => vec![
                Message::SendAccept(SendAccept { max_block_size: 0 }),
                Message::BlockQuery(BlockQuery { block_counter: 0 }),
            ],
            Message::Block(block) => {
                received.lock().unwrap().push(block.data.clone());
                vec![Message::BlockQuery(BlockQuery {
                    block_counter: block.block_counter + 1,
                })]
            }
            Message::BlockEof(eof) => {
                received.lock().unwrap().push(eof.data.clone());
                vec![Message::BlockEofAck(BlockEofAck {
                    block_counter: eof.block_counter,
                })]
            }
            _ => Vec::new(),
        };
        answer.into_iter().map(|m| envelope.reply(m)).collect()
    });

    let outcome = node.upload(&transport, COLLECTOR).await.unwrap();
    assert_eq!(outcome, OffloadOutcome::Done);

    let records: Vec<_> = blocks
        .lock()
        .unwrap()
        .iter()
        .flat_map(|data| EventBatch::decode(data).unwrap())
        .collect();
    assert_eq!(records.len(), 6);
    // Least important tier first.
    assert_eq!(records[0].importance, Importance::Info);
    assert!(records[1..]
        .iter()
        .all(|r| r.importance == Importance::Production));

    // Nothing new: the next upload is empty but still completes.
    blocks.lock().unwrap().clear();
    let outcome = node.upload(&transport, COLLECTOR).await.unwrap();
    assert!(outcome.is_done());
    let again: usize = blocks
        .lock()
        .unwrap()
        .iter()
        .map(|data| EventBatch::decode(data).unwrap().len())
        .sum();
    assert_eq!(again, 0);
}

#[test]
fn persisted_counters_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let counters = dir.path().join("counters.json");
    let toml = format!(
        "{CONFIG}\n[offload]\nmax_block_size = 512\n",
    )
    .replace(
        "flush_threshold_bytes = 100000",
        &format!(
            "flush_threshold_bytes = 100000\ncounter_file = {:?}\ncounter_epoch = 8",
            counters.display().to_string()
        ),
    );
    let config = Config::from_toml(&toml).unwrap();

    let mut before = WdmNode::from_config(&config).unwrap();
    let mut last = None;
    for n in 0..10u8 {
        last = Some(
            before
                .log_event(
                    &EventSchema::new(0x0A01, 1, Importance::Production),
                    &LogOptions::new(),
                    |w| w.write_all(&[n]),
                )
                .unwrap(),
        );
    }
    drop(before);

    let mut after = WdmNode::from_config(&config).unwrap();
    let first = after
        .log_event(
            &EventSchema::new(0x0A01, 1, Importance::Production),
            &LogOptions::new(),
            |w| w.write_all(b"after"),
        )
        .unwrap();
    assert!(first > last.unwrap());
}
