//! JSON-lines front-end driven over in-memory pipes

use std::sync::Arc;
use std::time::Duration;

use busbridge_core::bus::loopback::LoopbackBus;
use busbridge_core::bus::{BusClass, InboundMessage};
use busbridge_core::codec::WireValue;
use busbridge_core::{frontend, BridgeConfig, BridgeService, EventHub};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const RULE: &str = "type='signal',interface='org.example.Lights'";

fn parse_lines(output: &[u8]) -> Vec<Value> {
    std::str::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn reply_for<'a>(lines: &'a [Value], id: &Value) -> &'a Value {
    lines
        .iter()
        .find(|line| line.get("id") == Some(id))
        .unwrap_or_else(|| panic!("no reply for id {id}"))
}

#[tokio::test]
async fn test_replies_for_each_request_line() {
    let bus = LoopbackBus::new();
    let hub = Arc::new(EventHub::new());
    let service = BridgeService::start(BridgeConfig::default(), Box::new(bus.clone()), hub.clone())
        .unwrap();
    let (subscriber, events) = hub.connect();

    let input = concat!(
        r#"{"id": 1, "verb": "version"}"#,
        "\n",
        r#"{"id": "two", "verb": "call", "args": {"path": "/org/x", "interface": "org.x.I", "member": "Ping", "signature": "s", "data": "hi"}}"#,
        "\n",
        "not json\n",
        "\n",
        r#"{"id": 4, "verb": "frobnicate"}"#,
        "\n",
        r#"{"id": 5, "verb": "call", "args": {"path": "/", "member": "M", "signature": "y", "data": 300}}"#,
        "\n",
    );
    let mut output = Vec::new();
    frontend::serve(
        service.client(subscriber),
        events,
        input.as_bytes(),
        &mut output,
    )
    .await
    .unwrap();

    let lines = parse_lines(&output);
    assert_eq!(lines.len(), 5, "{lines:?}");

    let version = reply_for(&lines, &json!(1));
    assert_eq!(version["status"], "success");
    assert_eq!(version["code"], 0);
    assert_eq!(version["data"], env!("CARGO_PKG_VERSION"));

    let call = reply_for(&lines, &json!("two"));
    assert_eq!(call["status"], "success");
    assert_eq!(call["data"], json!([]));

    let garbage = reply_for(&lines, &Value::Null);
    assert_eq!(garbage["status"], "invalid-request");
    assert_eq!(garbage["code"], -2);

    assert_eq!(reply_for(&lines, &json!(4))["status"], "invalid-request");
    assert_eq!(reply_for(&lines, &json!(5))["status"], "invalid-request");

    assert_eq!(bus.calls().len(), 1);
    service.shutdown();
}

#[tokio::test]
async fn test_events_are_written_between_replies() {
    let bus = LoopbackBus::new();
    let hub = Arc::new(EventHub::new());
    let service = BridgeService::start(BridgeConfig::default(), Box::new(bus.clone()), hub.clone())
        .unwrap();
    let (subscriber, events) = hub.connect();

    let (mut input_tx, input_rx) = tokio::io::duplex(4096);
    let (output_tx, output_rx) = tokio::io::duplex(4096);
    let mut output = BufReader::new(output_rx).lines();

    let driver = async move {
        let next = |line: Option<String>| -> Value { serde_json::from_str(&line.unwrap()).unwrap() };
        let subscribe = json!({"id": 1, "verb": "subscribe", "args": {"match": RULE, "event": "lights"}});
        input_tx
            .write_all(format!("{subscribe}\n").as_bytes())
            .await
            .unwrap();

        let reply = next(output.next_line().await.unwrap());
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["status"], "success");

        let message = InboundMessage::signal(
            "/org/example/Lights",
            "org.example.Lights",
            "Changed",
            vec![WireValue::UInt32(80)],
        );
        assert_eq!(bus.emit(BusClass::System, RULE, message), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), output.next_line())
            .await
            .expect("event line")
            .unwrap();
        let event = next(event);
        assert_eq!(event["event"], "lights");
        assert_eq!(event["data"]["data"], json!([80]));
        assert_eq!(event["data"]["bus"], "system");

        // closing input ends the session
        drop(input_tx);
        assert!(output.next_line().await.unwrap().is_none());
    };

    let client = service.client(subscriber);
    let (served, ()) = tokio::join!(
        frontend::serve(client, events, BufReader::new(input_rx), output_tx),
        driver
    );
    served.unwrap();
    service.shutdown();
}
