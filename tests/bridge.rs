//! End-to-end tests for the command bridge, driving it the way real
//! callers and peers do: the facade from the test thread, scripted peers
//! over plain TCP streams.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use extbridge::{Bridge, BridgeConfig, BridgeError};
use serde_json::{json, Value};

fn start_bridge(timeout_secs: u64) -> Bridge {
    let bridge = Bridge::new(BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        command_timeout_secs: timeout_secs,
    });
    bridge.start().unwrap();
    bridge
}

fn connect_peer(bridge: &Bridge) -> TcpStream {
    let addr = bridge.local_addr().expect("bridge not running");
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

/// Poll until the bridge sees exactly `n` peers (accept/disconnect are
/// handled asynchronously by the reactor).
fn wait_for_peers(bridge: &Bridge, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while bridge.connected_peers() != n {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {n} peer(s), have {}",
            bridge.connected_peers()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn send_line(stream: &mut TcpStream, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    stream.write_all(line.as_bytes()).unwrap();
}

fn read_envelope(reader: &mut BufReader<TcpStream>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read envelope line");
    serde_json::from_str(&line).expect("peer received invalid JSON")
}

fn assert_read_times_out(reader: &mut BufReader<TcpStream>) {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => panic!("stream closed while expecting silence"),
        Ok(_) => panic!("expected no further messages, got: {line}"),
        Err(e) => assert!(
            matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            "unexpected read error: {e}"
        ),
    }
}

#[test]
fn test_greeting_is_acknowledged() {
    let bridge = start_bridge(2);
    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    send_line(&mut stream, &json!({"type": "greeting", "content": "hi bridge"}));

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "response");
    assert!(
        reply["content"].as_str().unwrap().contains("hi bridge"),
        "ack should reference the greeting, got: {reply}"
    );
}

#[test]
fn test_text_is_echoed() {
    let bridge = start_bridge(2);
    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    send_line(&mut stream, &json!({"type": "text", "content": "ping"}));

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "echo");
    assert_eq!(reply["content"], "ping");
}

#[test]
fn test_malformed_message_gets_error_and_connection_survives() {
    let bridge = start_bridge(2);
    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    stream.write_all(b"this is not json\n").unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "error");

    // Connection must still be open and serviced.
    send_line(&mut stream, &json!({"type": "text", "content": "still alive"}));
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "echo");
    assert_eq!(reply["content"], "still alive");
    assert_eq!(bridge.connected_peers(), 1);
}

#[test]
fn test_unexpected_envelope_type_gets_error_reply() {
    let bridge = start_bridge(2);
    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    // Well-formed, but a bridge→peer type a peer should never send.
    send_line(&mut stream, &json!({"type": "echo", "content": "backwards"}));

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "error");
    assert_eq!(bridge.connected_peers(), 1);
}

#[test]
fn test_no_peers_fails_fast() {
    let bridge = start_bridge(10);

    let started = Instant::now();
    let err = bridge
        .send_command("get_cookies_by_domain", json!({"domain": "example.com"}), Duration::from_secs(10))
        .unwrap_err();

    assert!(matches!(err, BridgeError::NoPeersConnected), "got: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_disconnected_peer_is_pruned_and_survivor_gets_one_copy() {
    let bridge = start_bridge(2);
    let survivor = connect_peer(&bridge);
    let departing = connect_peer(&bridge);
    wait_for_peers(&bridge, 2);

    drop(departing);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(survivor.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = survivor;
        let msg = read_envelope(&mut reader);
        assert_eq!(msg["type"], "backend_command");
        assert_eq!(msg["command"], "probe");
        send_line(
            &mut stream,
            &json!({"type": "command_response", "data": {"success": true}}),
        );
        // Exactly one copy: nothing further should arrive.
        assert_read_times_out(&mut reader);
        stream
    });

    let data = bridge
        .send_command("probe", json!({}), Duration::from_secs(2))
        .unwrap();
    assert_eq!(data["success"], true);
    responder.join().unwrap();
}

#[test]
fn test_stale_response_is_drained_before_send() {
    let bridge = start_bridge(2);
    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    // An unrelated reply sits in the response queue before the call.
    send_line(
        &mut stream,
        &json!({"type": "command_response", "data": {"stale": true}}),
    );
    std::thread::sleep(Duration::from_millis(300));

    // The peer never answers the actual command: the stale entry must not
    // satisfy the wait.
    let err = bridge
        .send_command("probe", json!({}), Duration::from_millis(500))
        .unwrap_err();
    assert!(matches!(err, BridgeError::ResponseTimeout), "got: {err:?}");
}

#[test]
fn test_fresh_reply_wins_over_queued_stale_one() {
    let bridge = start_bridge(2);
    let stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = stream;
        // Queue a stale reply before any command goes out.
        send_line(
            &mut stream,
            &json!({"type": "command_response", "data": {"stale": true}}),
        );
        // Then answer the real command once it arrives.
        let msg = read_envelope(&mut reader);
        assert_eq!(msg["type"], "backend_command");
        send_line(
            &mut stream,
            &json!({"type": "command_response", "data": {"fresh": true}}),
        );
    });

    // Give the stale reply time to reach the response queue.
    std::thread::sleep(Duration::from_millis(300));

    let data = bridge
        .send_command("probe", json!({}), Duration::from_secs(2))
        .unwrap();
    assert_eq!(data["fresh"], true, "stale entry must be discarded, got: {data}");
    responder.join().unwrap();
}

#[test]
fn test_cookie_round_trip_formats_pairs() {
    let bridge = start_bridge(2);
    let stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = stream;
        let msg = read_envelope(&mut reader);
        assert_eq!(msg["type"], "backend_command");
        assert_eq!(msg["command"], "get_cookies_by_domain");
        assert_eq!(msg["params"]["domain"], "example.com");
        assert!(msg["command_id"].as_str().unwrap().starts_with("cmd-"));
        send_line(
            &mut stream,
            &json!({
                "type": "command_response",
                "data": {"success": true, "cookies": [{"name": "a", "value": "b"}]}
            }),
        );
    });

    let header = bridge.get_domain_cookies("example.com").unwrap();
    assert_eq!(header, "a=b");
    responder.join().unwrap();
}

#[test]
fn test_multiple_cookies_join_with_separator() {
    let bridge = start_bridge(2);
    let stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = stream;
        let _ = read_envelope(&mut reader);
        send_line(
            &mut stream,
            &json!({
                "type": "command_response",
                "data": {"success": true, "cookies": [
                    {"name": "a", "value": "b"},
                    {"name": "session", "value": "xyz"}
                ]}
            }),
        );
    });

    let header = bridge.get_domain_cookies("example.com").unwrap();
    assert_eq!(header, "a=b; session=xyz");
    responder.join().unwrap();
}

#[test]
fn test_peer_reported_failure_is_bad_response() {
    let bridge = start_bridge(2);
    let stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = stream;
        let _ = read_envelope(&mut reader);
        send_line(
            &mut stream,
            &json!({"type": "command_response", "data": {"success": false}}),
        );
    });

    let err = bridge.get_domain_cookies("example.com").unwrap_err();
    assert!(matches!(err, BridgeError::BadResponse(_)), "got: {err:?}");
    responder.join().unwrap();
}

#[test]
fn test_request_lookup_unwraps_requests() {
    let bridge = start_bridge(2);
    let stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let responder = std::thread::spawn(move || {
        let mut stream = stream;
        let msg = read_envelope(&mut reader);
        assert_eq!(msg["command"], "get_requests_by_domain");
        assert_eq!(msg["params"]["domain"], "shop.example");
        send_line(
            &mut stream,
            &json!({
                "type": "command_response",
                "data": {"success": true, "requests": [{"url": "https://shop.example/api"}]}
            }),
        );
    });

    let requests = bridge.get_domain_requests("shop.example").unwrap();
    assert_eq!(requests[0]["url"], "https://shop.example/api");
    responder.join().unwrap();
}

#[test]
fn test_timeout_respects_configured_bound() {
    let bridge = start_bridge(2);
    let _silent_peer = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let err = bridge
        .send_command("probe", json!({}), timeout)
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BridgeError::ResponseTimeout), "got: {err:?}");
    assert!(elapsed >= timeout, "returned before the timeout: {elapsed:?}");
    assert!(
        elapsed < timeout + Duration::from_secs(1),
        "waited far past the timeout: {elapsed:?}"
    );
}

#[test]
fn test_stop_wakes_blocked_caller() {
    let bridge = Arc::new(start_bridge(10));
    let _peer = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);

    let caller = {
        let bridge = Arc::clone(&bridge);
        std::thread::spawn(move || {
            bridge.send_command("probe", json!({}), Duration::from_secs(10))
        })
    };

    std::thread::sleep(Duration::from_millis(300));
    let started = Instant::now();
    bridge.stop();

    let result = caller.join().unwrap();
    assert!(
        matches!(result, Err(BridgeError::NotRunning)),
        "got: {result:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop() must not wait out the caller's timeout"
    );
}

#[test]
fn test_bridge_restarts_after_stop() {
    let bridge = start_bridge(2);
    bridge.stop();
    assert!(bridge.local_addr().is_none());

    bridge.start().unwrap();
    assert!(bridge.local_addr().is_some());

    let mut stream = connect_peer(&bridge);
    wait_for_peers(&bridge, 1);
    send_line(&mut stream, &json!({"type": "text", "content": "back"}));
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let reply = read_envelope(&mut reader);
    assert_eq!(reply["type"], "echo");
}
