mod support;

use std::time::Duration;

use xylo::{Fault, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_server_trips_the_client_timeout() {
    let (addr, _handle, _join) = support::spawn(|server| {
        server.register_fn("sleepy", |_ctx, _params| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Value::Nil)
        });
    });

    let mut client = support::client(addr);
    client.set_keep_alive(true);
    client.set_timeout(Some(Duration::from_millis(100)));

    let err = client.execute("sleepy", vec![]).await.unwrap_err();
    assert!(err.is_timeout());

    // the cached connection was dropped; a fresh call still works
    client.set_timeout(Some(Duration::from_secs(5)));
    let resp = client.execute("sleepy", vec![]).await.unwrap();
    assert_eq!(resp.value(), Some(&Value::Nil));
}

#[tokio::test]
async fn oversized_response_is_distinct_from_connection_reset() {
    let (addr, _handle, _join) = support::spawn(support::register_echo);

    let mut client = support::client(addr);
    client.set_max_response_size(1024);

    let big = "y".repeat(8192);
    let err = client.execute("echo", vec![Value::from(big)]).await.unwrap_err();
    assert!(err.is_response_too_large());
    assert!(!err.is_closed());

    // the size cap is live: raising it lets the next call through
    client.set_max_response_size(0);
    let resp = client.execute("echo", vec![Value::from("ok")]).await.unwrap();
    assert_eq!(resp.value(), Some(&Value::String("ok".into())));
}

#[tokio::test]
async fn faults_are_responses_not_errors() {
    let (addr, _handle, _join) = support::spawn(|server| {
        server.register_fn("fussy", |_ctx, params| {
            if params.is_empty() {
                Err(Fault::new(-32602, "missing argument"))
            } else {
                Ok(params[0].clone())
            }
        });
    });
    let mut client = support::client(addr);

    let resp = client.execute("fussy", vec![]).await.unwrap();
    assert!(resp.is_fault());
    assert_eq!(resp.fault_code(), Some(-32602));

    let resp = client.execute("fussy", vec![Value::from(5)]).await.unwrap();
    assert!(!resp.is_fault());
    assert_eq!(resp.value(), Some(&Value::Int(5)));
}

#[tokio::test]
async fn all_value_kinds_round_trip_end_to_end() {
    let (addr, _handle, _join) = support::spawn(support::register_echo);
    let mut client = support::client(addr);

    let mut record = xylo::Struct::new();
    record.insert("nil", Value::Nil);
    record.insert("int", -42);
    record.insert("big", 1i64 << 40);
    record.insert("flag", true);
    record.insert("ratio", 0.5);
    record.insert("text", "a&b <tag> \"quoted\"");
    record.insert(
        "blob",
        Value::Binary(xylo::Binary::from_data(&b"\x00\xffbinary"[..])),
    );
    record.insert(
        "when",
        Value::DateTime(xylo::DateTime::parse("20151231T23:59:60").unwrap()),
    );
    record.insert("seq", vec![Value::from(1), Value::from("two"), Value::Nil]);
    let original = Value::from(record);

    let resp = client.execute("echo", vec![original.clone()]).await.unwrap();
    assert_eq!(resp.value(), Some(&original));
}

#[tokio::test]
async fn calls_against_a_closed_port_fail_to_connect() {
    let (addr, handle, join) = support::spawn(support::register_echo);
    handle.set_exit_flag();
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut client = support::client(addr);
    let err = client.execute("echo", vec![]).await.unwrap_err();
    assert!(err.is_connect());
}
