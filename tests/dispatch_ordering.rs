#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Per-connection ordering and handler isolation, driven over the in-memory
//! transport so timing does not depend on the network stack

use fastsocket::transport::memory;
use fastsocket::{Client, ClientConfig, Message, Payload, ProtocolError, Server, ServerConfig};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn linked(server: &Server, key: &str) -> Client {
    let (server_side, client_side) = memory::pair(memory::DEFAULT_CAPACITY);
    server.attach(key, server_side).unwrap();
    let client = Client::new(ClientConfig::default());
    client.connect_with(client_side).await.unwrap();
    client
}

fn sequenced(code: &str, seq: u64) -> Message {
    Message::from_value(None, code, json!({ "seq": seq })).unwrap()
}

fn seq_of(msg: &Message) -> u64 {
    msg.get("seq").and_then(|v| v.as_u64()).unwrap()
}

async fn wait_for_len(log: &Mutex<Vec<String>>, len: usize) {
    for _ in 0..300 {
        if log.lock().unwrap().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("log never reached {len} entries: {:?}", log.lock().unwrap());
}

#[tokio::test]
async fn test_messages_dispatched_in_arrival_order() {
    let server = Server::new(ServerConfig::with_address("127.0.0.1:0"));
    let log = Arc::new(Mutex::new(Vec::new()));

    let events = Arc::clone(&log);
    server
        .on_message("STEP", move |msg, _peer| {
            let events = Arc::clone(&events);
            async move {
                let seq = seq_of(&msg);
                events.lock().unwrap().push(format!("start {seq}"));
                // Early messages take longest; ordering must still hold.
                tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(seq * 2))).await;
                events.lock().unwrap().push(format!("end {seq}"));
                Ok(())
            }
        })
        .unwrap();

    let client = linked(&server, "ordered").await;
    for seq in 0..10 {
        client.send(&sequenced("STEP", seq)).await.unwrap();
    }

    wait_for_len(&log, 20).await;
    let expected: Vec<String> = (0..10)
        .flat_map(|seq| [format!("start {seq}"), format!("end {seq}")])
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
    server.stop().await;
}

#[tokio::test]
async fn test_handlers_for_one_message_finish_before_next() {
    let server = Server::new(ServerConfig::with_address("127.0.0.1:0"));
    let log = Arc::new(Mutex::new(Vec::new()));

    let slow = Arc::clone(&log);
    server
        .on_message("WORK", move |msg, _peer| {
            let slow = Arc::clone(&slow);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                slow.lock().unwrap().push(format!("slow {}", seq_of(&msg)));
                Ok(())
            }
        })
        .unwrap();
    let fast = Arc::clone(&log);
    server
        .on_message("ALL", move |msg, _peer| {
            let fast = Arc::clone(&fast);
            async move {
                fast.lock().unwrap().push(format!("all {}", seq_of(&msg)));
                Ok(())
            }
        })
        .unwrap();

    let client = linked(&server, "pair").await;
    client.send(&sequenced("WORK", 1)).await.unwrap();
    client.send(&sequenced("WORK", 2)).await.unwrap();

    wait_for_len(&log, 4).await;
    let log = log.lock().unwrap().clone();
    // Handlers of one message run concurrently, so "all" may finish first,
    // but nothing from message 2 appears before message 1 is complete.
    let first: Vec<&str> = log[..2].iter().map(String::as_str).collect();
    assert!(first.contains(&"slow 1") && first.contains(&"all 1"), "{log:?}");
    let second: Vec<&str> = log[2..].iter().map(String::as_str).collect();
    assert!(second.contains(&"slow 2") && second.contains(&"all 2"), "{log:?}");
    server.stop().await;
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_are_isolated() {
    let server = Server::new(ServerConfig::with_address("127.0.0.1:0"));
    server
        .on_message("JOB", |_msg, _peer| async move {
            Err(ProtocolError::HandlerError("refused".into()))
        })
        .unwrap();
    server
        .on_message("JOB", |msg, _peer| async move {
            if seq_of(&msg) == 0 {
                panic!("handler blew up");
            }
            Ok(())
        })
        .unwrap();
    server
        .on_message("JOB", |msg, peer| async move {
            peer.send(&msg.reply("DONE", Payload::new())).await
        })
        .unwrap();

    let client = linked(&server, "jobs").await;
    for seq in 0..3 {
        let reply = client
            .send_and_wait(sequenced("JOB", seq), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(reply.into_message().unwrap().code(), "DONE");
    }
    server.stop().await;
}

#[tokio::test]
async fn test_connections_do_not_block_each_other() {
    let server = Server::new(ServerConfig::with_address("127.0.0.1:0"));
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    server
        .on_message("BLOCK", move |_msg, _peer| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|released| *released).await;
                Ok(())
            }
        })
        .unwrap();
    server
        .on_message("ECHO", |msg, peer| async move {
            peer.send(&msg.reply("ECHO", msg.data().clone())).await
        })
        .unwrap();

    let stuck = linked(&server, "stuck").await;
    let free = linked(&server, "free").await;

    stuck.send(&Message::empty("BLOCK")).await.unwrap();
    let reply = free
        .send_and_wait(sequenced("ECHO", 7), Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .into_message()
        .unwrap();
    assert_eq!(seq_of(&reply), 7);

    release_tx.send(true).unwrap();
    server.stop().await;
}
