//! Connection lifecycle tests driven through a scripted transport.

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use httpconn::handler::SharedHandler;
use httpconn::{ConnectionConfig, ConnectionManager, Request, Response, Stage, StatusCode};
use support::{Call, counting_handler, eventually, pair, stalled_pair};
use tokio::time::Instant;

const GET: &str = "GET / HTTP/1.1\r\nHost: test\r\n\r\n";

fn config() -> ConnectionConfig {
    ConnectionConfig::default()
}

#[tokio::test]
async fn keep_alive_serves_second_request_on_same_connection() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    let id = manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send(GET);
    eventually(|| peer.record().count(Call::ReadRequest) == 2).await;

    {
        let record = peer.record();
        assert_eq!(
            &record.calls[..3],
            &[
                Call::ReadRequest,
                Call::Write { ranges: 4 },
                Call::ReadRequest
            ]
        );
        let text = record.written_text();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\none,two,three"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.contains(id));
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.stage(id), Some(Stage::ReadingRequest));

    peer.send(GET);
    eventually(|| peer.record().count(Call::ReadRequest) == 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(peer.record().count_writes(), 2);
    assert_eq!(manager.ids(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn idle_client_times_out_without_dispatch() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    let started = Instant::now();
    let id = manager
        .start(
            transport,
            handler,
            Arc::new(config().with_request_timeout_secs(1)),
        )
        .unwrap();

    eventually(|| manager.is_empty()).await;

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(!manager.contains(id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        peer.record().calls,
        vec![Call::ReadRequest, Call::Shutdown]
    );
    assert!(peer.record().written.is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_read_disarms_its_deadline() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, peer) = pair();
    let config = config()
        .with_request_timeout_secs(1)
        .with_keep_alive_timeout_secs(60);
    let id = manager.start(transport, handler, Arc::new(config)).unwrap();

    peer.send(GET);
    eventually(|| peer.record().count(Call::ReadRequest) == 2).await;

    // Well past the first request's deadline, inside the keep-alive window.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(manager.contains(id));
    assert_eq!(manager.stage(id), Some(Stage::ReadingRequest));
    assert_eq!(peer.record().count(Call::Shutdown), 0);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_timeout_closes_idle_connection() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, peer) = pair();
    let config = config()
        .with_request_timeout_secs(60)
        .with_keep_alive_timeout_secs(2);
    manager.start(transport, handler, Arc::new(config)).unwrap();

    peer.send(GET);
    eventually(|| peer.record().count(Call::ReadRequest) == 2).await;
    let idle_since = Instant::now();

    eventually(|| manager.is_empty()).await;
    let idle = idle_since.elapsed();
    assert!(idle >= Duration::from_secs(2));
    assert!(idle < Duration::from_secs(60));
    assert_eq!(peer.record().count(Call::Shutdown), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_drip_head_still_times_out() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_request_timeout_secs(3)),
        )
        .unwrap();

    let started = Instant::now();
    for byte in b"GET / HTTP/1.1\r\n".iter().copied() {
        peer.send(vec![byte]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        if manager.is_empty() {
            break;
        }
    }

    eventually(|| manager.is_empty()).await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn body_spanning_several_reads_reaches_handler() {
    let manager = Arc::new(ConnectionManager::new());
    let handler: SharedHandler = Arc::new(|req: Request| async move {
        Response::new(StatusCode::Ok).body(req.body().clone())
    });
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send("POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello");
    peer.send("wor");
    peer.send("ld");
    eventually(|| peer.record().count_writes() == 1).await;

    let record = peer.record();
    assert!(record.count(Call::ReadBody) >= 2);
    let text = record.written_text();
    assert!(text.contains("Content-Length: 10\r\n"));
    assert!(text.ends_with("helloworld"));
}

#[tokio::test]
async fn declared_body_larger_than_buffer_is_rejected() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_buffer_size(1024)),
        )
        .unwrap();

    peer.send("POST /upload HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
    eventually(|| manager.is_empty()).await;

    let record = peer.record();
    assert!(record.written_text().starts_with("HTTP/1.1 413 "));
    assert!(record.written_text().contains("Connection: close\r\n"));
    assert_eq!(record.count(Call::ReadBody), 0);
    assert_eq!(record.count(Call::Shutdown), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn head_filling_the_buffer_gets_431() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_buffer_size(1024)),
        )
        .unwrap();

    let mut head = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
    head.resize(2048, b'a');
    peer.send(head);
    eventually(|| manager.is_empty()).await;

    let record = peer.record();
    assert!(
        record
            .written_text()
            .starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n")
    );
    assert!(record.written_text().contains("Connection: close\r\n"));
    assert_eq!(record.count(Call::Shutdown), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_utf8_framing_header_cannot_smuggle_a_request() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send(&b"POST / HTTP/1.1\r\nContent-Length: 24\xff\r\n\r\nGET /admin HTTP/1.1\r\n\r\n"[..]);
    eventually(|| manager.is_empty()).await;

    let record = peer.record();
    assert!(record.written_text().starts_with("HTTP/1.1 400 "));
    assert_eq!(record.count_writes(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_head_gets_400_and_closes() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send("NOT A REQUEST\0\r\n\r\n");
    eventually(|| manager.is_empty()).await;

    assert!(peer.record().written_text().starts_with("HTTP/1.1 400 "));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chunked_request_gets_501() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
    eventually(|| manager.is_empty()).await;

    assert!(peer.record().written_text().starts_with("HTTP/1.1 501 "));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn peer_eof_closes_quietly() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, mut peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.close();
    eventually(|| manager.is_empty()).await;
    assert_eq!(
        peer.record().calls,
        vec![Call::ReadRequest, Call::Shutdown]
    );
}

#[tokio::test]
async fn stop_twice_shuts_down_once() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, peer) = pair();
    let id = manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();
    eventually(|| peer.record().count(Call::ReadRequest) == 1).await;

    assert!(manager.stop(id));
    assert!(!manager.stop(id));
    eventually(|| peer.record().count(Call::Shutdown) == 1).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(peer.record().count(Call::Shutdown), 1);
    assert!(manager.is_empty());
}

#[tokio::test]
async fn stop_all_cancels_writes_in_flight() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();

    let mut peers = Vec::new();
    for _ in 0..3 {
        let (transport, peer) = stalled_pair();
        manager
            .start(transport, Arc::clone(&handler), Arc::new(config()))
            .unwrap();
        peer.send(GET);
        peers.push(peer);
    }
    for peer in &peers {
        eventually(|| peer.record().count_writes() == 1).await;
    }
    assert_eq!(manager.len(), 3);

    let tasks = manager.stop_all();
    assert_eq!(tasks.len(), 3);
    for task in tasks {
        task.await.unwrap();
    }
    assert!(manager.is_empty());

    for peer in &peers {
        let record = peer.record();
        assert_eq!(record.writes_cancelled, 1);
        assert!(record.written.is_empty());
        assert_eq!(record.count(Call::Shutdown), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_write_times_out() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, peer) = stalled_pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_write_timeout_secs(2)),
        )
        .unwrap();

    peer.send(GET);
    eventually(|| peer.record().count_writes() == 1).await;
    let writing_since = Instant::now();

    eventually(|| manager.is_empty()).await;
    assert!(writing_since.elapsed() >= Duration::from_secs(1));
    let record = peer.record();
    assert_eq!(record.writes_cancelled, 1);
    assert_eq!(record.count(Call::Shutdown), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_body_times_out() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_body_timeout_secs(3)),
        )
        .unwrap();

    peer.send("POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel");
    eventually(|| peer.record().count(Call::ReadBody) == 1).await;
    let reading_since = Instant::now();

    eventually(|| manager.is_empty()).await;
    let waited = reading_since.elapsed();
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(4));

    let record = peer.record();
    assert_eq!(
        record.calls,
        vec![Call::ReadRequest, Call::ReadBody, Call::Shutdown]
    );
    assert!(record.written.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panicking_handler_closes_without_response() {
    let manager = Arc::new(ConnectionManager::new());
    let handler: SharedHandler = Arc::new(|_req: Request| async {
        if true {
            panic!("handler bug");
        }
        Response::new(StatusCode::Ok)
    });
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send(GET);
    eventually(|| manager.is_empty()).await;

    let record = peer.record();
    assert_eq!(record.count_writes(), 0);
    assert_eq!(record.count(Call::Shutdown), 1);
}

#[tokio::test]
async fn pipelined_requests_are_served_in_order() {
    let manager = Arc::new(ConnectionManager::new());
    let handler: SharedHandler = Arc::new(|req: Request| async move {
        Response::new(StatusCode::Ok).body(req.path().to_owned())
    });
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send("GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n");
    eventually(|| peer.record().count_writes() == 2).await;

    let text = peer.record().written_text();
    let first = text.find("/first").unwrap();
    let second = text.find("/second").unwrap();
    assert!(first < second);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
}

#[tokio::test]
async fn http10_without_keep_alive_closes_after_response() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, _calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send("GET / HTTP/1.0\r\n\r\n");
    eventually(|| manager.is_empty()).await;

    let record = peer.record();
    assert!(record.written_text().contains("Connection: close\r\n"));
    assert_eq!(record.count(Call::ReadRequest), 1);
}

#[tokio::test]
async fn handler_can_refuse_keep_alive() {
    let manager = Arc::new(ConnectionManager::new());
    let handler: SharedHandler = Arc::new(|_req: Request| async {
        Response::new(StatusCode::Ok).keep_alive(false)
    });
    let (transport, peer) = pair();
    manager
        .start(transport, handler, Arc::new(config()))
        .unwrap();

    peer.send(GET);
    eventually(|| manager.is_empty()).await;
    assert!(peer.record().written_text().contains("Connection: close\r\n"));
}

#[tokio::test]
async fn request_limit_closes_after_last_allowed_request() {
    let manager = Arc::new(ConnectionManager::new());
    let (handler, calls) = counting_handler();
    let (transport, peer) = pair();
    manager
        .start(
            transport,
            handler,
            Arc::new(config().with_max_requests_per_connection(2)),
        )
        .unwrap();

    peer.send(GET);
    peer.send(GET);
    eventually(|| manager.is_empty()).await;

    let text = peer.record().written_text();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(text.matches("Connection: keep-alive\r\n").count(), 1);
    assert_eq!(text.matches("Connection: close\r\n").count(), 1);
}
