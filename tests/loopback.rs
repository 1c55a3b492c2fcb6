//! End-to-end bridging through the outbound listener over in-memory layers

mod common;

use async_trait::async_trait;
use common::{
    eventually, events, opened_and_closed, pattern, round_trip, start_outbound, FakeStack, Remote,
    GREETING,
};
use nahan::{Acceptor, Outbound, Stage, TunnelError, TunnelSettings};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

#[tokio::test]
async fn test_empty_connection() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;
    let received = round_trip(running.addr, Vec::new()).await;
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_single_byte() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;
    let received = round_trip(running.addr, vec![0x5a]).await;
    assert_eq!(received, vec![0x5a]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_several_mebibytes_both_ways() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;
    let data = pattern(5 * 1024 * 1024 + 17, 7);
    let received = round_trip(running.addr, data.clone()).await;
    assert_eq!(received.len(), data.len());
    assert!(received == data);
}

#[tokio::test]
async fn test_half_close_keeps_reverse_direction_open() {
    let running = start_outbound(
        Arc::new(FakeStack::new(Remote::CountThenReply)),
        TunnelSettings::default(),
    )
    .await;

    let mut conn = TcpStream::connect(running.addr).await.unwrap();
    conn.write_all(&pattern(100_000, 1)).await.unwrap();
    conn.shutdown().await.unwrap();

    // the reply is only sent after our FIN reached the far end
    let mut reply = String::new();
    conn.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "received 100000 bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_are_isolated() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;

    let mut clients = Vec::new();
    for i in 0..50u8 {
        let addr = running.addr;
        clients.push(tokio::spawn(async move {
            let data = pattern(32 * 1024 + i as usize, i);
            let received = round_trip(addr, data.clone()).await;
            assert!(received == data, "connection {} got another stream's bytes", i);
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    let tunnel = running.outbound.tunnel().unwrap();
    assert_eq!(tunnel.stage(), Stage::Serving);
}

#[tokio::test]
async fn test_far_end_fin_keeps_local_direction_open() {
    let stack = FakeStack::new(Remote::GreetThenCount);
    let log = Arc::clone(&stack.log);
    let running = start_outbound(Arc::new(stack), TunnelSettings::default()).await;

    let mut conn = TcpStream::connect(running.addr).await.unwrap();
    let (mut read, mut write) = conn.split();

    // EOF from the far end arrives while we have not sent anything yet
    let mut greeting = Vec::new();
    read.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, GREETING);

    write.write_all(&pattern(102_400, 3)).await.unwrap();
    write.shutdown().await.unwrap();

    eventually("the far end to count the request", || {
        events(&log).iter().any(|e| e == "counted 102400")
    })
    .await;
    let tunnel = running.outbound.tunnel().unwrap();
    eventually("the stream to be released", || tunnel.num_streams() == 0).await;
    running.outbound.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_connections_leave_others_intact() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;

    let mut clients = Vec::new();
    for i in 0..20u8 {
        let addr = running.addr;
        clients.push(tokio::spawn(async move {
            let data = pattern(400 * 1024 + i as usize, i);
            round_trip(addr, data.clone()).await == data
        }));
    }

    let mut resets = Vec::new();
    for i in 0..10u8 {
        let addr = running.addr;
        resets.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(&pattern(64 * 1024, 100 + i)).await.unwrap();
            // wait for some of the echo so the stream is carrying data
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf).await;
            // a zero linger turns the close into an RST
            socket2::SockRef::from(&conn)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(conn);
        }));
    }

    for reset in resets {
        reset.await.unwrap();
    }
    for (i, client) in clients.into_iter().enumerate() {
        assert!(client.await.unwrap(), "connection {} was disturbed by a reset", i);
    }

    let tunnel = running.outbound.tunnel().unwrap();
    eventually("every bridged stream to be released", || tunnel.num_streams() == 0).await;
    assert_eq!(tunnel.stage(), Stage::Serving);
    assert_eq!(round_trip(running.addr, b"after".to_vec()).await, b"after");
    running.outbound.close().await;
}

#[tokio::test]
async fn test_connection_cap_queues_excess_connections() {
    let settings = TunnelSettings {
        max_connections: Some(2),
        ..TunnelSettings::default()
    };
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), settings).await;

    let mut clients = Vec::new();
    for i in 0..8u8 {
        let addr = running.addr;
        clients.push(tokio::spawn(async move {
            round_trip(addr, vec![i; 1000]).await == vec![i; 1000]
        }));
    }
    for client in clients {
        assert!(client.await.unwrap());
    }
}

#[tokio::test]
async fn test_close_stops_serving_and_is_idempotent() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;
    assert_eq!(round_trip(running.addr, b"before".to_vec()).await, b"before");

    let tunnel = running.outbound.tunnel().unwrap();
    let report = running.outbound.close().await;
    assert_eq!(report.outcomes.len(), 5);
    assert!(report.is_clean());
    assert!(running.outbound.close().await.is_empty());
    assert_eq!(tunnel.stage(), Stage::Closed);

    let served = tokio::time::timeout(Duration::from_secs(5), running.serve)
        .await
        .unwrap()
        .unwrap();
    assert!(served.is_ok());
    assert!(running.outbound.tunnel().is_none());
}

#[tokio::test]
async fn test_bring_up_failure_is_returned() {
    let mut stack = FakeStack::new(Remote::Echo);
    stack.fail_at = Some(Stage::MultiplexReady);
    let outbound = Outbound::with_stack(
        vec![common::resolver()],
        vec![common::server()],
        TunnelSettings::default(),
        Arc::new(stack),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let err = outbound.serve(listener).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::MultiplexReady));
    assert!(matches!(err.root(), TunnelError::MultiplexSetup(_)));
    assert!(outbound.tunnel().is_none());

    // the listener went away with the failed bring-up
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stream_open_failure_only_drops_that_connection() {
    let running = start_outbound(Arc::new(FakeStack::new(Remote::Echo)), TunnelSettings::default()).await;
    running.outbound.tunnel().unwrap().close().await;

    // accepted, then closed without data since no stream can be opened
    let mut conn = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = Vec::new();
    let result = conn.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert!(result.is_ok() || result.unwrap_err().kind() == io::ErrorKind::ConnectionReset);

    // the accept loop is still running
    assert!(TcpStream::connect(running.addr).await.is_ok());
    running.outbound.close().await;
}

/// Fails the first `failures` accepts before delegating to a real listener
struct FlakyAcceptor {
    listener: TcpListener,
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Acceptor for FlakyAcceptor {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
        }
        self.listener.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[tokio::test]
async fn test_accept_errors_do_not_stop_the_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let acceptor = FlakyAcceptor {
        listener,
        failures: 4,
        attempts: Arc::clone(&attempts),
    };

    let outbound = Arc::new(Outbound::with_stack(
        vec![common::resolver()],
        vec![common::server()],
        TunnelSettings::default(),
        Arc::new(FakeStack::new(Remote::Echo)),
    ));
    let serving = Arc::clone(&outbound);
    let serve = tokio::spawn(async move { serving.serve(acceptor).await });

    let received = tokio::time::timeout(Duration::from_secs(10), round_trip(addr, b"still here".to_vec()))
        .await
        .unwrap();
    assert_eq!(received, b"still here");
    assert!(attempts.load(Ordering::SeqCst) > 4);

    outbound.close().await;
    assert!(serve.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_close_during_bring_up_leaves_no_tunnel() {
    let gate = Arc::new(Notify::new());
    let mut stack = FakeStack::new(Remote::Echo);
    stack.gate = Some(Arc::clone(&gate));
    stack.fail_close = Some("resolver");
    let log = Arc::clone(&stack.log);
    let outbound = Arc::new(Outbound::with_stack(
        vec![common::resolver()],
        vec![common::server()],
        TunnelSettings::default(),
        Arc::new(stack),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&outbound);
    let serve = tokio::spawn(async move { serving.serve(listener).await });

    eventually("bring-up to start", || events(&log).iter().any(|e| e == "bind")).await;
    let report = outbound.close().await;
    assert!(report.is_empty());
    gate.notify_one();

    let err = tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.root(), TunnelError::SessionClosed));
    assert!(outbound.tunnel().is_none());

    // the socket bound after close() is released even though its close fails
    eventually("the resolver socket to be closed", || {
        events(&log).iter().any(|e| e == "close resolver")
    })
    .await;
    assert_eq!(events(&log).iter().filter(|e| *e == "bind").count(), 1);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_serve_after_close_is_refused() {
    let stack = FakeStack::new(Remote::Echo);
    let log = Arc::clone(&stack.log);
    let outbound = Outbound::with_stack(
        vec![common::resolver()],
        vec![common::server()],
        TunnelSettings::default(),
        Arc::new(stack),
    );
    outbound.close().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let err = outbound.serve(listener).await.unwrap_err();
    assert!(matches!(err, TunnelError::SessionClosed));
    assert!(outbound.tunnel().is_none());
    assert!(events(&log).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_serve_and_close_release_every_layer() {
    for round in 0..50usize {
        let stack = FakeStack::new(Remote::Echo);
        let log = Arc::clone(&stack.log);
        let outbound = Arc::new(Outbound::with_stack(
            vec![common::resolver()],
            vec![common::server()],
            TunnelSettings::default(),
            Arc::new(stack),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = Arc::clone(&outbound);
        let serve = tokio::spawn(async move { serving.serve(listener).await });
        for _ in 0..round % 7 {
            tokio::task::yield_now().await;
        }
        outbound.close().await;

        let served = tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .unwrap()
            .unwrap();
        // a stage that loses the race fails either on entry or on completion
        if let Err(e) = served {
            assert!(
                matches!(
                    e.root(),
                    TunnelError::SessionClosed | TunnelError::IllegalTransition { .. }
                ),
                "round {}: {}",
                round,
                e
            );
        }
        assert!(outbound.tunnel().is_none(), "round {} left a tunnel behind", round);
        eventually("every opened layer to be closed", || {
            let (opened, closed) = opened_and_closed(&log);
            opened == closed
        })
        .await;
    }
}
