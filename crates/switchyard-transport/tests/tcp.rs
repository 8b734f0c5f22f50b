//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on a random port and verify that records
//! survive the trip through the socket intact, including records whose
//! string contents contain braces.

use switchyard_transport::{
    Connection, TcpConnection, TcpTransport, Transport, TransportError,
};

async fn pair() -> (TcpConnection, TcpConnection) {
    let mut transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = transport.local_addr().expect("local addr").to_string();

    let server = tokio::spawn(async move {
        transport.accept().await.expect("should accept")
    });
    let client = TcpConnection::connect(&addr).await.expect("should connect");
    let server = server.await.expect("task should complete");
    (server, client)
}

#[tokio::test]
async fn test_tcp_send_and_receive_both_directions() {
    let (server, client) = pair().await;
    assert!(server.id().into_inner() > 0);
    assert_ne!(server.id(), client.id());

    server
        .send(br#"{"from":"server"}"#)
        .await
        .expect("send should succeed");
    let got = client.recv().await.expect("recv").expect("record");
    assert_eq!(got, br#"{"from":"server"}"#);

    client
        .send(br#"{"from":"client","note":"{not a brace}"}"#)
        .await
        .expect("send should succeed");
    let got = server.recv().await.expect("recv").expect("record");
    assert_eq!(got, br#"{"from":"client","note":"{not a brace}"}"#);
}

#[tokio::test]
async fn test_tcp_back_to_back_records_arrive_separately() {
    let (server, client) = pair().await;

    for i in 0..10 {
        client
            .send(format!(r#"{{"n":{i}}}"#).as_bytes())
            .await
            .expect("send");
    }

    for i in 0..10 {
        let got = server.recv().await.expect("recv").expect("record");
        assert_eq!(got, format!(r#"{{"n":{i}}}"#).into_bytes());
    }
}

#[tokio::test]
async fn test_tcp_recv_returns_none_after_peer_close() {
    let (server, client) = pair().await;

    client.close().await.expect("close should succeed");

    let result = server.recv().await.expect("recv should not error");
    assert!(result.is_none(), "should return None on clean close");
}

#[tokio::test]
async fn test_tcp_shutdown_stops_listening() {
    let mut transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = transport.local_addr().expect("local addr").to_string();

    transport.shutdown().await.expect("shutdown should succeed");

    assert!(transport.local_addr().is_err());
    assert!(matches!(
        transport.accept().await,
        Err(TransportError::Shutdown)
    ));
    assert!(
        TcpConnection::connect(&addr).await.is_err(),
        "port should no longer accept connections"
    );
    transport.shutdown().await.expect("second shutdown is a no-op");
}
