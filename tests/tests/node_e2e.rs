//! End-to-end over real UDP sockets on loopback: the async node shell,
//! transport pump, key setup, service negotiation, streams, substreams
//! and datagrams all in one exchange.

use skein_core::{Config, Eid};
use skein_stream::Node;
use std::net::SocketAddr;
use std::time::Duration;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[tokio::test(flavor = "multi_thread")]
async fn node_connects_and_exchanges() {
    let server = Node::bind(Config::default(), Eid::from("server"), loopback())
        .await
        .unwrap();
    let client = Node::bind(Config::default(), Eid::from("client"), loopback())
        .await
        .unwrap();

    let listener = server.listen("echo", "v1").unwrap();
    let server_addr = server.local_addr();

    let accept_task = tokio::spawn(async move {
        let stream = listener.accept().await;
        // Echo two messages back.
        for _ in 0..2 {
            let msg = stream.read_message(1 << 16).await.unwrap();
            stream.write_message(&msg).await.unwrap();
        }
        // Echo one datagram.
        let d = stream.read_datagram().await.unwrap();
        stream.write_datagram(&d).await.unwrap();
        // Accept a substream and drain it.
        let sub = stream.accept_substream().await.unwrap();
        let got = sub.read_message(1 << 16).await.unwrap();
        got
    });

    let stream = tokio::time::timeout(
        Duration::from_secs(10),
        client.connect(Eid::from("server"), "echo", "v1", Some(server_addr)),
    )
    .await
    .expect("connect timed out")
    .unwrap();

    stream.write_message(b"hello").await.unwrap();
    assert_eq!(stream.read_message(64).await.unwrap(), b"hello");
    let big: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
    stream.write_message(&big).await.unwrap();
    assert_eq!(stream.read_message(1 << 17).await.unwrap(), big);

    stream.write_datagram(b"fire and forget").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), stream.read_datagram())
        .await
        .expect("datagram echo timed out")
        .unwrap();
    assert_eq!(echoed, b"fire and forget");

    let sub = stream.open_substream().unwrap();
    sub.write_message(b"substream payload").await.unwrap();

    let server_got = tokio::time::timeout(Duration::from_secs(10), accept_task)
        .await
        .expect("server task timed out")
        .unwrap();
    assert_eq!(server_got, b"substream payload");
}
