//! Basic request/response over the simulated network: a 128-byte request
//! naming a reply length, answered with that many bytes.

use skein_integration_tests::{LinkConfig, SimNet};
use std::time::Duration;

const REQUEST_LEN: usize = 128;
const REPLY_LEN: usize = 4096;

fn build_request(reply_len: u32, pri: i32, flags: u32) -> Vec<u8> {
    let mut req = vec![0u8; REQUEST_LEN];
    req[0..4].copy_from_slice(&reply_len.to_be_bytes());
    req[4..8].copy_from_slice(&pri.to_be_bytes());
    req[8..12].copy_from_slice(&flags.to_be_bytes());
    req
}

#[test]
fn request_reply_roundtrip() {
    let mut net = SimNet::new(2, LinkConfig::default(), 7);
    let (csh, ssh) = net.connect_pair(0, 1, "web", "test");

    let now = net.now();
    net.host(0)
        .write_message(csh, &build_request(REPLY_LEN as u32, 0, 0), now)
        .unwrap();

    // Server: read the request, decode the reply length, answer.
    let request = loop {
        if let Some(msg) = net.host(1).read_message(ssh, 1024).unwrap() {
            break msg;
        }
        assert!(net.step(), "request never arrived");
    };
    assert_eq!(request.len(), REQUEST_LEN);
    let want = u32::from_be_bytes([request[0], request[1], request[2], request[3]]) as usize;
    assert_eq!(want, REPLY_LEN);

    let reply: Vec<u8> = (0..want).map(|i| (i % 256) as u8).collect();
    let now = net.now();
    net.host(1).write_message(ssh, &reply, now).unwrap();

    // Client: collect the reply and verify the byte count and content.
    let got = loop {
        if let Some(msg) = net.host(0).read_message(csh, want * 2).unwrap() {
            break msg;
        }
        assert!(net.step(), "reply never arrived");
    };
    assert_eq!(got.len(), REPLY_LEN);
    assert_eq!(got, reply);
    // The whole exchange is a handful of round trips.
    assert!(net.elapsed() < Duration::from_secs(2));
}

#[test]
fn many_sequential_requests() {
    let mut net = SimNet::new(2, LinkConfig::default(), 8);
    let (csh, ssh) = net.connect_pair(0, 1, "web", "test");

    for i in 1u32..=20 {
        let len = 64 * i as usize;
        let now = net.now();
        net.host(0)
            .write_message(csh, &build_request(len as u32, 0, 0), now)
            .unwrap();
        let request = loop {
            if let Some(msg) = net.host(1).read_message(ssh, 1024).unwrap() {
                break msg;
            }
            assert!(net.step());
        };
        let want = u32::from_be_bytes(request[0..4].try_into().unwrap()) as usize;
        let now = net.now();
        net.host(1).write_message(ssh, &vec![i as u8; want], now).unwrap();
        let reply = loop {
            if let Some(msg) = net.host(0).read_message(csh, want * 2).unwrap() {
                break msg;
            }
            assert!(net.step());
        };
        assert_eq!(reply.len(), len);
        assert!(reply.iter().all(|&b| b == i as u8));
    }
}
