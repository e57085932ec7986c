//! Best-effort datagrams across a lossy link. Small datagrams ride
//! stateless fragments and may be lost; large ones fall back to reliable
//! ephemeral substreams and always arrive.

use skein_integration_tests::{LinkConfig, SimNet};
use std::collections::HashMap;
use std::time::Duration;

const COUNT: usize = 100;

fn payload_for(exp: u32) -> Vec<u8> {
    vec![exp as u8; 1 << exp]
}

#[test]
fn datagrams_over_lossy_link() {
    let link = LinkConfig { loss: 0.10, latency: Duration::from_millis(10) };
    let mut net = SimNet::new(2, link, 42);
    let (csh, ssh) = net.connect_pair(0, 1, "dgram", "test");
    let stateless_max = net.host(0).config().max_stateless_datagram();

    // Sizes 2^4..2^15, cycling.
    let mut sent: Vec<u32> = Vec::new();
    for i in 0..COUNT {
        let exp = 4 + (i as u32 % 12);
        sent.push(exp);
        let data = payload_for(exp);
        let now = net.now();
        net.host(0).write_datagram(csh, &data, now).unwrap();
        net.run_for(Duration::from_millis(5));
    }
    // Let reliable carriers finish retransmitting.
    net.run_for(Duration::from_secs(5));

    // Collect everything the server can read.
    let mut got: Vec<Vec<u8>> = Vec::new();
    loop {
        match net.host(1).read_datagram(ssh).unwrap() {
            Some(d) => got.push(d),
            None => break,
        }
    }

    // Every datagram that arrived must be intact.
    let mut per_exp: HashMap<u8, usize> = HashMap::new();
    for d in &got {
        assert!(!d.is_empty());
        let exp = d[0];
        assert_eq!(d.len(), 1 << exp, "truncated datagram");
        assert!(d.iter().all(|&b| b == exp), "corrupted datagram");
        *per_exp.entry(exp).or_default() += 1;
    }

    // Large datagrams took the reliable substream path: none lost.
    let mut reliable_sent: HashMap<u8, usize> = HashMap::new();
    for &exp in &sent {
        if (1usize << exp) > stateless_max {
            *reliable_sent.entry(exp as u8).or_default() += 1;
        }
    }
    for (exp, n) in reliable_sent {
        assert_eq!(
            per_exp.get(&exp).copied().unwrap_or(0),
            n,
            "reliable datagram of size 2^{exp} lost"
        );
    }

    // Across the configured 10% loss, the overwhelming majority arrives
    // intact (multi-fragment stateless datagrams amplify per-packet loss,
    // so the expected yield sits just under nine in ten).
    assert!(
        got.len() >= 80,
        "only {} of {COUNT} datagrams delivered",
        got.len()
    );
}

#[test]
fn lossless_link_delivers_all_datagrams() {
    let mut net = SimNet::new(2, LinkConfig::default(), 43);
    let (csh, ssh) = net.connect_pair(0, 1, "dgram", "test");

    for i in 0..20 {
        let exp = 4 + (i as u32 % 10);
        let now = net.now();
        net.host(0).write_datagram(csh, &payload_for(exp), now).unwrap();
        net.run_for(Duration::from_millis(2));
    }
    net.run_for(Duration::from_secs(1));

    let mut count = 0;
    while let Some(d) = net.host(1).read_datagram(ssh).unwrap() {
        assert_eq!(d.len(), 1 << d[0]);
        count += 1;
    }
    assert_eq!(count, 20);
}
