//! Hierarchical substreams under loss: three children of one accepted
//! stream carry independent byte sequences; reordering and EOF on one
//! never stalls the others.

use skein_integration_tests::{LinkConfig, SimNet};
use skein_core::StreamHandle;
use std::time::Duration;

const PER_SUB: usize = 40_000;

#[test]
fn three_substreams_are_isolated() {
    let link = LinkConfig { loss: 0.10, latency: Duration::from_millis(8) };
    let mut net = SimNet::new(2, link, 314);
    let (csh, ssh) = net.connect_pair(0, 1, "subs", "test");

    // Client spawns three children and a distinct payload on each; the
    // first one also closes early.
    let mut subs: Vec<StreamHandle> = Vec::new();
    for i in 0..3u8 {
        let now = net.now();
        let sub = net.host(0).open_substream(csh, now).unwrap();
        let payload: Vec<u8> = (0..PER_SUB).map(|j| i.wrapping_add(j as u8)).collect();
        let now = net.now();
        net.host(0).write(sub, &payload, now).unwrap();
        subs.push(sub);
    }
    let now = net.now();
    net.host(0)
        .shutdown(subs[0], skein_stream::Shutdown::WRITE, now);

    // Server accepts the three children as they announce themselves.
    let mut accepted: Vec<StreamHandle> = Vec::new();
    let mut rounds = 0;
    while accepted.len() < 3 {
        assert!(net.step(), "substreams never arrived");
        while let Some(s) = net.host(1).accept_substream(ssh) {
            accepted.push(s);
        }
        rounds += 1;
        assert!(rounds < 100_000, "substreams never announced");
    }

    // Drain all three to completion despite the loss.
    let mut got: Vec<Vec<u8>> = vec![Vec::new(); 3];
    let mut rounds = 0;
    while got.iter().enumerate().any(|(i, g)| g.len() < PER_SUB && !net.host(1).at_end(accepted[i]))
    {
        if !net.step() {
            break;
        }
        for (i, &s) in accepted.iter().enumerate() {
            got[i].extend(net.host(1).read(s, usize::MAX / 2).unwrap());
        }
        rounds += 1;
        assert!(rounds < 500_000, "substream transfer stalled: {:?}", got.iter().map(Vec::len).collect::<Vec<_>>());
    }

    // Each child delivered its own byte sequence, in order, unmixed.
    let mut offsets: Vec<u8> = Vec::new();
    for g in &got {
        assert_eq!(g.len(), PER_SUB);
        let base = g[0];
        for (j, &b) in g.iter().enumerate() {
            assert_eq!(b, base.wrapping_add(j as u8), "corruption at offset {j}");
        }
        offsets.push(base);
    }
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1, 2]);

    // The closed child reports EOF; the others are still writable. Give
    // the EOF marker time to survive the lossy link, then drain it.
    let closed_idx = got.iter().position(|g| g[0] == 0).unwrap();
    net.run_for(Duration::from_secs(3));
    let _ = net.host(1).read(accepted[closed_idx], 64).unwrap();
    assert!(net.host(1).at_end(accepted[closed_idx]));
    let now = net.now();
    net.host(0).write(subs[2], b"postscript", now).unwrap();
    let mut tail = Vec::new();
    let open_idx = got.iter().position(|g| g[0] == 2).unwrap();
    let mut rounds = 0;
    while tail.len() < b"postscript".len() {
        assert!(net.step(), "postscript lost");
        tail.extend(net.host(1).read(accepted[open_idx], 64).unwrap());
        rounds += 1;
        assert!(rounds < 100_000);
    }
    assert_eq!(tail, b"postscript");
}
