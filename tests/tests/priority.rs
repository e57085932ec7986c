//! Strict priority scheduling: ten concurrent downloads share one flow;
//! raising one stream's priority mid-transfer starves the rest until it
//! drains. The boost request travels as a tiny substream message, the way
//! an application would re-prioritize a fetch in flight.

use skein_core::{Config, StreamHandle};
use skein_integration_tests::{LinkConfig, SimNet};
use skein_stream::host::Event;
use std::time::Duration;

const STREAMS: usize = 10;
const PER_STREAM: usize = 200_000;
const BOOSTED: usize = 7;

#[test]
fn boosted_stream_dominates_the_flow() {
    let link = LinkConfig { loss: 0.0, latency: Duration::from_millis(5) };
    // A modest window cap keeps the flow bandwidth-limited, so the
    // scheduler, not the in-flight backlog, decides who progresses.
    let cfg = Config { cwnd_max: 8, ..Config::default() };
    let mut net = SimNet::with_config(cfg, 2, link, 5);

    net.host(1).listen("bulk", "test").unwrap();
    let server_addr = net.addr(1);

    // Client opens ten download streams.
    let mut client_streams: Vec<StreamHandle> = Vec::new();
    for _ in 0..STREAMS {
        let now = net.now();
        let sh = net
            .host(0)
            .connect(SimNet::eid(1), "bulk", "test", Some(server_addr), now)
            .unwrap();
        client_streams.push(sh);
    }
    net.run_for(Duration::from_millis(300));

    // Server accepts them and queues one download per stream, each filled
    // with a distinct byte so the client can tell them apart.
    let mut server_streams: Vec<StreamHandle> = Vec::new();
    while let Some(sh) = net.host(1).accept("bulk", "test") {
        server_streams.push(sh);
    }
    assert_eq!(server_streams.len(), STREAMS);
    for (i, &sh) in server_streams.iter().enumerate() {
        let now = net.now();
        net.host(1).write(sh, &vec![i as u8; PER_STREAM], now).unwrap();
    }

    let mut received: Vec<Vec<u8>> = vec![Vec::new(); STREAMS];
    fn tally(
        net: &mut SimNet,
        client_streams: &[StreamHandle],
        received: &mut [Vec<u8>],
    ) {
        for (i, &sh) in client_streams.iter().enumerate() {
            let chunk = net.host(0).read(sh, usize::MAX / 2).unwrap();
            received[i].extend(chunk);
        }
    }

    // Run until roughly half of the total has been delivered.
    let mut rounds = 0;
    loop {
        assert!(net.step(), "transfer stalled");
        tally(&mut net, &client_streams, &mut received);
        let total: usize = received.iter().map(Vec::len).sum();
        if total >= STREAMS * PER_STREAM / 2 {
            break;
        }
        rounds += 1;
        assert!(rounds < 500_000, "transfer too slow");
    }

    // The boosted client stream signals its new priority through a
    // zero-payload substream carrying the priority integer.
    let now = net.now();
    let signal = net.host(0).open_substream(client_streams[BOOSTED], now).unwrap();
    let now = net.now();
    net.host(0)
        .write_message(signal, &1i32.to_be_bytes(), now)
        .unwrap();

    // Server side: watch for the substream and apply the priority to the
    // stream it arrived on.
    let mut boosted_server: Option<StreamHandle> = None;
    let mut waited = 0;
    while boosted_server.is_none() {
        assert!(net.step());
        tally(&mut net, &client_streams, &mut received);
        for ev in net.drain_events(1) {
            if let Event::NewSubstream(parent) = ev {
                if let Some(sub) = net.host(1).accept_substream(parent) {
                    let msg = loop {
                        if let Some(m) = net.host(1).read_message(sub, 16).unwrap() {
                            break m;
                        }
                        assert!(net.step());
                    };
                    let pri = i32::from_be_bytes(msg[..4].try_into().unwrap());
                    net.host(1).set_priority(parent, pri);
                    boosted_server = Some(parent);
                }
            }
        }
        waited += 1;
        assert!(waited < 20_000, "priority signal never arrived");
    }
    let before: Vec<usize> = received.iter().map(Vec::len).collect();
    assert!(
        before[BOOSTED] < PER_STREAM,
        "boosted stream already finished before the boost"
    );

    // While the boosted stream drains, the others should be starved: its
    // delivery rate must dwarf the aggregate of the rest.
    let mut rounds = 0;
    while received[BOOSTED].len() < PER_STREAM {
        assert!(net.step(), "boosted stream stalled");
        tally(&mut net, &client_streams, &mut received);
        rounds += 1;
        assert!(rounds < 500_000, "boosted stream never completed");
    }
    let boosted_delta = received[BOOSTED].len() - before[BOOSTED];
    let others_delta: usize = (0..STREAMS)
        .filter(|&i| i != BOOSTED)
        .map(|i| received[i].len() - before[i])
        .sum();
    assert!(
        boosted_delta >= 5 * others_delta.max(1),
        "boosted {boosted_delta} vs others {others_delta}"
    );

    // Everything still completes, undamaged, in distinct byte colors.
    let mut rounds = 0;
    while received.iter().any(|r| r.len() < PER_STREAM) {
        if !net.step() {
            break;
        }
        tally(&mut net, &client_streams, &mut received);
        rounds += 1;
        assert!(rounds < 500_000, "downloads never completed");
    }
    let mut colors: Vec<u8> = Vec::new();
    for r in &received {
        assert_eq!(r.len(), PER_STREAM);
        let color = r[0];
        assert!(r.iter().all(|&b| b == color), "mixed bytes within a stream");
        colors.push(color);
    }
    colors.sort_unstable();
    let expected: Vec<u8> = (0..STREAMS as u8).collect();
    assert_eq!(colors, expected, "each download must map to one distinct source");
}
