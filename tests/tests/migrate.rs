//! Endpoint migration mid-flow: the client roams to a new address every
//! ten messages; the server re-points its flow and no message is lost or
//! reordered.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skein_integration_tests::{LinkConfig, SimNet};
use std::time::Duration;

const MESSAGES: usize = 100;
const MIGRATE_EVERY: usize = 10;

#[test]
fn migration_preserves_order_and_content() {
    let link = LinkConfig { loss: 0.0, latency: Duration::from_millis(5) };
    let mut net = SimNet::new(2, link, 99);
    let (csh, ssh) = net.connect_pair(0, 1, "migrate", "test");

    let mut msg_rng = StdRng::seed_from_u64(4242);
    let mut sent_c2s: Vec<Vec<u8>> = Vec::new();
    let mut sent_s2c: Vec<Vec<u8>> = Vec::new();
    let mut got_c2s: Vec<Vec<u8>> = Vec::new();
    let mut got_s2c: Vec<Vec<u8>> = Vec::new();
    let mut migrations = 0u32;

    for i in 0..MESSAGES {
        // Random sizes 2^0..2^15.
        let c_len = 1usize << msg_rng.gen_range(0..16);
        let s_len = 1usize << msg_rng.gen_range(0..16);
        let c_msg: Vec<u8> = (0..c_len).map(|j| (i + j) as u8).collect();
        let s_msg: Vec<u8> = (0..s_len).map(|j| (i * 3 + j) as u8).collect();

        let now = net.now();
        net.host(0).write_message(csh, &c_msg, now).unwrap();
        let now = net.now();
        net.host(1).write_message(ssh, &s_msg, now).unwrap();
        sent_c2s.push(c_msg);
        sent_s2c.push(s_msg);

        // Every tenth message the client moves to a fresh address and the
        // server is told about the roam.
        if (i + 1) % MIGRATE_EVERY == 0 {
            migrations += 1;
            let fresh: std::net::SocketAddr =
                format!("10.0.{}.77:6000", migrations).parse().unwrap();
            net.set_addr(0, fresh);
            let now = net.now();
            net.host(1).migrate_peer(&SimNet::eid(0), fresh, now).unwrap();
        }

        // Drain for a while and harvest completed messages on both sides.
        net.run_for(Duration::from_millis(40));
        while let Some(m) = net.host(1).read_message(ssh, 1 << 16).unwrap() {
            got_c2s.push(m);
        }
        while let Some(m) = net.host(0).read_message(csh, 1 << 16).unwrap() {
            got_s2c.push(m);
        }
    }

    // Let retransmissions across the migrations settle.
    let mut idle_rounds = 0;
    while got_c2s.len() < MESSAGES || got_s2c.len() < MESSAGES {
        net.run_for(Duration::from_millis(50));
        while let Some(m) = net.host(1).read_message(ssh, 1 << 16).unwrap() {
            got_c2s.push(m);
        }
        while let Some(m) = net.host(0).read_message(csh, 1 << 16).unwrap() {
            got_s2c.push(m);
        }
        idle_rounds += 1;
        assert!(idle_rounds < 400, "messages stuck after migration");
    }

    assert_eq!(migrations, 10);
    assert_eq!(got_c2s, sent_c2s, "client-to-server order or content broken");
    assert_eq!(got_s2c, sent_s2c, "server-to-client order or content broken");
}
