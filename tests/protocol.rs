//! End-to-end protocol tests driven entirely through the public API: a
//! client and server `Session` talking over an in-memory byte channel.

use std::collections::HashMap;
use std::sync::Arc;

use auth_akarin::{udp_client_post_decrypt, udp_client_pre_encrypt, udp_server_post_decrypt, udp_server_pre_encrypt};
use auth_akarin::{ReplayGuard, Session, StaticHostInfo, Variant};

fn host(overhead: u16, mss: u16, protocol_param: &str) -> StaticHostInfo {
    StaticHostInfo {
        key: b"0123456789abcdef".to_vec(),
        iv: b"fedcba9876543210".to_vec(),
        recv_iv: b"fedcba9876543210".to_vec(),
        overhead,
        tcp_mss: mss,
        protocol_param: protocol_param.to_string(),
        users: HashMap::new(),
    }
}

fn connected_pair(variant: Variant) -> (Session, Session, Arc<ReplayGuard>) {
    let guard = Arc::new(ReplayGuard::new(64));
    let mut client = Session::new_client(variant);
    client.set_server_info(&host(4, 1400, ""));
    let mut server = Session::new_server(variant, guard.clone());
    server.set_server_info(&host(4, 1400, "64"));
    (client, server, guard)
}

#[test]
fn handshake_and_data_round_trip_both_directions() {
    let (mut client, mut server, _guard) = connected_pair(Variant::Rand);

    let request = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
    let wire = client.client_pre_encrypt(request);
    let (received, sendback) = server.server_post_decrypt(&wire).expect("server accepts handshake");
    assert!(sendback, "server must ask to send back after a successful handshake");
    assert_eq!(received, request);

    let response = b"HTTP/1.1 200 OK\r\n\r\nhello";
    let wire_back = server.server_pre_encrypt(response);
    let decoded = client.client_post_decrypt(&wire_back).expect("client parses the MSS-prefixed first reply");
    assert_eq!(decoded, response);

    // The client's next outbound packet carries the queued 0xff00
    // acknowledgement command transparently; the server must still
    // recover the same plaintext.
    let more = client.client_pre_encrypt(b"more data");
    let (decoded_more, _) = server.server_post_decrypt(&more).unwrap();
    assert_eq!(decoded_more, b"more data");

    server.dispose();
}

#[test]
fn spec_a_variant_round_trips_too() {
    let (mut client, mut server, _guard) = connected_pair(Variant::SpecA);
    let wire = client.client_pre_encrypt(b"spec_a payload");
    let (received, sendback) = server.server_post_decrypt(&wire).unwrap();
    assert!(sendback);
    assert_eq!(received, b"spec_a payload");
}

#[test]
fn corrupted_handshake_yields_poison_not_a_panic() {
    let (mut client, mut server, _guard) = connected_pair(Variant::Rand);
    let mut wire = client.client_pre_encrypt(b"payload");
    let mid = wire.len() / 2;
    wire[mid] ^= 0xaa;

    let (reply, sendback) = server.server_post_decrypt(&wire).expect("never a hard error on the first packet");
    assert!(!sendback);
    assert_eq!(reply, vec![b'E'; 2048]);
}

#[test]
fn replayed_handshake_is_refused_on_second_delivery() {
    let (mut client, mut server_a, guard) = connected_pair(Variant::Rand);
    let wire = client.client_pre_encrypt(b"once only");

    let (_out, sendback_a) = server_a.server_post_decrypt(&wire).unwrap();
    assert!(sendback_a);

    let mut server_b = Session::new_server(Variant::Rand, guard);
    server_b.set_server_info(&host(4, 1400, "64"));
    let (reply, sendback_b) = server_b.server_post_decrypt(&wire).unwrap();
    assert!(!sendback_b, "identical connection id must be refused the second time");
    assert_eq!(reply, vec![b'E'; 2048]);
}

#[test]
fn pinned_client_identity_is_honoured_by_the_server() {
    let guard = Arc::new(ReplayGuard::new(64));
    let mut users = HashMap::new();
    users.insert(7u32.to_le_bytes(), b"a-pinned-users-key".to_vec());

    let mut client = Session::new_client(Variant::Rand);
    client.set_server_info(&host(4, 1400, "7:a-pinned-users-key"));

    let mut server = Session::new_server(Variant::Rand, guard);
    let mut server_info = host(4, 1400, "64");
    server_info.users = users;
    server.set_server_info(&server_info);

    let wire = client.client_pre_encrypt(b"pinned identity payload");
    let (received, sendback) = server.server_post_decrypt(&wire).unwrap();
    assert!(sendback);
    assert_eq!(received, b"pinned identity payload");
}

#[test]
fn get_overhead_matches_the_fixed_mac_tag_cost() {
    let client = Session::new_client(Variant::Rand);
    assert_eq!(client.get_overhead(), 4);
}

#[test]
fn udp_datagrams_round_trip_in_both_directions() {
    let server_key = [0u8; 16];
    let user_key = [0u8; 16];
    let uid = [0, 0, 0, 1];

    let datagram = udp_client_pre_encrypt(b"ping", &server_key, uid, &user_key);
    let (plaintext, decoded_uid) =
        udp_server_post_decrypt(&datagram, &server_key, |_uid| Some(user_key.to_vec())).expect("authenticates");
    assert_eq!(plaintext, b"ping");
    assert_eq!(decoded_uid, uid);

    let reply = udp_server_pre_encrypt(b"pong", &server_key, &user_key);
    let decoded_reply = udp_client_post_decrypt(&reply, &server_key, &user_key);
    assert_eq!(decoded_reply, b"pong");
}
