//! Session: the per-connection state machine tying the handshake,
//! framer, cipher and replay guard together into the two entry points a
//! host proxy actually calls — `*_pre_encrypt` and `*_post_decrypt`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use zeroize::Zeroizing;

use crate::cipher::SessionCipher;
use crate::config::HostInfo;
use crate::error::ObfsError;
use crate::framer::{self, PaddingStrategy};
use crate::handshake::{self, AuthFields, ClientIdentityCounter, HandshakeRejected};
use crate::kdf::double_base64_password;
use crate::prng::Xorshift128Plus;
use crate::replay::ReplayGuard;

/// A receive buffer beyond this is treated as a corrupt stream rather
/// than a slow client — the connection is torn down rather than resynced.
const MAX_RECV_BUFFER: usize = 8192;

/// Allowed clock skew between the client's handshake timestamp and this
/// host's own clock, in seconds.
const MAX_CLOCK_SKEW_SECS: u32 = 86_400;

/// Substituted for the first packet of a connection the server has
/// decided to reject, so a passive observer sees a plausible-looking
/// response rather than a dropped connection.
fn poison_bytes() -> Vec<u8> {
    vec![b'E'; 2048]
}

fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as u32
}

fn random_u16() -> u16 {
    let mut b = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut b);
    u16::from_le_bytes(b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Which of the two `auth_akarin` methods this session speaks. Controls
/// the handshake's salt and which padding-length table the framer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Rand,
    SpecA,
}

impl Variant {
    fn salt(self) -> &'static str {
        match self {
            Variant::Rand => "auth_akarin_rand",
            Variant::SpecA => "auth_akarin_spec_a",
        }
    }
}

/// One side of one connection. Constructed once per connection (`new_client`
/// / `new_server`), configured once via [`Session::set_server_info`], then
/// driven purely through the four `*_encrypt`/`*_decrypt` methods.
pub struct Session {
    role: Role,
    variant: Variant,
    padding: Option<PaddingStrategy>,

    server_key: Vec<u8>,
    server_iv: Vec<u8>,
    recv_iv: Vec<u8>,
    users: HashMap<[u8; 4], Vec<u8>>,

    my_overhead: u16,
    host_tcp_mss: u16,
    replay_guard: Option<Arc<ReplayGuard>>,
    pinned_identity: Option<([u8; 4], Vec<u8>)>,

    user_id: [u8; 4],
    user_key: Zeroizing<Vec<u8>>,
    last_client_hash: [u8; 16],
    last_server_hash: [u8; 16],
    pack_id: u32,
    recv_id: u32,
    random_client: Xorshift128Plus,
    random_server: Xorshift128Plus,
    cipher: Option<SessionCipher>,

    send_tcp_mss: u16,
    recv_tcp_mss: u16,
    new_send_tcp_mss: u16,
    client_over_head: u16,

    has_sent_header: bool,
    has_recv_header: bool,
    raw_trans: bool,

    send_back_cmd: VecDeque<u16>,
    recv_buf: Vec<u8>,
    unit_len: usize,

    local_client_id: [u8; 4],
    connection_id: u32,
    peer_client_id: [u8; 4],
}

impl Session {
    fn blank(role: Role, variant: Variant) -> Self {
        Self {
            role,
            variant,
            padding: None,
            server_key: Vec::new(),
            server_iv: Vec::new(),
            recv_iv: Vec::new(),
            users: HashMap::new(),
            my_overhead: 0,
            host_tcp_mss: 1460,
            replay_guard: None,
            pinned_identity: None,
            user_id: [0; 4],
            user_key: Zeroizing::new(Vec::new()),
            last_client_hash: [0; 16],
            last_server_hash: [0; 16],
            pack_id: 1,
            recv_id: 1,
            random_client: Xorshift128Plus::new(),
            random_server: Xorshift128Plus::new(),
            cipher: None,
            send_tcp_mss: 1460,
            recv_tcp_mss: 1460,
            new_send_tcp_mss: 1460,
            client_over_head: 0,
            has_sent_header: false,
            has_recv_header: false,
            raw_trans: false,
            send_back_cmd: VecDeque::new(),
            recv_buf: Vec::new(),
            unit_len: 2800,
            local_client_id: [0; 4],
            connection_id: 0,
            peer_client_id: [0; 4],
        }
    }

    pub fn new_client(variant: Variant) -> Self {
        Self::blank(Role::Client, variant)
    }

    pub fn new_server(variant: Variant, replay_guard: Arc<ReplayGuard>) -> Self {
        let mut s = Self::blank(Role::Server, variant);
        s.replay_guard = Some(replay_guard);
        s
    }

    /// Use an existing client identity (stable across connections sharing
    /// one process) rather than generating one fresh per session.
    pub fn with_identity(mut self, counter: &mut ClientIdentityCounter) -> Self {
        let (local_client_id, connection_id) = counter.next();
        self.local_client_id = local_client_id;
        self.connection_id = connection_id;
        self
    }

    /// Configure this session from the host's proxy-supplied info. Must be
    /// called exactly once, before the first `*_pre_encrypt`/`*_post_decrypt`.
    pub fn set_server_info(&mut self, info: &dyn HostInfo) {
        self.server_key = info.key().to_vec();
        self.server_iv = info.iv().to_vec();
        self.recv_iv = info.recv_iv().to_vec();
        self.my_overhead = info.overhead();
        self.host_tcp_mss = info.tcp_mss();
        self.users = info.users().clone();

        self.padding = Some(match self.variant {
            Variant::Rand => PaddingStrategy::Rand,
            Variant::SpecA => PaddingStrategy::spec_a_from_server_key(&self.server_key),
        });

        if self.role == Role::Client {
            self.pinned_identity = crate::config::parse_uid_key(info.protocol_param());
            self.send_tcp_mss = handshake::random_send_tcp_mss();
            if self.local_client_id == [0; 4] && self.connection_id == 0 {
                let mut rnd = [0u8; 4];
                rand::thread_rng().fill_bytes(&mut rnd);
                self.local_client_id = rnd;
                self.connection_id = (random_u16() as u32) << 8;
            }
        }
    }

    // ---- client path -----------------------------------------------

    pub fn client_pre_encrypt(&mut self, buf: &[u8]) -> Vec<u8> {
        if self.raw_trans {
            return buf.to_vec();
        }

        let mut out = Vec::new();
        if !self.has_sent_header {
            let fields = AuthFields {
                utc: unix_now(),
                local_client_id: self.local_client_id,
                connection_id: self.connection_id,
                overhead: self.my_overhead,
                send_tcp_mss: self.send_tcp_mss,
            };
            let hs = handshake::build_client_handshake(
                &self.server_key,
                &self.server_iv,
                self.variant.salt(),
                self.pinned_identity.clone(),
                &fields,
            );

            self.last_client_hash = hs.last_client_hash;
            self.last_server_hash = hs.last_server_hash;
            self.user_id = hs.user_id;
            self.user_key = Zeroizing::new(hs.user_key);
            self.client_over_head = self.my_overhead;

            let password = double_base64_password(&self.user_key, &self.last_client_hash);
            let encrypt_iv: [u8; 8] = self.last_client_hash[0..8].try_into().unwrap();
            let decrypt_iv: [u8; 8] = self.last_server_hash[0..8].try_into().unwrap();
            self.cipher = Some(SessionCipher::new(&password, &encrypt_iv, &decrypt_iv));

            out.extend_from_slice(&hs.wire);
            self.has_sent_header = true;

            let first_len = (random_u16() as usize % 31 + handshake::HANDSHAKE_HEADER_LEN).min(buf.len());
            out.extend(self.pack_client_chunk(&buf[..first_len]));
            self.queue_remaining_client(&buf[first_len..], &mut out);
        } else {
            self.queue_remaining_client(buf, &mut out);
        }
        out
    }

    fn pack_client_chunk(&mut self, chunk: &[u8]) -> Vec<u8> {
        let with_cmd = self.send_back_cmd.pop_front().is_some();
        let cipher = self.cipher.as_mut().expect("handshake already built the cipher");
        framer::pack_client_data(
            chunk,
            cipher,
            &mut self.last_client_hash,
            &mut self.pack_id,
            &self.user_key,
            &mut self.random_client,
            self.padding.as_ref().expect("configured"),
            self.client_over_head,
            self.send_tcp_mss,
            with_cmd,
        )
    }

    fn queue_remaining_client(&mut self, buf: &[u8], out: &mut Vec<u8>) {
        if buf.is_empty() && self.send_back_cmd.is_empty() {
            return;
        }
        if buf.is_empty() {
            out.extend(self.pack_client_chunk(&[]));
            return;
        }
        for chunk in buf.chunks(self.unit_len) {
            out.extend(self.pack_client_chunk(chunk));
        }
    }

    pub fn client_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, ObfsError> {
        if self.raw_trans {
            return Ok(buf.to_vec());
        }
        self.recv_buf.extend_from_slice(buf);
        if self.recv_buf.len() > MAX_RECV_BUFFER {
            self.raw_trans = true;
            self.recv_buf.clear();
            return Err(ObfsError::Framing("receive buffer exceeded bound before a packet completed"));
        }

        let mut out = Vec::new();
        loop {
            let cipher = self.cipher.as_mut().expect("handshake already built the cipher");
            let result = framer::try_unpack_server_packet(
                &self.recv_buf,
                cipher,
                &mut self.last_server_hash,
                &mut self.recv_id,
                &self.user_key,
                &mut self.random_server,
                self.padding.as_ref().expect("configured"),
                self.client_over_head,
                self.recv_tcp_mss,
            );
            match result {
                Ok(Some(mut parsed)) => {
                    self.recv_buf.drain(..parsed.consumed);
                    if self.recv_id == 2 {
                        if parsed.plaintext.len() < 2 {
                            self.raw_trans = true;
                            self.recv_buf.clear();
                            return Err(ObfsError::Framing("first server reply missing its MSS prefix"));
                        }
                        self.recv_tcp_mss = u16::from_le_bytes([parsed.plaintext[0], parsed.plaintext[1]]);
                        self.send_back_cmd.push_back(0xff00);
                        parsed.plaintext.drain(..2);
                    }
                    out.extend(parsed.plaintext);
                }
                Ok(None) => break,
                Err(fault) => {
                    self.raw_trans = true;
                    self.recv_buf.clear();
                    return Err(match fault {
                        framer::FrameFault::MacMismatch => ObfsError::MacMismatch,
                        framer::FrameFault::Oversize => ObfsError::Framing("server packet failed to parse"),
                    });
                }
            }
        }
        Ok(out)
    }

    // ---- server path -------------------------------------------------

    pub fn server_pre_encrypt(&mut self, buf: &[u8]) -> Vec<u8> {
        if self.raw_trans {
            return buf.to_vec();
        }
        if buf.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut remaining = buf;
        loop {
            let unit = self.unit_len.max(1);
            let split = remaining.len().min(unit);
            let (chunk, rest) = remaining.split_at(split);
            let is_first_packet = self.pack_id == 1;

            let mut payload = Vec::new();
            if is_first_packet {
                self.new_send_tcp_mss = self.host_tcp_mss.min(1500);
                payload.extend_from_slice(&self.new_send_tcp_mss.to_le_bytes());
            }
            payload.extend_from_slice(chunk);

            let pack_id = self.pack_id;
            let cipher = self.cipher.as_mut().expect("handshake already accepted before server_pre_encrypt");
            let packet = framer::pack_server_data(
                &payload,
                cipher,
                &mut self.last_server_hash,
                pack_id,
                &self.user_key,
                &mut self.random_server,
                self.padding.as_ref().expect("configured"),
                self.client_over_head,
                self.send_tcp_mss,
            );
            out.extend(packet);
            self.pack_id = self.pack_id.wrapping_add(1);

            if is_first_packet {
                self.send_tcp_mss = self.new_send_tcp_mss;
                self.unit_len = self.send_tcp_mss.saturating_sub(self.client_over_head).max(1) as usize;
            }

            remaining = rest;
            if remaining.is_empty() {
                break;
            }
        }
        out
    }

    pub fn server_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, bool), ObfsError> {
        if self.raw_trans {
            return Ok((buf.to_vec(), false));
        }
        self.recv_buf.extend_from_slice(buf);
        if self.recv_buf.len() > MAX_RECV_BUFFER {
            self.raw_trans = true;
            self.recv_buf.clear();
            return Ok((poison_bytes(), false));
        }

        let mut out = Vec::new();
        let mut sendback = false;

        if !self.has_recv_header {
            let users = self.users.clone();
            let fallback_key = if users.is_empty() { self.server_key.clone() } else { self.recv_iv.clone() };
            let lookup = |uid: [u8; 4]| users.get(&uid).cloned().unwrap_or_else(|| fallback_key.clone());

            let accepted = match handshake::try_accept_client_handshake(
                &self.recv_buf,
                &self.server_key,
                &self.recv_iv,
                self.variant.salt(),
                lookup,
            ) {
                Ok(None) => return Ok((Vec::new(), false)),
                Ok(Some(accepted)) => accepted,
                Err(HandshakeRejected::AuthFailed) => {
                    tracing::error!("handshake data uncorrect auth HMAC-MD5");
                    self.raw_trans = true;
                    self.recv_buf.clear();
                    return Ok((poison_bytes(), false));
                }
                Err(HandshakeRejected::UnknownPrefix | HandshakeRejected::ReplayOrClockSkew) => {
                    self.raw_trans = true;
                    self.recv_buf.clear();
                    return Ok((poison_bytes(), false));
                }
            };

            let skew = unix_now().abs_diff(accepted.fields.utc);
            if skew > MAX_CLOCK_SKEW_SECS {
                tracing::warn!(skew, "handshake timestamp outside allowed clock skew");
                self.raw_trans = true;
                self.recv_buf.clear();
                return Ok((poison_bytes(), false));
            }

            let conn_id = accepted.fields.connection_id as i64;
            let replay_guard = self.replay_guard.clone().expect("server session always carries a replay guard");
            if !replay_guard.insert(accepted.user_id, accepted.fields.local_client_id, conn_id) {
                tracing::warn!(uid = ?accepted.user_id, "replay guard refused handshake");
                self.raw_trans = true;
                self.recv_buf.clear();
                return Ok((poison_bytes(), false));
            }

            self.user_id = accepted.user_id;
            self.user_key = Zeroizing::new(self.users.get(&accepted.user_id).cloned().unwrap_or_else(|| fallback_key.clone()));
            self.last_client_hash = accepted.last_client_hash;
            self.last_server_hash = accepted.last_server_hash;
            self.client_over_head = accepted.fields.overhead;
            self.recv_tcp_mss = accepted.fields.send_tcp_mss;
            self.peer_client_id = accepted.fields.local_client_id;

            let password = double_base64_password(&self.user_key, &self.last_server_hash);
            let encrypt_iv: [u8; 8] = self.last_server_hash[0..8].try_into().unwrap();
            let decrypt_iv: [u8; 8] = self.last_client_hash[0..8].try_into().unwrap();
            self.cipher = Some(SessionCipher::new(&password, &encrypt_iv, &decrypt_iv));

            self.recv_buf.drain(..accepted.consumed);
            self.has_recv_header = true;
            sendback = true;
        }

        loop {
            let cipher = self.cipher.as_mut().expect("handshake already accepted above");
            let result = framer::try_unpack_client_packet(
                &self.recv_buf,
                cipher,
                &mut self.last_client_hash,
                &mut self.recv_id,
                &self.user_key,
                &mut self.random_client,
                self.padding.as_ref().expect("configured"),
                self.client_over_head,
                &mut self.recv_tcp_mss,
                self.send_tcp_mss,
            );
            match result {
                Ok(Some(parsed)) => {
                    if parsed.plaintext.is_empty() {
                        sendback = true;
                    }
                    self.recv_buf.drain(..parsed.consumed);
                    out.extend(parsed.plaintext);
                }
                Ok(None) => break,
                Err(fault) => {
                    self.raw_trans = true;
                    self.recv_buf.clear();
                    if self.recv_id == 1 {
                        return Ok((poison_bytes(), false));
                    }
                    return Err(match fault {
                        framer::FrameFault::MacMismatch => ObfsError::MacMismatch,
                        framer::FrameFault::Oversize => ObfsError::Framing("client packet failed to parse"),
                    });
                }
            }
        }

        Ok((out, sendback))
    }

    /// Fixed per-packet MAC overhead this layer adds, for the host proxy's
    /// own MTU bookkeeping.
    pub fn get_overhead(&self) -> u16 {
        4
    }

    /// Release this session's hold on the replay guard's window, once the
    /// connection is torn down.
    pub fn dispose(&mut self) {
        if self.role == Role::Server {
            if let Some(guard) = &self.replay_guard {
                guard.release(self.user_id, self.peer_client_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticHostInfo;
    use std::collections::HashMap;

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

    #[test]
    fn full_round_trip_client_to_server_and_back() {
        let guard = Arc::new(ReplayGuard::new(64));
        let mut client = Session::new_client(Variant::Rand);
        client.set_server_info(&host(4, 1400, ""));

        let mut server = Session::new_server(Variant::Rand, guard);
        server.set_server_info(&host(4, 1400, "64"));

        let wire = client.client_pre_encrypt(b"hello server");
        let (decoded, sendback) = server.server_post_decrypt(&wire).expect("handshake accepted");
        assert!(sendback);
        assert_eq!(decoded, b"hello server");

        let reply = server.server_pre_encrypt(b"hi client");
        let decoded_reply = client.client_post_decrypt(&reply).expect("first reply parses");
        assert_eq!(decoded_reply, b"hi client");

        server.dispose();
    }

    #[test]
    fn tampered_post_handshake_packet_surfaces_mac_mismatch() {
        let guard = Arc::new(ReplayGuard::new(64));
        let mut client = Session::new_client(Variant::Rand);
        client.set_server_info(&host(4, 1400, ""));
        let mut server = Session::new_server(Variant::Rand, guard);
        server.set_server_info(&host(4, 1400, "64"));

        let wire = client.client_pre_encrypt(b"hello server");
        let (_decoded, sendback) = server.server_post_decrypt(&wire).expect("handshake accepted");
        assert!(sendback);

        let mut second = client.client_pre_encrypt(b"second packet");
        let last = second.len() - 1;
        second[last] ^= 0xff;

        let err = server.server_post_decrypt(&second).expect_err("tag no longer matches the recomputed MAC");
        assert!(matches!(err, ObfsError::MacMismatch), "expected MacMismatch, got {err:?}");
    }

    #[test]
    fn tampered_handshake_is_poisoned_not_fatal() {
        let guard = Arc::new(ReplayGuard::new(64));
        let mut client = Session::new_client(Variant::Rand);
        client.set_server_info(&host(4, 1400, ""));
        let mut server = Session::new_server(Variant::Rand, guard);
        server.set_server_info(&host(4, 1400, "64"));

        let mut wire = client.client_pre_encrypt(b"payload");
        wire[0] ^= 0xff;
        let (reply, sendback) = server.server_post_decrypt(&wire).expect("poisoned, not an error");
        assert!(!sendback);
        assert_eq!(reply.len(), 2048);
        assert!(reply.iter().all(|&b| b == b'E'));
    }

    #[test]
    fn replay_of_same_connection_id_is_poisoned() {
        let guard = Arc::new(ReplayGuard::new(64));
        let mut client = Session::new_client(Variant::Rand);
        client.set_server_info(&host(4, 1400, ""));
        let wire = client.client_pre_encrypt(b"payload");

        let mut server_a = Session::new_server(Variant::Rand, guard.clone());
        server_a.set_server_info(&host(4, 1400, "64"));
        let (_out, sendback_a) = server_a.server_post_decrypt(&wire).unwrap();
        assert!(sendback_a);

        let mut server_b = Session::new_server(Variant::Rand, guard);
        server_b.set_server_info(&host(4, 1400, "64"));
        let (reply, sendback_b) = server_b.server_post_decrypt(&wire).unwrap();
        assert!(!sendback_b);
        assert!(reply.iter().all(|&b| b == b'E'));
    }
}
