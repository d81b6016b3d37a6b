//! The one-shot authentication handshake: client-side emission and
//! server-side reception of the first packet on a connection.
//!
//! The handshake's AES-128-CBC header is two chained blocks, but only
//! the second block's ciphertext ever goes on the wire. The first
//! block's ciphertext is never transmitted — both peers instead derive
//! it locally (as the CBC IV for the second block) from `masked_uid`,
//! which *is* sent in the clear. That's the same "don't transmit what
//! the peer can already reconstruct" trick the ChaCha20 IV suppression
//! uses (see `cipher` module docs).

use rand::RngCore;

use crate::cipher::{decrypt_block, encrypt_block};
use crate::framer::hmac_md5;

/// Bytes of the check-head prefix: 4 random bytes plus an 8-byte HMAC tag.
pub const CHECK_HEAD_LEN: usize = 12;
/// Bytes of `masked_uid` plus the one AES block carrying the auth fields.
pub const AUTH_BLOCK_LEN: usize = 4 + 16;
/// Bytes of the server-hash prefix that closes out the handshake header.
pub const SERVER_HASH_TAG_LEN: usize = 4;
/// Total size of the client's handshake header before any data payload.
pub const HANDSHAKE_HEADER_LEN: usize = CHECK_HEAD_LEN + AUTH_BLOCK_LEN + SERVER_HASH_TAG_LEN;

fn salt_password(user_key: &[u8], salt: &str) -> Vec<u8> {
    crate::kdf::salted_password(user_key, salt.as_bytes())
}

/// Fields carried inside the encrypted auth block.
pub struct AuthFields {
    pub utc: u32,
    pub local_client_id: [u8; 4],
    pub connection_id: u32,
    pub overhead: u16,
    pub send_tcp_mss: u16,
}

impl AuthFields {
    fn to_block(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&self.utc.to_le_bytes());
        b[4..8].copy_from_slice(&self.local_client_id);
        b[8..12].copy_from_slice(&self.connection_id.to_le_bytes());
        b[12..14].copy_from_slice(&self.overhead.to_le_bytes());
        b[14..16].copy_from_slice(&self.send_tcp_mss.to_le_bytes());
        b
    }

    fn from_block(b: &[u8; 16]) -> Self {
        Self {
            utc: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            local_client_id: b[4..8].try_into().unwrap(),
            connection_id: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            overhead: u16::from_le_bytes(b[12..14].try_into().unwrap()),
            send_tcp_mss: u16::from_le_bytes(b[14..16].try_into().unwrap()),
        }
    }
}

/// Everything the client learns about its own session once the
/// handshake header has been built, to be folded into `Session`.
pub struct ClientHandshake {
    pub wire: Vec<u8>,
    pub last_client_hash: [u8; 16],
    pub last_server_hash: [u8; 16],
    pub user_id: [u8; 4],
    pub user_key: Vec<u8>,
}

/// Build the client's first-packet handshake header (everything up to,
/// but not including, the framed data payload).
#[allow(clippy::too_many_arguments)]
pub fn build_client_handshake(
    server_key: &[u8],
    server_iv: &[u8],
    salt: &str,
    pinned_identity: Option<([u8; 4], Vec<u8>)>,
    fields: &AuthFields,
) -> ClientHandshake {
    let mut rand4 = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut rand4);

    let mac_key = [server_iv, server_key].concat();
    let check_head_hash = hmac_md5(&mac_key, &rand4);

    let (uid, user_key) = pinned_identity.unwrap_or_else(|| (rand4, server_key.to_vec()));
    let mut masked_uid = uid;
    for (m, h) in masked_uid.iter_mut().zip(&check_head_hash[8..12]) {
        *m ^= h;
    }

    let password = salt_password(&user_key, salt);
    let zero_iv = [0u8; 16];
    let block1_plain = {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&masked_uid);
        b
    };
    let c1 = encrypt_block(&password, &zero_iv, &block1_plain);
    let block2_cipher = encrypt_block(&password, &c1, &fields.to_block());

    let mut last_server_hash_key = Vec::with_capacity(4 + 16);
    last_server_hash_key.extend_from_slice(&masked_uid);
    last_server_hash_key.extend_from_slice(&block2_cipher);
    let last_server_hash = hmac_md5(&user_key, &last_server_hash_key);

    let mut wire = Vec::with_capacity(HANDSHAKE_HEADER_LEN);
    wire.extend_from_slice(&rand4);
    wire.extend_from_slice(&check_head_hash[..8]);
    wire.extend_from_slice(&masked_uid);
    wire.extend_from_slice(&block2_cipher);
    wire.extend_from_slice(&last_server_hash[..SERVER_HASH_TAG_LEN]);

    ClientHandshake {
        wire,
        last_client_hash: check_head_hash,
        last_server_hash,
        user_id: uid,
        user_key,
    }
}

/// Why the server didn't accept a handshake attempt. Every variant maps
/// to the same observable behaviour: silent raw pass-through, with a
/// poison response substituted for the very first packet.
#[derive(Debug)]
pub enum HandshakeRejected {
    /// Not a recognised client of this protocol at all (bad check-head).
    UnknownPrefix,
    /// Check-head passed but the per-user auth tag didn't.
    AuthFailed,
    /// Auth tag passed but the clock skew or replay guard rejected it.
    ReplayOrClockSkew,
}

pub struct ServerHandshake {
    pub consumed: usize,
    pub last_client_hash: [u8; 16],
    pub last_server_hash: [u8; 16],
    pub user_id: [u8; 4],
    pub fields: AuthFields,
}

/// Attempt to consume a client handshake header from `recv_buf`.
/// `lookup_user` resolves a uid to a key: `Ok(key)` if known, or the
/// caller's choice of fallback key when no table is configured — falling
/// back to the global key or `recv_iv` is the caller's call to make,
/// since it depends on whether per-user identities are configured at all.
pub fn try_accept_client_handshake(
    recv_buf: &[u8],
    server_key: &[u8],
    server_recv_iv: &[u8],
    salt: &str,
    lookup_user: impl FnOnce([u8; 4]) -> Vec<u8>,
) -> Result<Option<ServerHandshake>, HandshakeRejected> {
    if recv_buf.len() < CHECK_HEAD_LEN {
        return Ok(None);
    }
    let rand4: [u8; 4] = recv_buf[0..4].try_into().unwrap();
    let mac_key = [server_recv_iv, server_key].concat();
    let check_head_hash = hmac_md5(&mac_key, &rand4);
    if check_head_hash[..8] != recv_buf[4..12] {
        return Err(HandshakeRejected::UnknownPrefix);
    }

    if recv_buf.len() < HANDSHAKE_HEADER_LEN {
        return Ok(None);
    }

    let masked_uid: [u8; 4] = recv_buf[12..16].try_into().unwrap();
    let mut uid = masked_uid;
    for (m, h) in uid.iter_mut().zip(&check_head_hash[8..12]) {
        *m ^= h;
    }
    let user_key = lookup_user(uid);

    let block2_cipher: [u8; 16] = recv_buf[16..32].try_into().unwrap();
    let mut hash_input = Vec::with_capacity(4 + 16);
    hash_input.extend_from_slice(&masked_uid);
    hash_input.extend_from_slice(&block2_cipher);
    let last_server_hash = hmac_md5(&user_key, &hash_input);
    if last_server_hash[..SERVER_HASH_TAG_LEN] != recv_buf[32..36] {
        return Err(HandshakeRejected::AuthFailed);
    }

    let password = salt_password(&user_key, salt);
    let zero_iv = [0u8; 16];
    let block1_plain = {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&masked_uid);
        b
    };
    let c1 = encrypt_block(&password, &zero_iv, &block1_plain);
    let block2_plain = decrypt_block(&password, &c1, &block2_cipher);
    let fields = AuthFields::from_block(&block2_plain);

    Ok(Some(ServerHandshake {
        consumed: HANDSHAKE_HEADER_LEN,
        last_client_hash: check_head_hash,
        last_server_hash,
        user_id: uid,
        fields,
    }))
}

/// A client's randomised `send_tcp_mss` advertisement: `(be-random % 1024) + 400`.
pub fn random_send_tcp_mss() -> u16 {
    let mut b = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut b);
    (u16::from_be_bytes(b) % 1024) + 400
}

/// A `local_client_id` is reused across connections sharing one process
/// so the server can tell they're the same client; `connection_id`
/// increments per connection and the client id is only regenerated once
/// it would run out of room. A host proxy handling
/// many sequential connections under one identity keeps one of these
/// around rather than asking `Session` to track it.
pub struct ClientIdentityCounter {
    local_client_id: [u8; 4],
    connection_id: u32,
}

/// `connection_id` is regenerated once it would cross this threshold.
const CONNECTION_ID_ROLLOVER: u32 = 0xFF00_0000;

impl ClientIdentityCounter {
    pub fn new() -> Self {
        let mut counter = Self { local_client_id: [0; 4], connection_id: 0 };
        counter.reset();
        counter
    }

    fn reset(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.local_client_id);
        let mut seed = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut seed);
        self.connection_id = u32::from_le_bytes(seed) & 0x00FF_FFFF;
    }

    /// Hand out the next `(local_client_id, connection_id)` pair.
    pub fn next(&mut self) -> ([u8; 4], u32) {
        if self.connection_id > CONNECTION_ID_ROLLOVER {
            self.reset();
        }
        let pair = (self.local_client_id, self.connection_id);
        self.connection_id += 1;
        pair
    }
}

impl Default for ClientIdentityCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_counter_holds_client_id_across_connections() {
        let mut counter = ClientIdentityCounter::new();
        let (id_a, conn_a) = counter.next();
        let (id_b, conn_b) = counter.next();
        assert_eq!(id_a, id_b, "client id is stable across connections");
        assert_eq!(conn_b, conn_a + 1);
    }

    #[test]
    fn client_handshake_is_accepted_by_server() {
        let server_key = b"0123456789abcdef".to_vec();
        let server_iv = b"fedcba9876543210".to_vec();
        let salt = "auth_akarin_rand";

        let fields = AuthFields {
            utc: 1_700_000_000,
            local_client_id: [5, 6, 7, 8],
            connection_id: 9,
            overhead: 4,
            send_tcp_mss: 1400,
        };
        let hs = build_client_handshake(&server_key, &server_iv, salt, None, &fields);

        let accepted = try_accept_client_handshake(&hs.wire, &server_key, &server_iv, salt, |_uid| server_key.clone())
            .expect("no reject")
            .expect("complete header");

        assert_eq!(accepted.consumed, HANDSHAKE_HEADER_LEN);
        assert_eq!(accepted.last_client_hash, hs.last_client_hash);
        assert_eq!(accepted.last_server_hash, hs.last_server_hash);
        assert_eq!(accepted.user_id, hs.user_id);
        assert_eq!(accepted.fields.connection_id, 9);
        assert_eq!(accepted.fields.send_tcp_mss, 1400);
    }

    #[test]
    fn bad_check_head_is_rejected_as_unknown_prefix() {
        let server_key = b"0123456789abcdef".to_vec();
        let server_iv = b"fedcba9876543210".to_vec();
        let mut garbage = vec![0u8; HANDSHAKE_HEADER_LEN];
        garbage[0..4].copy_from_slice(&[1, 2, 3, 4]);

        let result = try_accept_client_handshake(&garbage, &server_key, &server_iv, "auth_akarin_rand", |_| server_key.clone());
        assert!(matches!(result, Err(HandshakeRejected::UnknownPrefix)));
    }

    #[test]
    fn wrong_user_key_fails_auth() {
        let server_key = b"0123456789abcdef".to_vec();
        let server_iv = b"fedcba9876543210".to_vec();
        let salt = "auth_akarin_rand";
        let fields = AuthFields {
            utc: 0,
            local_client_id: [0; 4],
            connection_id: 1,
            overhead: 0,
            send_tcp_mss: 400,
        };
        let hs = build_client_handshake(&server_key, &server_iv, salt, None, &fields);
        let wrong_key = b"different-key!!!".to_vec();
        let result = try_accept_client_handshake(&hs.wire, &server_key, &server_iv, salt, |_| wrong_key.clone());
        assert!(matches!(result, Err(HandshakeRejected::AuthFailed)));
    }

    #[test]
    fn pinned_identity_round_trips() {
        let server_key = b"serverkeyserverk".to_vec();
        let server_iv = b"serverivserveriv".to_vec();
        let salt = "auth_akarin_spec_a";
        let pinned_key = b"a-users-own-key!".to_vec();
        let fields = AuthFields {
            utc: 42,
            local_client_id: [9, 9, 9, 9],
            connection_id: 123,
            overhead: 7,
            send_tcp_mss: 1000,
        };
        let hs = build_client_handshake(&server_key, &server_iv, salt, Some(([1, 0, 0, 0], pinned_key.clone())), &fields);
        assert_eq!(hs.user_id, [1, 0, 0, 0]);

        let accepted = try_accept_client_handshake(&hs.wire, &server_key, &server_iv, salt, |uid| {
            assert_eq!(uid, [1, 0, 0, 0]);
            pinned_key.clone()
        })
        .unwrap()
        .unwrap();
        assert_eq!(accepted.fields.overhead, 7);
    }
}
