//! Host-supplied configuration: the `HostInfo` surface a proxy gives this
//! layer, and the `protocol_param` grammar both roles parse out of it.

use std::collections::HashMap;

/// What the host proxy must supply before a [`crate::session::Session`]
/// can be used. Mirrors the server-info struct a proxy typically already
/// has lying around; implementors read these out of their own config file
/// format and hand them to the session once per connection (or once per
/// listener, for the fields that don't vary per-connection).
pub trait HostInfo {
    /// The server's own key (used when no per-user table is configured).
    fn key(&self) -> &[u8];
    /// The server's send-direction IV, used in the header-check HMAC.
    fn iv(&self) -> &[u8];
    /// The server's receive-direction IV, used as a key fallback when
    /// users are configured but an unknown uid shows up.
    fn recv_iv(&self) -> &[u8];
    /// Bytes of overhead this host's outer layers add per packet.
    fn overhead(&self) -> u16;
    /// This host's MTU-derived MSS figure.
    fn tcp_mss(&self) -> u16;
    /// Raw `protocol_param` string, see [`parse_max_clients`] and
    /// [`parse_uid_key`].
    fn protocol_param(&self) -> &str;
    /// Configured per-user keys, empty if this deployment doesn't use
    /// per-user identities.
    fn users(&self) -> &HashMap<[u8; 4], Vec<u8>>;
}

/// A plain, owned [`HostInfo`] implementation for callers that don't
/// need to wire this trait through their own config type.
#[derive(Clone, Default)]
pub struct StaticHostInfo {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub recv_iv: Vec<u8>,
    pub overhead: u16,
    pub tcp_mss: u16,
    pub protocol_param: String,
    pub users: HashMap<[u8; 4], Vec<u8>>,
}

impl HostInfo for StaticHostInfo {
    fn key(&self) -> &[u8] {
        &self.key
    }
    fn iv(&self) -> &[u8] {
        &self.iv
    }
    fn recv_iv(&self) -> &[u8] {
        &self.recv_iv
    }
    fn overhead(&self) -> u16 {
        self.overhead
    }
    fn tcp_mss(&self) -> u16 {
        self.tcp_mss
    }
    fn protocol_param(&self) -> &str {
        &self.protocol_param
    }
    fn users(&self) -> &HashMap<[u8; 4], Vec<u8>> {
        &self.users
    }
}

/// Default replay-guard LRU capacity when `protocol_param` doesn't
/// override it.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Server-side grammar: a leading integer (the replay guard's per-client
/// LRU capacity), optionally followed by a `#`-delimited suffix that
/// other ShadowsocksR forks use for extra flags and that this layer
/// ignores. A missing or unparsable leading integer falls back to
/// [`DEFAULT_MAX_CLIENTS`] rather than erroring — the wire format never
/// rejects a malformed `protocol_param`.
pub fn parse_max_clients(protocol_param: &str) -> usize {
    let leading = protocol_param.split('#').next().unwrap_or("");
    leading.trim().parse().unwrap_or(DEFAULT_MAX_CLIENTS)
}

/// Client-side grammar: `"<uid>:<key>"` pins the client's identity;
/// absent this, the session generates a random uid and uses the
/// server's key directly. `uid` is a decimal integer encoded little-endian
/// into 4 bytes; `key` is taken as raw bytes of the string after the colon.
pub fn parse_uid_key(protocol_param: &str) -> Option<([u8; 4], Vec<u8>)> {
    let (uid_str, key_str) = protocol_param.split_once(':')?;
    let uid: u32 = uid_str.trim().parse().ok()?;
    Some((uid.to_le_bytes(), key_str.as_bytes().to_vec()))
}
