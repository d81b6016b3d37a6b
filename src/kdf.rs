//! OpenSSL-style `EVP_BytesToKey` password stretching.
//!
//! Every cipher in this protocol is keyed by an arbitrary-length password —
//! `base64(secret) || salt`, never a fixed-size key directly — stretched
//! into real key bytes with the classic repeated-MD5 construction that
//! OpenSSL's `EVP_BytesToKey` uses. This is that construction, so every
//! AES-128-CBC and ChaCha20 instantiation in this crate derives the same
//! key bytes a peer would from the same password.

use md5::{Digest, Md5};

/// Stretch `password` into `out_len` key bytes via repeated MD5.
pub fn bytes_to_key(password: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 16);
    let mut prev: Option<[u8; 16]> = None;
    while out.len() < out_len {
        let mut m = Md5::new();
        if let Some(p) = prev {
            m.update(p);
        }
        m.update(password);
        let digest: [u8; 16] = m.finalize().into();
        out.extend_from_slice(&digest);
        prev = Some(digest);
    }
    out.truncate(out_len);
    out
}

/// `base64(secret) || salt`, the password string fed to [`bytes_to_key`]
/// throughout this protocol.
pub fn salted_password(secret: &[u8], salt: &[u8]) -> Vec<u8> {
    use base64::Engine;
    let mut p = base64::engine::general_purpose::STANDARD
        .encode(secret)
        .into_bytes();
    p.extend_from_slice(salt);
    p
}

/// `base64(a) || base64(b)`, the password string the session cipher and
/// UDP cipher derive their keys from: both halves of the pair are
/// already-shared secrets (a user key and a hash-chain value), so unlike
/// [`salted_password`] neither half is a fixed literal salt.
pub fn double_base64_password(a: &[u8], b: &[u8]) -> Vec<u8> {
    use base64::Engine;
    let engine = base64::engine::general_purpose::STANDARD;
    let mut p = engine.encode(a).into_bytes();
    p.extend_from_slice(engine.encode(b).as_bytes());
    p
}
