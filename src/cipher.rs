//! Cipher wrappers: the one-shot AES-128-CBC header cipher, and the
//! per-direction ChaCha20 payload cipher with IV suppression.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20Legacy;

use crate::kdf::bytes_to_key;

type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// Encrypt exactly one 16-byte block with AES-128-CBC under an explicit
/// IV and the password-derived key. The handshake uses this twice: once
/// with a zero IV to derive the discarded first block's ciphertext
/// (which both peers compute locally rather than putting on the wire),
/// and once with that ciphertext as the IV for the real header block.
pub fn encrypt_block(password: &[u8], iv: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let key = bytes_to_key(password, 16);
    let mut block = (*plaintext).into();
    CbcEnc::new(key.as_slice().into(), iv.into()).encrypt_block_mut(&mut block);
    block.into()
}

/// Decrypt exactly one 16-byte block with AES-128-CBC under an explicit IV.
pub fn decrypt_block(password: &[u8], iv: &[u8; 16], ciphertext: &[u8; 16]) -> [u8; 16] {
    let key = bytes_to_key(password, 16);
    let mut block = (*ciphertext).into();
    CbcDec::new(key.as_slice().into(), iv.into()).decrypt_block_mut(&mut block);
    block.into()
}

/// One direction of the session's ChaCha20 payload cipher.
///
/// Both ends derive this direction's IV from the hash chain rather than
/// exchanging one inline, so the keystream must start at position zero
/// with no IV bytes generated or consumed on the wire. RustCrypto's
/// `ChaCha20Legacy` never prepends an IV, so `prime` is a no-op
/// keystream-wise, but it's kept as an explicit step (and the `primed`
/// guard) so a caller can't accidentally apply the cipher before the IV
/// is wired up.
pub struct HalfCipher {
    inner: ChaCha20Legacy,
    primed: bool,
}

impl HalfCipher {
    /// `password` is `base64(user_key) || base64(last_*_hash)` per the
    /// handshake; `iv` is the 8-byte half of the hash chain this direction
    /// uses (never transmitted). `ChaCha20Legacy` takes that 8-byte nonce
    /// directly (the classic Bernstein construction) instead of the IETF
    /// 96-bit variant, matching the wire format's IV size.
    pub fn new(password: &[u8], iv: &[u8; 8]) -> Self {
        let key = bytes_to_key(password, 32);
        let inner = ChaCha20Legacy::new(key.as_slice().into(), iv.into());
        Self { inner, primed: false }
    }

    /// Marks the IV as already accounted for. Must be called once before
    /// the first real `apply`.
    pub fn prime(&mut self) {
        self.primed = true;
    }

    /// XOR `buf` in place with the keystream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        debug_assert!(self.primed, "HalfCipher used before prime()");
        self.inner.apply_keystream(buf);
    }
}

/// The session's full-duplex payload cipher: one [`HalfCipher`] per
/// direction, each with its own keystream position, rather than one
/// object juggling two internal states.
pub struct SessionCipher {
    pub encrypt: HalfCipher,
    pub decrypt: HalfCipher,
}

impl SessionCipher {
    pub fn new(password: &[u8], encrypt_iv: &[u8; 8], decrypt_iv: &[u8; 8]) -> Self {
        let mut encrypt = HalfCipher::new(password, encrypt_iv);
        let mut decrypt = HalfCipher::new(password, decrypt_iv);
        encrypt.prime();
        decrypt.prime();
        Self { encrypt, decrypt }
    }

    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.encrypt.apply(buf);
    }

    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        self.decrypt.apply(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let password = b"some password string";
        let iv = [0u8; 16];
        let plaintext = [7u8; 16];
        let ct = encrypt_block(password, &iv, &plaintext);
        let pt = decrypt_block(password, &iv, &ct);
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn chained_block_round_trips_with_derived_iv() {
        let password = b"another password";
        let block1_plain = [1u8; 16];
        let c1 = encrypt_block(password, &[0u8; 16], &block1_plain);
        let block2_plain = [2u8; 16];
        let c2 = encrypt_block(password, &c1, &block2_plain);
        let recovered = decrypt_block(password, &c1, &c2);
        assert_eq!(recovered, block2_plain);
    }

    #[test]
    fn session_cipher_round_trips() {
        let mut a = SessionCipher::new(b"pw", &[1u8; 8], &[2u8; 8]);
        let mut b = SessionCipher::new(b"pw", &[2u8; 8], &[1u8; 8]);
        let mut msg = b"hello world, this is plaintext".to_vec();
        let original = msg.clone();
        a.encrypt_in_place(&mut msg);
        assert_ne!(msg, original);
        b.decrypt_in_place(&mut msg);
        assert_eq!(msg, original);
    }
}
