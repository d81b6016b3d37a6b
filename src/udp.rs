//! UDP framing: each datagram is self-contained, authenticated and
//! decrypted independently with no chaining to any other datagram.

use rand::RngCore;

use crate::cipher::HalfCipher;
use crate::framer::hmac_md5;
use crate::kdf::double_base64_password;
use crate::prng::Xorshift128Plus;

const TAG_LEN: usize = 1;

fn udp_password(user_key: &[u8], md5data: &[u8; 16]) -> Vec<u8> {
    double_base64_password(user_key, md5data)
}

fn udp_pad_len(md5data: &[u8; 16]) -> usize {
    let mut prng = Xorshift128Plus::new();
    crate::framer::udp_pad_len(md5data, &mut prng) as usize
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// `client_udp_pre_encrypt`: authenticate and encrypt an outbound
/// datagram, embedding the client's uid so the server can route it to
/// the right user key.
pub fn client_pre_encrypt(plaintext: &[u8], server_key: &[u8], user_id: [u8; 4], user_key: &[u8]) -> Vec<u8> {
    let mut authdata = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut authdata);
    let md5data: [u8; 16] = hmac_md5(server_key, &authdata);

    let mut uid_enc = user_id;
    for (u, m) in uid_enc.iter_mut().zip(&md5data[0..4]) {
        *u ^= m;
    }

    let password = udp_password(user_key, &md5data);
    let iv: [u8; 8] = server_key[..8].try_into().expect("server_key must be >= 8 bytes");
    let mut cipher = HalfCipher::new(&password, &iv);
    cipher.prime();

    let mut ciphertext = plaintext.to_vec();
    cipher.apply(&mut ciphertext);

    let mut body = ciphertext;
    body.extend(random_bytes(udp_pad_len(&md5data)));
    body.extend_from_slice(&authdata);
    body.extend_from_slice(&uid_enc);

    let tag = hmac_md5(user_key, &body);
    body.extend_from_slice(&tag[..TAG_LEN]);
    body
}

/// `client_udp_post_decrypt`: verify and decrypt a server response.
/// Returns an empty vector on any mismatch.
pub fn client_post_decrypt(packet: &[u8], server_key: &[u8], user_key: &[u8]) -> Vec<u8> {
    const SUFFIX: usize = 7 + TAG_LEN;
    if packet.len() < SUFFIX {
        return Vec::new();
    }
    let authdata: [u8; 7] = packet[packet.len() - SUFFIX..packet.len() - TAG_LEN].try_into().unwrap();
    let tag = &packet[packet.len() - TAG_LEN..];

    let body = &packet[..packet.len() - TAG_LEN];
    let expected = hmac_md5(user_key, body);
    if expected[..TAG_LEN] != *tag {
        return Vec::new();
    }

    let md5data: [u8; 16] = hmac_md5(server_key, &authdata);
    let pad_len = udp_pad_len(&md5data);
    let ciphertext_len = body.len().saturating_sub(SUFFIX - TAG_LEN).saturating_sub(pad_len);
    if ciphertext_len > body.len() {
        return Vec::new();
    }

    let password = udp_password(user_key, &md5data);
    let iv: [u8; 8] = server_key[..8].try_into().expect("server_key must be >= 8 bytes");
    let mut cipher = HalfCipher::new(&password, &iv);
    cipher.prime();

    let mut plaintext = body[..ciphertext_len].to_vec();
    cipher.apply(&mut plaintext);
    plaintext
}

/// `server_udp_pre_encrypt`: authenticate and encrypt a response
/// datagram for `user_id`. No uid is carried in the response; the host
/// proxy already knows which client it's replying to.
pub fn server_pre_encrypt(plaintext: &[u8], server_key: &[u8], user_key: &[u8]) -> Vec<u8> {
    let mut authdata = [0u8; 7];
    rand::thread_rng().fill_bytes(&mut authdata);
    let md5data: [u8; 16] = hmac_md5(server_key, &authdata);

    let password = udp_password(user_key, &md5data);
    let iv: [u8; 8] = server_key[..8].try_into().expect("server_key must be >= 8 bytes");
    let mut cipher = HalfCipher::new(&password, &iv);
    cipher.prime();

    let mut ciphertext = plaintext.to_vec();
    cipher.apply(&mut ciphertext);

    let mut body = ciphertext;
    body.extend(random_bytes(udp_pad_len(&md5data)));
    body.extend_from_slice(&authdata);

    let tag = hmac_md5(user_key, &body);
    body.extend_from_slice(&tag[..TAG_LEN]);
    body
}

/// `server_udp_post_decrypt`: verify and decrypt a client datagram,
/// recovering the uid it was sent under so the host can look up state
/// (and reply) for the right user. Returns `None` on any mismatch.
pub fn server_post_decrypt(packet: &[u8], server_key: &[u8], lookup_user: impl FnOnce([u8; 4]) -> Option<Vec<u8>>) -> Option<(Vec<u8>, [u8; 4])> {
    const SUFFIX: usize = 3 + 4 + TAG_LEN;
    if packet.len() < SUFFIX {
        return None;
    }
    let authdata: [u8; 3] = packet[packet.len() - SUFFIX..packet.len() - 4 - TAG_LEN].try_into().unwrap();
    let uid_enc: [u8; 4] = packet[packet.len() - 4 - TAG_LEN..packet.len() - TAG_LEN].try_into().unwrap();
    let tag = &packet[packet.len() - TAG_LEN..];

    let md5data: [u8; 16] = hmac_md5(server_key, &authdata);
    let mut uid = uid_enc;
    for (u, m) in uid.iter_mut().zip(&md5data[0..4]) {
        *u ^= m;
    }
    let user_key = lookup_user(uid)?;

    let body = &packet[..packet.len() - TAG_LEN];
    let expected = hmac_md5(&user_key, body);
    if expected[..TAG_LEN] != *tag {
        return None;
    }

    let pad_len = udp_pad_len(&md5data);
    let ciphertext_len = body.len().saturating_sub(SUFFIX - TAG_LEN).saturating_sub(pad_len);
    if ciphertext_len > body.len() {
        return None;
    }

    let password = udp_password(&user_key, &md5data);
    let iv: [u8; 8] = server_key[..8].try_into().expect("server_key must be >= 8 bytes");
    let mut cipher = HalfCipher::new(&password, &iv);
    cipher.prime();

    let mut plaintext = body[..ciphertext_len].to_vec();
    cipher.apply(&mut plaintext);
    Some((plaintext, uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_client_to_server() {
        let server_key = [0u8; 16];
        let user_key = [0u8; 16];
        let uid = [0, 0, 0, 1];

        let packet = client_pre_encrypt(b"ping", &server_key, uid, &user_key);
        let (plaintext, decoded_uid) =
            server_post_decrypt(&packet, &server_key, |_uid| Some(user_key.to_vec())).expect("authenticates");
        assert_eq!(plaintext, b"ping");
        assert_eq!(decoded_uid, uid);
    }

    #[test]
    fn round_trip_server_to_client() {
        let server_key = [1u8; 16];
        let user_key = [2u8; 16];
        let packet = server_pre_encrypt(b"pong", &server_key, &user_key);
        let plaintext = client_post_decrypt(&packet, &server_key, &user_key);
        assert_eq!(plaintext, b"pong");
    }

    #[test]
    fn unknown_user_yields_no_match() {
        let server_key = [3u8; 16];
        let user_key = [4u8; 16];
        let uid = [9, 9, 9, 9];
        let packet = client_pre_encrypt(b"hello", &server_key, uid, &user_key);
        let result = server_post_decrypt(&packet, &server_key, |_| None);
        assert!(result.is_none());
    }

    #[test]
    fn tampered_tag_yields_empty() {
        let server_key = [5u8; 16];
        let user_key = [6u8; 16];
        let mut packet = server_pre_encrypt(b"pong", &server_key, &user_key);
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        let plaintext = client_post_decrypt(&packet, &server_key, &user_key);
        assert!(plaintext.is_empty());
    }
}
