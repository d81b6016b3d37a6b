//! Packet-level pack/unpack: wire layout, length obfuscation, padding
//! sizing, and the hash-chain MAC. All mutable session state (hash-chain
//! heads, counters, the payload cipher) is threaded through as `&mut`
//! rather than owned here, so the same functions serve both the client
//! and server roles.

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;

use crate::cipher::SessionCipher;
use crate::prng::Xorshift128Plus;

type HmacMd5 = Hmac<Md5>;

/// Fixed per-packet overhead of this layer's MAC tag.
pub const TAG_LEN: usize = 2;

/// Any unmasked `data_len + pad_len` at or above this is treated as a
/// corrupt stream and the connection is torn down rather than resynced.
pub const MAX_PACKET_LEN: u16 = 4096;

pub fn hmac_md5(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC-MD5 accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Selects which padding-length policy a session uses, fixed for the
/// session's lifetime and determined by which obfs method name it was
/// constructed for.
#[derive(Clone)]
pub enum PaddingStrategy {
    /// `auth_akarin_rand`'s fixed size bands.
    Rand,
    /// `auth_akarin_spec_a`'s two lookup tables, derived once from the
    /// server key.
    SpecA { t1: Vec<u16>, t2: Vec<u16> },
}

impl PaddingStrategy {
    pub fn spec_a_from_server_key(server_key: &[u8]) -> Self {
        let mut prng = Xorshift128Plus::new();
        prng.init_from_bin(server_key);
        let t1 = Self::draw_table(&mut prng, 4, 8);
        let t2 = Self::draw_table(&mut prng, 8, 16);
        Self::SpecA { t1, t2 }
    }

    fn draw_table(prng: &mut Xorshift128Plus, base: u64, modulus: u64) -> Vec<u16> {
        let len = (prng.next() % modulus + base) as usize;
        let mut table: Vec<u16> = (0..len)
            .map(|_| (prng.next() % 2340 % 2040 % 1440) as u16)
            .collect();
        table.sort_unstable();
        table
    }

    /// Compute the padding length for a packet carrying `buf_size` bytes
    /// of ciphertext (plus any command prefix already folded in), given
    /// the peer-declared `overhead`, this direction's `mss`, and the
    /// hash-chain head that seeds the padding PRNG.
    pub fn pad_len(
        &self,
        buf_size: u16,
        overhead: u16,
        mss: u16,
        last_hash: &[u8; 16],
        prng: &mut Xorshift128Plus,
    ) -> u16 {
        if buf_size as u32 + overhead as u32 > mss as u32 {
            prng.init_from_bin_len(last_hash, buf_size);
            return (prng.next() % 521) as u16;
        }
        if buf_size >= 1440 || buf_size + overhead == mss {
            return 0;
        }
        prng.init_from_bin_len(last_hash, buf_size);
        match self {
            PaddingStrategy::Rand => Self::legacy_band(buf_size, mss, overhead, prng),
            PaddingStrategy::SpecA { t1, t2 } => {
                Self::spec_a_band(buf_size, overhead, t1, t2, prng, mss)
            }
        }
    }

    fn legacy_band(buf_size: u16, mss: u16, overhead: u16, prng: &mut Xorshift128Plus) -> u16 {
        if buf_size > 1300 {
            return (prng.next() % 31) as u16;
        }
        if buf_size > 900 {
            return (prng.next() % 127) as u16;
        }
        if buf_size > 400 {
            return (prng.next() % 521) as u16;
        }
        (prng.next() % (mss - buf_size - overhead) as u64) as u16
    }

    fn spec_a_band(
        buf_size: u16,
        overhead: u16,
        t1: &[u16],
        t2: &[u16],
        prng: &mut Xorshift128Plus,
        mss: u16,
    ) -> u16 {
        let target = buf_size + overhead;

        let pos = t1.partition_point(|&v| v < target);
        let final_pos = pos + (prng.next() % t1.len() as u64) as usize;
        if final_pos < t1.len() {
            return t1[final_pos] - target;
        }

        let pos2 = t2.partition_point(|&v| v < target);
        let final_pos2 = pos2 + (prng.next() % t2.len() as u64) as usize;
        if final_pos2 < t2.len() {
            return t2[final_pos2] - target;
        }
        if final_pos2 < pos2 + t2.len() - 1 {
            return 0;
        }

        Self::legacy_band_no_mss_branch(buf_size, prng, mss, overhead)
    }

    /// The spec_a fallback chain ends in `next() % 1021` rather than the
    /// rand variant's `mss - buf_size - overhead`.
    fn legacy_band_no_mss_branch(buf_size: u16, prng: &mut Xorshift128Plus, _mss: u16, _overhead: u16) -> u16 {
        if buf_size > 1300 {
            return (prng.next() % 31) as u16;
        }
        if buf_size > 900 {
            return (prng.next() % 127) as u16;
        }
        if buf_size > 400 {
            return (prng.next() % 521) as u16;
        }
        (prng.next() % 1021) as u16
    }
}

/// UDP packets use a single fixed-range padding draw, seeded from the
/// per-datagram auth hash rather than a hash chain (UDP has none).
pub fn udp_pad_len(md5data: &[u8; 16], prng: &mut Xorshift128Plus) -> u16 {
    prng.init_from_bin(md5data);
    (prng.next() % 127) as u16
}

/// Build a client→server data packet. `with_cmd` is set exactly once,
/// for the first outbound packet after the client has learned the
/// server's MSS and queued the `0xff00` command.
#[allow(clippy::too_many_arguments)]
pub fn pack_client_data(
    plaintext: &[u8],
    cipher: &mut SessionCipher,
    last_client_hash: &mut [u8; 16],
    pack_id: &mut u32,
    user_key: &[u8],
    prng: &mut Xorshift128Plus,
    padding: &PaddingStrategy,
    overhead: u16,
    send_tcp_mss: u16,
    with_cmd: bool,
) -> Vec<u8> {
    let mut ciphertext = plaintext.to_vec();
    cipher.encrypt_in_place(&mut ciphertext);
    let ct_len = ciphertext.len() as u16;
    let cmd_len: u16 = if with_cmd { 2 } else { 0 };

    let pad_len = padding.pad_len(ct_len + cmd_len, overhead, send_tcp_mss, last_client_hash, prng);
    if pad_len > 0 {
        ciphertext.extend(random_bytes(pad_len as usize));
    }

    let mut out = Vec::with_capacity(ciphertext.len() + 6);
    if with_cmd {
        let mask_cmd = u16::from_le_bytes([last_client_hash[14], last_client_hash[15]]);
        let mask_len = u16::from_le_bytes([last_client_hash[12], last_client_hash[13]]);
        out.extend_from_slice(&(0xff00u16 ^ mask_cmd).to_le_bytes());
        out.extend_from_slice(&(ct_len ^ mask_len).to_le_bytes());
    } else {
        let mask_len = u16::from_le_bytes([last_client_hash[14], last_client_hash[15]]);
        out.extend_from_slice(&(ct_len ^ mask_len).to_le_bytes());
    }
    out.extend_from_slice(&ciphertext);

    let mac_key = [user_key, &pack_id.to_le_bytes()[..]].concat();
    let tag = hmac_md5(&mac_key, &out);
    out.extend_from_slice(&tag[..TAG_LEN]);

    *last_client_hash = tag;
    *pack_id = pack_id.wrapping_add(1);
    out
}

/// Build a server→client data packet. Never carries a command prefix.
pub fn pack_server_data(
    plaintext: &[u8],
    cipher: &mut SessionCipher,
    last_server_hash: &mut [u8; 16],
    pack_id_for_mac: u32,
    user_key: &[u8],
    prng: &mut Xorshift128Plus,
    padding: &PaddingStrategy,
    overhead: u16,
    send_tcp_mss: u16,
) -> Vec<u8> {
    let mut ciphertext = plaintext.to_vec();
    cipher.encrypt_in_place(&mut ciphertext);
    let ct_len = ciphertext.len() as u16;

    let pad_len = padding.pad_len(ct_len, overhead, send_tcp_mss, last_server_hash, prng);
    if pad_len > 0 {
        ciphertext.extend(random_bytes(pad_len as usize));
    }

    let mask_len = u16::from_le_bytes([last_server_hash[14], last_server_hash[15]]);
    let mut out = Vec::with_capacity(ciphertext.len() + 4);
    out.extend_from_slice(&(ct_len ^ mask_len).to_le_bytes());
    out.extend_from_slice(&ciphertext);

    let mac_key = [user_key, &pack_id_for_mac.to_le_bytes()[..]].concat();
    let tag = hmac_md5(&mac_key, &out);
    out.extend_from_slice(&tag[..TAG_LEN]);

    *last_server_hash = tag;
    out
}

/// Why a packet failed to parse. The caller decides, based on which
/// packet in the stream this was, whether that becomes a poison
/// response or a fatal error.
#[derive(Debug)]
pub enum FrameFault {
    /// Unmasked length exceeded [`MAX_PACKET_LEN`].
    Oversize,
    /// Recomputed MAC did not match the tag on the wire.
    MacMismatch,
}

pub struct ParsedPacket {
    pub consumed: usize,
    pub plaintext: Vec<u8>,
}

/// Parse one server→client packet (the client's receive path). Returns
/// `Ok(None)` if `recv_buf` doesn't yet hold a complete packet.
#[allow(clippy::too_many_arguments)]
pub fn try_unpack_server_packet(
    recv_buf: &[u8],
    cipher: &mut SessionCipher,
    last_server_hash: &mut [u8; 16],
    recv_id: &mut u32,
    user_key: &[u8],
    prng: &mut Xorshift128Plus,
    padding: &PaddingStrategy,
    overhead: u16,
    recv_tcp_mss: u16,
) -> Result<Option<ParsedPacket>, FrameFault> {
    if recv_buf.len() <= 4 {
        return Ok(None);
    }
    let mask = u16::from_le_bytes([last_server_hash[14], last_server_hash[15]]);
    let data_len = u16::from_le_bytes([recv_buf[0], recv_buf[1]]) ^ mask;

    let rand_len = padding.pad_len(data_len, overhead, recv_tcp_mss, last_server_hash, prng);
    let length = data_len as u32 + rand_len as u32;
    if length >= MAX_PACKET_LEN as u32 {
        return Err(FrameFault::Oversize);
    }
    let length = length as usize;
    if length + 4 > recv_buf.len() {
        return Ok(None);
    }

    let mac_key = [user_key, &recv_id.to_le_bytes()[..]].concat();
    let computed = hmac_md5(&mac_key, &recv_buf[..length + 2]);
    if computed[..TAG_LEN] != recv_buf[length + 2..length + 4] {
        return Err(FrameFault::MacMismatch);
    }

    let mut plaintext = recv_buf[2..2 + data_len as usize].to_vec();
    cipher.decrypt_in_place(&mut plaintext);

    *last_server_hash = computed;
    *recv_id = recv_id.wrapping_add(1);
    Ok(Some(ParsedPacket { consumed: length + 4, plaintext }))
}

/// Parse one client→server packet (the server's receive path), including
/// the optional `0xff00` command prefix.
#[allow(clippy::too_many_arguments)]
pub fn try_unpack_client_packet(
    recv_buf: &[u8],
    cipher: &mut SessionCipher,
    last_client_hash: &mut [u8; 16],
    recv_id: &mut u32,
    user_key: &[u8],
    prng: &mut Xorshift128Plus,
    padding: &PaddingStrategy,
    overhead: u16,
    recv_tcp_mss: &mut u16,
    send_tcp_mss: u16,
) -> Result<Option<ParsedPacket>, FrameFault> {
    if recv_buf.len() <= 4 {
        return Ok(None);
    }

    let mut offset = 0usize;
    let mut mask = u16::from_le_bytes([last_client_hash[14], last_client_hash[15]]);
    let mut data_len = u16::from_le_bytes([recv_buf[0], recv_buf[1]]) ^ mask;
    let mut cmd_len: u16 = 0;

    while data_len >= 0xff00 {
        if data_len != 0xff00 {
            return Err(FrameFault::Oversize);
        }
        cmd_len += 2;
        *recv_tcp_mss = send_tcp_mss;
        offset += 2;
        if recv_buf.len() < offset + 2 {
            return Ok(None);
        }
        mask = u16::from_le_bytes([last_client_hash[12], last_client_hash[13]]);
        data_len = u16::from_le_bytes([recv_buf[offset], recv_buf[offset + 1]]) ^ mask;
    }

    let rand_len = padding.pad_len(data_len + cmd_len, overhead, *recv_tcp_mss, last_client_hash, prng);
    let length = data_len as u32 + rand_len as u32;
    if length >= MAX_PACKET_LEN as u32 {
        return Err(FrameFault::Oversize);
    }
    let length = length as usize;
    if offset + length + 4 > recv_buf.len() {
        return Ok(None);
    }

    let mac_span_end = offset + 2 + length;
    let mac_key = [user_key, &recv_id.to_le_bytes()[..]].concat();
    let computed = hmac_md5(&mac_key, &recv_buf[..mac_span_end]);
    if computed[..TAG_LEN] != recv_buf[mac_span_end..mac_span_end + 2] {
        return Err(FrameFault::MacMismatch);
    }

    let ciphertext_start = offset + 2;
    let mut plaintext = recv_buf[ciphertext_start..ciphertext_start + data_len as usize].to_vec();
    cipher.decrypt_in_place(&mut plaintext);

    *last_client_hash = computed;
    *recv_id = recv_id.wrapping_add(1);
    Ok(Some(ParsedPacket { consumed: mac_span_end + 2, plaintext }))
}
