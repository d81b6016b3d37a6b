//! Error taxonomy for the `auth_akarin` protocol layer.
//!
//! Most protocol failures are *not* represented as [`ObfsError`] — a bad
//! header-check HMAC, a stale timestamp, or a replay-guard refusal are all
//! defined protocol outcomes (silent pass-through, or the `'E'`-poison
//! response) and are reported through the normal `Ok` return of
//! [`crate::session::Session::server_post_decrypt`]. `ObfsError` is reserved
//! for failures that are fatal once the handshake has completed: a corrupt
//! post-handshake frame, which the caller is expected to treat as
//! connection-ending.

/// Fatal errors raised by the protocol layer once the handshake has
/// completed. Before that point, authentication failures are folded into
/// the normal return value (see module docs) rather than raised here.
#[derive(Debug, thiserror::Error)]
pub enum ObfsError {
    /// The unmasked packet length or checksum did not make sense. The
    /// session has already set `raw_trans` and dropped its receive buffer
    /// by the time this is returned.
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// The HMAC tag on a data packet did not match.
    #[error("mac verification failed")]
    MacMismatch,
}
