mod cipher;
mod error;
mod framer;
mod handshake;
mod kdf;
mod prng;
mod replay;
mod session;
mod udp;

pub mod config;

pub use config::StaticHostInfo;
pub use error::ObfsError;
pub use replay::ReplayGuard;
pub use session::{Role, Session, Variant};

pub use handshake::ClientIdentityCounter;

pub use udp::{
    client_post_decrypt as udp_client_post_decrypt, client_pre_encrypt as udp_client_pre_encrypt,
    server_post_decrypt as udp_server_post_decrypt, server_pre_encrypt as udp_server_pre_encrypt,
};
