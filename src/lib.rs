mod assets;
mod config;
mod error;
mod jose;
mod key_exchange;
mod meta;
mod provider;
mod source;
mod tang_interface;
mod util;

pub use assets::{AssetList, BuildOptions};
pub use config::{
    looks_like_config, parse as parse_config, EgressMethod, IngressMethod, LockingMethod,
    SecretConfig, SecretList, IMPLICIT_CONFIG,
};
pub use error::{Error, Result};
pub use jose::{
    decrypt_payload, parse_jwe, pretty_print, strip_private, thumbprint, JweEnvelope, JwkSet,
};
pub use key_exchange::{diffie_hellman, ecmr_add, ecmr_sub, generate_ephemeral, shared_secret_x};
pub use meta::Composition;
pub use provider::{AssetProvider, FifoProvider, FileProvider, StdoutProvider};
pub use source::{
    AssetSource, ClevisSource, PlainFileSource, SecretBuffer, StaticSource, UnsealPolicy,
};
pub use tang_interface::TangClient;
