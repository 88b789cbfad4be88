//! Credential records and host-to-credential resolution

pub mod record;
pub mod resolver;

pub use record::{parse_bw_items, LoginRecord};
pub use resolver::{
    parse_ssh_uri, resolve, ConnectionParameters, ResolveError, ResolveOptions, SshAddress,
    DEFAULT_SSH_PORT, SSH_SCHEME,
};
