//! egs-test-utils: Test infrastructure for eryph guest services.
//!
//! Provides:
//! - SessionPair: Authenticated client/server sessions over an in-memory duplex
//! - TestKeys: Freshly generated client and host keys with a matching authenticator
//! - Fixtures: Temp directories and deterministic payloads

mod fixtures;
mod session_pair;
mod test_keys;

pub use fixtures::{pseudo_random_bytes, temp_dir, write_file};
pub use session_pair::{SessionPair, next_opened, next_request, session_pair, session_pair_with_keys};
pub use test_keys::{AllowKey, TestKeys};
