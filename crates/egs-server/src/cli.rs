//! Server CLI implementation.
//!
//! Provides command-line argument parsing for the guest service.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use uuid::Uuid;

use egs_core::constants::{KVP_POOL_DIR, SERVICE_ID};
use egs_core::transport::ListenScope;

use crate::auth::ClientKeyProvider;
use crate::kvp::KvpPool;
use crate::status::{KvpStatusPublisher, LogStatusPublisher, StatusPublisher};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for egs_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => egs_core::LogFormat::Text,
            CliLogFormat::Json => egs_core::LogFormat::Json,
        }
    }
}

/// Which peers may connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliScope {
    /// Any partition.
    Any,
    /// Child partitions (Hyper-V sockets only).
    Children,
    /// The parent host.
    #[default]
    Parent,
    /// This partition.
    Loopback,
}

impl From<CliScope> for ListenScope {
    fn from(scope: CliScope) -> Self {
        match scope {
            CliScope::Any => ListenScope::Any,
            CliScope::Children => ListenScope::Children,
            CliScope::Parent => ListenScope::Parent,
            CliScope::Loopback => ListenScope::Loopback,
        }
    }
}

/// egs-server - eryph guest services over hypervisor sockets.
#[derive(Debug, Parser)]
#[command(
    name = "egs-server",
    version,
    about = "egs-server - eryph guest services over hypervisor sockets"
)]
pub struct Cli {
    /// Peers allowed to connect
    #[arg(long = "scope", default_value = "parent")]
    pub scope: CliScope,

    /// Service id to listen on
    #[arg(long = "service-id", default_value = SERVICE_ID, value_name = "UUID")]
    pub service_id: Uuid,

    /// Listen backlog
    #[arg(long = "backlog", default_value = "16")]
    pub backlog: i32,

    /// Host key (OpenSSH private key); an ephemeral key is generated if absent
    #[arg(long = "host-key", value_name = "FILE")]
    pub host_key: Option<PathBuf>,

    /// Authorized client key (OpenSSH public key); read from the KVP pool if absent
    #[arg(long = "client-key", value_name = "FILE")]
    pub client_key: Option<PathBuf>,

    /// Directory holding the KVP pool files
    #[arg(long = "kvp-dir", default_value = KVP_POOL_DIR, value_name = "DIR")]
    pub kvp_dir: PathBuf,

    /// Do not publish the service status to the host
    #[arg(long = "no-status")]
    pub no_status: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Source of the authorized client key.
    pub fn client_key_provider(&self) -> ClientKeyProvider {
        match &self.client_key {
            Some(path) => ClientKeyProvider::from_file(path.clone()),
            None => ClientKeyProvider::from_kvp(KvpPool::host_to_guest(&self.kvp_dir)),
        }
    }

    /// Status publication backend.
    pub fn status_publisher(&self) -> Box<dyn StatusPublisher> {
        if self.no_status || !cfg!(target_os = "linux") {
            Box::new(LogStatusPublisher)
        } else {
            Box::new(KvpStatusPublisher::new(KvpPool::guest_to_host(&self.kvp_dir)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientKeySource;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["egs-server"]);
        assert_eq!(cli.scope, CliScope::Parent);
        assert_eq!(cli.service_id, Uuid::parse_str(SERVICE_ID).unwrap());
        assert_eq!(cli.kvp_dir, PathBuf::from(KVP_POOL_DIR));
        assert_eq!(cli.verbose, 0);
        assert!(matches!(
            cli.client_key_provider().source(),
            ClientKeySource::Kvp(_)
        ));
    }

    #[test]
    fn explicit_options() {
        let cli = Cli::parse_from([
            "egs-server",
            "--scope",
            "loopback",
            "--client-key",
            "/etc/egs/client.pub",
            "--no-status",
            "-vv",
            "--log-format",
            "json",
        ]);
        assert_eq!(ListenScope::from(cli.scope), ListenScope::Loopback);
        assert!(cli.no_status);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, CliLogFormat::Json);
        assert!(matches!(
            cli.client_key_provider().source(),
            ClientKeySource::File(_)
        ));
    }

    #[test]
    fn invalid_service_id_is_rejected() {
        assert!(Cli::try_parse_from(["egs-server", "--service-id", "nope"]).is_err());
    }
}
