use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use vmlink_core::TransportConfig;

use crate::exit::{io_error, link_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one connection and print messages dequeued from the opened channels.
    Listen(ListenArgs),
    /// Connect and send one payload on a virtual channel.
    Send(SendArgs),
    /// Print the header sequence of a captured stream.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Local domain identity and limits shared by commands that open a physical channel.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Local domain id.
    #[arg(long, default_value = "0", value_parser = parse_u32)]
    pub vmid_local: u32,
    /// Remote domain id.
    #[arg(long, default_value = "0", value_parser = parse_u32)]
    pub vmid_remote: u32,
    /// JSON transport configuration file.
    #[arg(long, value_name = "FILE", env = "VMLINK_CONFIG")]
    pub config: Option<PathBuf>,
}

impl LinkArgs {
    pub fn transport_config(&self) -> CliResult<TransportConfig> {
        load_config(self.config.as_deref())
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Channels to open, as VCID:SESSION[:REMOTE_VCID] (comma-separated).
    #[arg(long, required = true, value_delimiter = ',')]
    pub open: Vec<ChannelSpec>,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum SendKind {
    Msg,
    Close,
    Profile,
    ScheMsg,
    Export,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Virtual channel id at the receiving end.
    #[arg(long, value_parser = parse_u32)]
    pub vcid: u32,
    /// Session id of the channel.
    #[arg(long, value_parser = parse_u32)]
    pub session: u32,
    /// Local virtual channel id. Default: same as --vcid.
    #[arg(long, value_parser = parse_u32)]
    pub local_vcid: Option<u32>,
    /// Payload type to send.
    #[arg(long = "type", value_enum, default_value = "msg")]
    pub kind: SendKind,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Export id (with --type export).
    #[arg(long, default_value = "1", value_parser = parse_u32)]
    pub export_id: u32,
    /// First page frame number (with --type export).
    #[arg(long, default_value = "0", value_parser = parse_u64)]
    pub first_pfn: u64,
    /// Number of contiguous pages (with --type export).
    #[arg(long, default_value = "1", value_parser = parse_u32)]
    pub pages: u32,
    /// Maximum time to wait for an export acknowledgement (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Captured stream file.
    pub path: PathBuf,
    /// Largest payload size accepted.
    #[arg(long)]
    pub max_payload: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// A channel to open: local id, session and the id at the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub vcid: u32,
    pub session: u32,
    pub remote_vcid: u32,
}

impl FromStr for ChannelSpec {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split(':').collect();
        let (vcid, session, remote) = match parts.as_slice() {
            [vcid, session] => (*vcid, *session, *vcid),
            [vcid, session, remote] => (*vcid, *session, *remote),
            _ => return Err(format!("expected VCID:SESSION[:REMOTE_VCID], got {input:?}")),
        };
        Ok(Self {
            vcid: parse_u32(vcid)?,
            session: parse_u32(session)?,
            remote_vcid: parse_u32(remote)?,
        })
    }
}

/// Decimal or `0x`-prefixed hexadecimal.
pub fn parse_u32(input: &str) -> Result<u32, String> {
    let parsed = match input.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid number {input:?}: {err}"))
}

fn parse_u64(input: &str) -> Result<u64, String> {
    let parsed = match input.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid number {input:?}: {err}"))
}

pub fn load_config(path: Option<&Path>) -> CliResult<TransportConfig> {
    let Some(path) = path else {
        return Ok(TransportConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    TransportConfig::from_json(&text)
        .map_err(|err| link_error(&format!("invalid config {}", path.display()), err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
