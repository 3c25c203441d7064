mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "vmlink", version, about = "Inter-domain virtual channel transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "vmlink",
            "send",
            "/tmp/test.sock",
            "--vcid",
            "0x20",
            "--session",
            "7",
            "--data",
            "hello",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.vcid, 0x20);
        assert_eq!(args.session, 7);
        assert_eq!(args.data.as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "vmlink",
            "send",
            "/tmp/test.sock",
            "--vcid",
            "1",
            "--session",
            "1",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_listen_channel_list() {
        let cli = Cli::try_parse_from([
            "vmlink",
            "listen",
            "/tmp/test.sock",
            "--open",
            "5:7:0x25,6:7",
            "--count",
            "2",
        ])
        .expect("listen args should parse");

        let Command::Listen(args) = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(args.open.len(), 2);
        assert_eq!(args.open[0].remote_vcid, 0x25);
        assert_eq!(args.open[1].remote_vcid, 6);
        assert_eq!(args.count, Some(2));
    }

    #[test]
    fn listen_requires_a_channel() {
        let err = Cli::try_parse_from(["vmlink", "listen", "/tmp/test.sock"])
            .expect_err("--open is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_send_type() {
        let cli = Cli::try_parse_from([
            "vmlink",
            "send",
            "/tmp/test.sock",
            "--vcid",
            "1",
            "--session",
            "1",
            "--type",
            "sche-msg",
        ])
        .expect("type should parse");
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.kind, cmd::SendKind::ScheMsg);
    }

    #[test]
    fn parses_decode_subcommand() {
        let cli = Cli::try_parse_from(["vmlink", "decode", "capture.bin", "--max-payload", "4096"])
            .expect("decode args should parse");
        assert!(matches!(cli.command, Command::Decode(_)));
    }
}
