use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::debug;
use vmlink_core::{Clock, Context, ExportRequest, SystemClock, Transport, VirtualChannel};
use vmlink_transport::{PhysicalChannel, UnixSocketListener};
use vmlink_wire::{PayloadType, ProfileStat, Region};

use crate::cmd::{parse_duration, SendArgs, SendKind};
use crate::exit::{io_error, link_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_export_ack, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.transport_config()?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let channel = UnixSocketListener::connect(&args.path, "send", config.wire_config())
        .map_err(|err| transport_error("connect failed", err))?;
    let pchan: Arc<dyn PhysicalChannel> =
        Arc::new(channel.with_vmids(args.link.vmid_local, args.link.vmid_remote));

    let transport = Arc::new(Transport::new(config));
    let vchan = transport
        .open_channel(
            pchan.clone(),
            args.local_vcid.unwrap_or(args.vcid),
            args.session,
            args.vcid,
            Arc::new(Context::new()),
        )
        .map_err(|err| link_error("open failed", err))?;

    let clock = SystemClock;
    let sent = match args.kind {
        SendKind::Msg => transport.send(&vchan, &payload),
        SendKind::Close => transport.close(&vchan),
        SendKind::Profile => {
            transport.send_typed(&vchan, PayloadType::Profile, &profile_payload(&clock, &payload))
        }
        SendKind::ScheMsg => {
            transport.send_typed(&vchan, PayloadType::ScheMsg, &schedule_payload(&clock, &payload))
        }
        SendKind::Export => {
            return send_export(&args, &transport, pchan, &vchan, wait_timeout, format);
        }
    };
    sent.map_err(|err| link_error("send failed", err))?;
    debug!(kind = ?args.kind, vcid = args.vcid, size = payload.len(), "sent");
    Ok(SUCCESS)
}

fn send_export(
    args: &SendArgs,
    transport: &Arc<Transport>,
    pchan: Arc<dyn PhysicalChannel>,
    vchan: &VirtualChannel,
    wait_timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    if args.pages == 0 {
        return Err(CliError::new(USAGE, "--pages must be greater than zero"));
    }

    // The acknowledgement arrives through dispatch, so the receive side must be running.
    {
        let transport = transport.clone();
        thread::Builder::new()
            .name("pump".into())
            .spawn(move || transport.run(pchan))
            .map_err(|err| io_error("failed to start receive pump", err))?;
    }

    let request = ExportRequest::new(
        args.export_id,
        args.first_pfn,
        vec![Region {
            page_count: args.pages,
            gap: 0,
        }],
    );
    transport
        .send_export(vchan, &request)
        .map_err(|err| link_error("send failed", err))?;

    let ack = vchan
        .context()
        .wait_export_ack(args.export_id, vchan.id(), wait_timeout)
        .map_err(|err| link_error("export not acknowledged", err))?;
    print_export_ack(&ack, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

/// Stat record stamped with the send time, followed by `extra`.
fn profile_payload(clock: &dyn Clock, extra: &[u8]) -> Vec<u8> {
    let now = clock.timestamp();
    let mut buf = BytesMut::with_capacity(ProfileStat::SIZE + extra.len());
    ProfileStat {
        tx_sec: now.as_secs(),
        tx_usec: u64::from(now.subsec_micros()),
        rx_sec: 0,
        rx_usec: 0,
    }
    .encode(&mut buf);
    buf.put_slice(extra);
    buf.to_vec()
}

/// Send-side tick followed by `extra`; the receiver overwrites the tick on arrival.
fn schedule_payload(clock: &dyn Clock, extra: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + extra.len());
    buf.put_u64_le(clock.ticks());
    buf.put_slice(extra);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StillClock;

    impl Clock for StillClock {
        fn ticks(&self) -> u64 {
            99
        }

        fn timestamp(&self) -> Duration {
            Duration::new(12, 345_678_000)
        }
    }

    #[test]
    fn profile_payload_carries_send_time() {
        let bytes = profile_payload(&StillClock, b"x");
        assert_eq!(bytes.len(), ProfileStat::SIZE + 1);
        let stat = ProfileStat::decode(&bytes).unwrap();
        assert_eq!((stat.tx_sec, stat.tx_usec), (12, 345_678));
        assert_eq!(bytes[ProfileStat::SIZE], b'x');
    }

    #[test]
    fn schedule_payload_starts_with_ticks() {
        let bytes = schedule_payload(&StillClock, b"abc");
        assert_eq!(&bytes[..8], &99u64.to_le_bytes());
        assert_eq!(&bytes[8..], b"abc");
    }
}
