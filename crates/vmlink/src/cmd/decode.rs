use std::fs::File;
use std::io::Read;

use tracing::warn;
use vmlink_wire::{HeaderReader, WireConfig, WireError, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};

use crate::cmd::DecodeArgs;
use crate::exit::{io_error, wire_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_headers, HeaderRecord, OutputFormat};

const SKIP_CHUNK_SIZE: usize = 64 * 1024;

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let file = File::open(&args.path)
        .map_err(|err| io_error(&format!("failed opening {}", args.path.display()), err))?;
    let config = WireConfig {
        max_payload_size: args.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD),
        ..WireConfig::default()
    };

    let decoded = decode_stream(file, config);
    print_headers(&decoded.records, format);
    match decoded.error {
        Some(err) => Err(err),
        None => Ok(SUCCESS),
    }
}

struct Decoded {
    records: Vec<HeaderRecord>,
    error: Option<CliError>,
}

/// Walk a captured stream header by header, skipping payloads.
fn decode_stream<R: Read>(inner: R, config: WireConfig) -> Decoded {
    let mut reader = HeaderReader::with_config(inner, config);
    let mut records = Vec::new();
    let mut scratch = vec![0u8; SKIP_CHUNK_SIZE];
    let mut offset = 0u64;

    let error = loop {
        let header = match reader.read_header() {
            Ok(header) => header,
            Err(WireError::ConnectionClosed) => break None,
            Err(err) => break Some(wire_error(&format!("bad header at offset {offset}"), err)),
        };
        records.push(HeaderRecord::new(offset, &header));

        let mut left = header.payload_len();
        while left > 0 {
            let want = left.min(scratch.len());
            match reader.read_payload(&mut scratch[..want]) {
                Ok(got) if got == want => left -= got,
                Ok(_) => {
                    return Decoded {
                        records,
                        error: Some(CliError::new(
                            DATA_INVALID,
                            format!("payload of header at offset {offset} is truncated"),
                        )),
                    }
                }
                Err(err) => {
                    return Decoded {
                        records,
                        error: Some(wire_error("read failed", err)),
                    }
                }
            }
        }
        offset += (HEADER_SIZE + header.payload_len()) as u64;
    };

    if error.is_none() && reader.buffered() > 0 {
        warn!(offset, trailing = reader.buffered(), "partial header at end of capture");
    }
    Decoded { records, error }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use vmlink_wire::{FrameWriter, Header, PayloadType};

    use super::*;

    fn capture(frames: &[(Header, &[u8])]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        for (header, payload) in frames {
            writer.send(header, payload).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn lists_headers_with_offsets() {
        let bytes = capture(&[
            (Header::new(PayloadType::Msg, 0, 5, 7), b"hello"),
            (Header::new(PayloadType::Close, 0, 5, 7), b""),
        ]);
        let decoded = decode_stream(Cursor::new(bytes), WireConfig::default());

        assert!(decoded.error.is_none());
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].size, 5);
        assert_eq!(decoded.records[1].offset, (HEADER_SIZE + 5) as u64);
        assert_eq!(decoded.records[1].payload_type, "CLOSE");
    }

    #[test]
    fn truncated_payload_keeps_earlier_records() {
        let mut bytes = capture(&[
            (Header::new(PayloadType::Msg, 0, 5, 7), b"ok"),
            (Header::new(PayloadType::Msg, 0, 5, 7), b"cut short"),
        ]);
        bytes.truncate(bytes.len() - 3);
        let decoded = decode_stream(Cursor::new(bytes), WireConfig::default());

        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.error.map(|e| e.code), Some(DATA_INVALID));
    }

    #[test]
    fn garbage_is_rejected() {
        let decoded = decode_stream(Cursor::new(vec![0u8; 40]), WireConfig::default());
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.error.map(|e| e.code), Some(DATA_INVALID));
    }
}
