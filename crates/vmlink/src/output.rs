use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use vmlink_core::Message;
use vmlink_wire::{ExportAck, Header};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    vcid: u32,
    session: u32,
    size: usize,
    sequence_rx: u32,
    scattered: bool,
    payload: String,
    timestamp: String,
}

pub fn print_message(vcid: u32, session: u32, msg: &Message, format: OutputFormat) {
    let payload = msg.to_vec();
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                vcid,
                session,
                size: msg.len(),
                sequence_rx: msg.sequence_rx(),
                scattered: msg.is_scattered(),
                payload: payload_preview(&payload),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["VCID", "SESSION", "SIZE", "SEQ", "PAYLOAD"]);
            table.add_row(vec![
                format!("{vcid:#x}"),
                session.to_string(),
                msg.len().to_string(),
                msg.sequence_rx().to_string(),
                payload_preview(&payload),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "vcid={vcid:#x} session={session} size={} seq={} payload={}",
                msg.len(),
                msg.sequence_rx(),
                payload_preview(&payload)
            );
        }
        OutputFormat::Raw => print_raw(&payload),
    }
}

/// A header found while decoding a captured stream.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderRecord {
    pub offset: u64,
    pub payload_type: String,
    pub vcid: u32,
    pub session: u32,
    pub size: u32,
    pub sequence: u32,
}

impl HeaderRecord {
    pub fn new(offset: u64, header: &Header) -> Self {
        Self {
            offset,
            payload_type: header.payload_type.to_string(),
            vcid: header.vchan_id,
            session: header.session_id,
            size: header.size,
            sequence: header.sequence,
        }
    }
}

pub fn print_headers(records: &[HeaderRecord], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            for record in records {
                print_json(record);
            }
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["OFFSET", "TYPE", "VCID", "SESSION", "SIZE", "SEQ"]);
            for r in records {
                table.add_row(vec![
                    r.offset.to_string(),
                    r.payload_type.clone(),
                    format!("{:#x}", r.vcid),
                    r.session.to_string(),
                    r.size.to_string(),
                    r.sequence.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for r in records {
                println!(
                    "@{} {} vcid={:#x} session={} size={} seq={}",
                    r.offset, r.payload_type, r.vcid, r.session, r.size, r.sequence
                );
            }
        }
    }
}

#[derive(Serialize)]
struct ExportAckOutput {
    export_id: u32,
    vcid_local: u32,
    vcid_remote: u32,
}

pub fn print_export_ack(ack: &ExportAck, format: OutputFormat) {
    let out = ExportAckOutput {
        export_id: ack.export_id,
        vcid_local: ack.vcid_local,
        vcid_remote: ack.vcid_remote,
    };
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&out),
        OutputFormat::Table => {
            let mut table = new_table(vec!["EXPORT", "VCID", "REMOTE VCID"]);
            table.add_row(vec![
                out.export_id.to_string(),
                format!("{:#x}", out.vcid_local),
                format!("{:#x}", out.vcid_remote),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "export {} acknowledged vcid={:#x} remote={:#x}",
            out.export_id, out.vcid_local, out.vcid_remote
        ),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
