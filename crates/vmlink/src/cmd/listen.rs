use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};
use vmlink_core::{Context, LinkError, Message, RecvFlags, Transport, VirtualChannel};
use vmlink_transport::{PhysicalChannel, UnixSocketListener};

use crate::cmd::ListenArgs;
use crate::exit::{io_error, link_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Received {
    vcid: u32,
    session: u32,
    msg: Message,
}

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.transport_config()?;
    let capacity = config.max_payload_size;
    let listener = UnixSocketListener::bind_with_config(&args.path, config.wire_config())
        .map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let channel = listener
        .accept("listen")
        .map_err(|err| transport_error("accept failed", err))?;
    let pchan: Arc<dyn PhysicalChannel> =
        Arc::new(channel.with_vmids(args.link.vmid_local, args.link.vmid_remote));

    let transport = Arc::new(Transport::new(config));
    let context = Arc::new(Context::new());
    let mut vchans = Vec::with_capacity(args.open.len());
    for spec in &args.open {
        let vchan = transport
            .open_channel(
                pchan.clone(),
                spec.vcid,
                spec.session,
                spec.remote_vcid,
                context.clone(),
            )
            .map_err(|err| link_error("open failed", err))?;
        vchans.push(vchan);
    }

    let pump = {
        let transport = transport.clone();
        let pchan = pchan.clone();
        thread::Builder::new()
            .name("pump".into())
            .spawn(move || transport.run(pchan))
            .map_err(|err| io_error("failed to start receive pump", err))?
    };

    let (tx, rx) = mpsc::channel();
    for vchan in &vchans {
        let vchan = vchan.clone();
        let tx = tx.clone();
        thread::Builder::new()
            .name(format!("vcid-{:#x}", vchan.id()))
            .spawn(move || receive_loop(&vchan, capacity, &tx))
            .map_err(|err| io_error("failed to start receiver", err))?;
    }
    drop(tx);

    let mut printed = 0usize;
    let mut disconnected = false;
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(received) => {
                print_message(received.vcid, received.session, &received.msg, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                disconnected = true;
                break;
            }
        }
    }

    let imports = context.pending_imports();
    if !imports.is_empty() {
        info!(?imports, "exports received");
    }
    for vchan in &vchans {
        if let Err(err) = transport.close(vchan) {
            debug!(vcid = vchan.id(), error = %err, "close not delivered");
        }
    }

    // Receivers only all stop once the pump has detached, so it is about to return.
    if disconnected || pump.is_finished() {
        match pump.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(link_error("receive failed", err)),
            Err(_) => return Err(CliError::new(INTERNAL, "receive pump panicked")),
        }
    }
    Ok(SUCCESS)
}

fn receive_loop(vchan: &VirtualChannel, capacity: usize, tx: &Sender<Received>) {
    loop {
        match vchan.dequeue(capacity, RecvFlags::BLOCKING) {
            Ok(Some(msg)) => {
                let received = Received {
                    vcid: vchan.id(),
                    session: vchan.session_id(),
                    msg,
                };
                if tx.send(received).is_err() {
                    return;
                }
            }
            Ok(None) | Err(LinkError::Interrupted) => continue,
            Err(err) => {
                debug!(vcid = vchan.id(), error = %err, "receiver stopped");
                return;
            }
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
