//! Rivulet receiver daemon.
//!
//! Listens on one UDP channel, subscribes to the given streams and builds an
//! image for every publication that completes the SETUP handshake.
//!
//! # Usage
//!
//! ```sh
//! rivulet-receiver --bind 0.0.0.0:40123 --stream 10 --stream 11
//! rivulet-receiver --bind 224.10.9.7:40456 --control 224.10.9.8:40456 --stream 10
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rivulet::media::{ChannelEndpointConfig, Image, ReceiveChannelEndpoint};
use rivulet::net::Endpoint;
use rivulet::protocol::StreamId;
use rivulet::runtime::{
    self, COMMAND_QUEUE_CAPACITY, IMAGE_REQUEST_QUEUE_CAPACITY, Receiver, ReceiverCommand,
    ReceiverConfig, ReceiverError,
};
use rivulet::sync::spsc;

/// Default bind address.
const DEFAULT_BIND: &str = "0.0.0.0:40123";

/// Default stream when none is given.
const DEFAULT_STREAM: i32 = 10;

/// Largest term length an image is built for unless overridden.
const DEFAULT_MAX_TERM_LENGTH: u32 = 16 * 1024 * 1024;

static NEXT_CORRELATION_ID: AtomicI64 = AtomicI64::new(1);

struct Args {
    endpoint: ChannelEndpointConfig,
    receiver: ReceiverConfig,
    streams: Vec<StreamId>,
    max_term_length: u32,
}

fn main() {
    rivulet::init_tracing();

    if let Err(e) = run() {
        eprintln!("rivulet-receiver: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ReceiverError> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let endpoint = Arc::new(ReceiveChannelEndpoint::open(&args.endpoint)?);
    eprintln!(
        "rivulet-receiver: listening on {} for {} stream(s)",
        args.endpoint.bind,
        args.streams.len()
    );

    let (commands, command_rx) = spsc::channel::<_, COMMAND_QUEUE_CAPACITY>();
    let (request_tx, requests) = spsc::channel::<_, IMAGE_REQUEST_QUEUE_CAPACITY>();
    let handle = runtime::spawn_receiver(Receiver::new(args.receiver, command_rx, request_tx))?;

    push(&commands, ReceiverCommand::AddEndpoint(endpoint));
    for stream_id in args.streams {
        push(&commands, ReceiverCommand::AddSubscription { stream_id });
    }

    // Minimal conductor: turn every request into an image.
    while !handle.is_finished() {
        let Some(request) = requests.pop() else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let correlation_id = NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed);
        match Image::with_term_limit(correlation_id, &request, args.max_term_length) {
            Ok(image) => {
                eprintln!(
                    "rivulet-receiver: image {correlation_id} for session {} stream {} from {}",
                    request.session_id, request.stream_id, request.source_address
                );
                push(&commands, ReceiverCommand::NewPublicationImage(Arc::new(image)));
            }
            Err(e) => {
                eprintln!(
                    "rivulet-receiver: rejecting session {} stream {}: {e}",
                    request.session_id, request.stream_id
                );
                push(
                    &commands,
                    ReceiverCommand::RemovePendingSetup {
                        session_id: request.session_id,
                        stream_id: request.stream_id,
                    },
                );
            }
        }
    }

    let _ = handle.join();
    Ok(())
}

fn push(commands: &runtime::CommandProducer, mut cmd: ReceiverCommand) {
    while let Err(back) = commands.push(cmd) {
        cmd = back;
        std::thread::yield_now();
    }
}

fn invalid(msg: impl Into<String>) -> ReceiverError {
    ReceiverError::InvalidArgument(msg.into())
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, ReceiverError>
where
    T::Err: std::fmt::Display,
{
    let value = args
        .get(i)
        .ok_or_else(|| invalid(format!("missing value for {flag}")))?;
    value
        .parse()
        .map_err(|e| invalid(format!("invalid value for {flag}: {e}")))
}

/// Parses command line arguments into receiver and endpoint configuration.
fn parse_args(args: &[String]) -> Result<Args, ReceiverError> {
    let mut bind: Option<SocketAddr> = None;
    let mut control: Option<SocketAddr> = None;
    let mut streams = Vec::new();
    let mut receiver = ReceiverConfig::default();
    let mut rcvbuf = None;
    let mut max_term_length = DEFAULT_MAX_TERM_LENGTH;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                i += 1;
                bind = Some(parse_value(args, i, "--bind")?);
            }
            "--control" | "-c" => {
                i += 1;
                control = Some(parse_value(args, i, "--control")?);
            }
            "--stream" | "-s" => {
                i += 1;
                streams.push(StreamId::new(parse_value(args, i, "--stream")?));
            }
            "--rcvbuf" => {
                i += 1;
                rcvbuf = Some(parse_value(args, i, "--rcvbuf")?);
            }
            "--max-term-length" => {
                i += 1;
                max_term_length = parse_value(args, i, "--max-term-length")?;
            }
            "--cool-down-ms" => {
                i += 1;
                receiver.image_cool_down_timeout =
                    Duration::from_millis(parse_value(args, i, "--cool-down-ms")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    let bind = match bind {
        Some(addr) => addr,
        None => DEFAULT_BIND
            .parse()
            .map_err(|e| invalid(format!("default bind address: {e}")))?,
    };
    if streams.is_empty() {
        streams.push(StreamId::new(DEFAULT_STREAM));
    }

    Ok(Args {
        endpoint: ChannelEndpointConfig {
            bind: Endpoint::from(bind),
            multicast_control: control.map(Endpoint::from),
            socket_rcvbuf: rcvbuf,
            ..ChannelEndpointConfig::default()
        },
        receiver,
        streams,
        max_term_length,
    })
}

fn print_usage() {
    eprintln!(
        r#"rivulet-receiver - receive-side image establishment

USAGE:
    rivulet-receiver [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>         Channel address, unicast or multicast group (default: 0.0.0.0:40123)
    -c, --control <ADDR>      Control address for a multicast channel
    -s, --stream <ID>         Subscribe to a stream (can be repeated, default: 10)
        --rcvbuf <BYTES>      Socket receive buffer size
        --cool-down-ms <MS>   Image cooldown after removal (default: 10000)
        --max-term-length <BYTES>
                              Largest term length accepted from a sender (default: 16777216)
    -h, --help                Print this help message

ENVIRONMENT:
    RUST_LOG                  Log filter when built with --features tracing

EXAMPLE:
    rivulet-receiver --bind 0.0.0.0:40123 --stream 10 --stream 11
"#
    );
}
