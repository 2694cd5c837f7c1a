//! Command-line front end: run the ground-station link, generate a key
//! file, or print the current link counters.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wfb_groundstation::config::Config;
use wfb_groundstation::crypto::session::{build_key_file, generate_keypair_bytes, load_key_material};
use wfb_groundstation::dispatch::{StreamKind, UdpSink};
use wfb_groundstation::driver::{LoopbackDriver, RadioDriver};
use wfb_groundstation::orchestrator::{ChannelSpec, OrchestratorCore};

/// UserPacket plus its 3-byte header, rounded up for Reed-Solomon padding.
const MAX_FRAGMENT_SIZE: usize = wfb_groundstation::wire::MAX_PAYLOAD + 3;
/// Local port the uplink (GS -> air) datagrams arrive on.
const UPLINK_PORT: u16 = 8001;
/// Port the adaptive-link report is sent to on the peer.
const ADAPTIVE_REPORT_PORT: u16 = 9999;

#[derive(Parser)]
#[command(name = "wfb-groundstation")]
#[command(about = "FEC-protected, encrypted ground-station link for digital FPV video", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the link: bring up the radio driver, the secure FEC channels
    /// for video/MAVLink/tunnel, and the adaptive-link control loop.
    Run {
        /// Stop automatically after this many seconds (default: run until killed)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Generate a fresh long-lived keypair and write the 64-byte key file
    /// this side and its peer both need (own secret + peer's public key
    /// must be exchanged out of band).
    Keygen {
        /// Where to write the key file
        #[arg(short, long, default_value = "wfb.key")]
        out: std::path::PathBuf,
    },

    /// Print the active configuration and a link-status snapshot as JSON.
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Run { duration } => run(duration),
        Commands::Keygen { out } => keygen(&out),
        Commands::Stats => stats(),
    }
}

fn keygen(out: &std::path::Path) -> Result<()> {
    let (secret, public) = generate_keypair_bytes();
    tracing::warn!(
        "generated a standalone keypair; this side's secret must be paired with the \
         peer's public key (and vice versa) to build a working 64-byte key file"
    );
    // Self-paired for convenience: swap in the peer's real public key bytes
    // before deploying two ends of the link.
    let bytes = build_key_file(&secret, &public);
    std::fs::write(out, &bytes).with_context(|| format!("writing key file {}", out.display()))?;
    tracing::info!(path = %out.display(), "wrote key file");
    Ok(())
}

fn stats() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    config.validate()?;
    let status = wfb_groundstation::orchestrator::OrchestratorStatus::default();
    let snapshot = serde_json::json!({
        "config": config,
        "status": status,
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn run(duration: Option<u64>) -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    config.validate()?;

    let key_bytes = std::fs::read(&config.key_file)
        .with_context(|| format!("reading key file {}", config.key_file.display()))?;
    let _ = load_key_material(&config.key_file)?; // fail fast on a malformed key file

    let driver = Arc::new(LoopbackDriver::new());
    driver.set_tx_power(config.tx_power);
    tracing::warn!(
        "using the in-process loopback radio driver; a real USB chipset binding is out of scope \
         and must be supplied by the host application"
    );

    let video_sink = UdpSink::bind_with_rcvbuf("127.0.0.1:5600".parse()?, config.rcv_buf)
        .context("binding video downlink sink")?;
    let mavlink_sink = UdpSink::bind_with_rcvbuf("127.0.0.1:14550".parse()?, config.rcv_buf)
        .context("binding mavlink downlink sink")?;
    let tunnel_sink = UdpSink::bind_with_rcvbuf("127.0.0.1:8000".parse()?, config.rcv_buf)
        .context("binding tunnel downlink sink")?;

    let specs = vec![
        ChannelSpec {
            kind: StreamKind::Video,
            mac_channel_id: config.channel_id(config.radio_ports.video),
            k: config.k,
            n: config.n,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            reorders_rtp: true,
            sink: Box::new(video_sink),
        },
        ChannelSpec {
            kind: StreamKind::Mavlink,
            mac_channel_id: config.channel_id(config.radio_ports.mavlink),
            k: config.k,
            n: config.n,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            reorders_rtp: false,
            sink: Box::new(mavlink_sink),
        },
        ChannelSpec {
            kind: StreamKind::Tunnel,
            mac_channel_id: config.channel_id(config.radio_ports.tunnel),
            k: config.k,
            n: config.n,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            reorders_rtp: false,
            sink: Box::new(tunnel_sink),
        },
    ];

    let report_target = format!("{}:{}", config.adaptive.target_host, ADAPTIVE_REPORT_PORT)
        .parse()
        .context("parsing adaptive-report target")?;

    let orchestrator = OrchestratorCore::new(
        driver,
        &key_bytes,
        config.epoch,
        config.phy,
        config.fec_thresholds,
        wfb_groundstation::channel::DEFAULT_FEC_CLOSE_TIMEOUT_MS,
        config.adaptive.update_ms,
        report_target,
        specs,
    )?;
    let orchestrator = Arc::new(orchestrator);

    let uplink_socket2 = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .context("creating uplink socket")?;
    uplink_socket2.set_recv_buffer_size(config.rcv_buf).context("sizing uplink receive buffer")?;
    let bind_addr = std::net::SocketAddr::from((std::net::Ipv4Addr::LOCALHOST, UPLINK_PORT));
    uplink_socket2.bind(&bind_addr.into()).context("binding uplink socket")?;
    let uplink_socket: UdpSocket = uplink_socket2.into();
    uplink_socket.set_read_timeout(Some(Duration::from_millis(5)))?;
    let uplink_target = orchestrator.clone();
    orchestrator.start(move || {
        let mut buf = [0u8; 2048];
        if let Ok((n, _src)) = uplink_socket.recv_from(&mut buf) {
            let _ = uplink_target.inject_uplink(StreamKind::Mavlink, &buf[..n]);
        }
    })?;

    tracing::info!("link running");
    match duration {
        Some(secs) => {
            std::thread::sleep(Duration::from_secs(secs));
            orchestrator.stop();
        }
        // No duration given: block until the process is killed. There is no
        // installed signal handler, so shutdown is whatever the OS does to
        // the process; the background threads do not get a chance to join.
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }
    Ok(())
}
