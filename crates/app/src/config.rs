//! Configuration parsing for the simulator.
//!
//! This module owns translation of CLI arguments into a `SimulatorConfig` struct
//! which the orchestrator uses without re-parsing flags.

use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use marker_core::is_peer_address;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7420";
pub const DEFAULT_LOG_DIR: &str = "v2v-logs";
pub const DEFAULT_MOTION_INTERVAL_MS: u64 = 60;

#[derive(Clone, Debug)]
/// Canonical configuration shared by every component of a run.
pub struct SimulatorConfig {
    /// Own transport address shown on the marker display, as given.
    pub own_address: Option<String>,
    /// Socket the session server listens on.
    pub listen: SocketAddr,
    /// Peer transport address to socket address.
    pub peers: HashMap<String, SocketAddr>,
    /// JSON scenario driving the simulated camera and motion sensor.
    pub scenario: Option<PathBuf>,
    pub frame: FrameOverrides,
    pub motion_interval: Duration,
    /// Directory holding the event log files.
    pub log_dir: PathBuf,
    /// Calibrate against the engaged peer once this frame number is processed.
    pub calibrate_at_frame: Option<u64>,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// Frame geometry flags taking precedence over the scenario.
pub struct FrameOverrides {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub fps: Option<f32>,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log filter to debug.
    pub verbose: bool,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct SimulatorCliArgs {
    /// Own transport address (six colon-separated hex pairs).
    #[arg(long = "address", value_name = "MAC")]
    pub address: Option<String>,
    /// Socket address the session server listens on.
    #[arg(long = "listen", value_name = "HOST:PORT", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,
    /// Peer directory entry, repeatable.
    #[arg(long = "peer", value_name = "MAC=HOST:PORT")]
    pub peers: Vec<String>,
    /// JSON scenario file.
    #[arg(long = "scenario", value_name = "PATH")]
    pub scenario: Option<PathBuf>,
    /// Frame width flag (overrides the scenario).
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Frame height flag (overrides the scenario).
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Frame rate flag (overrides the scenario).
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f32>,
    /// Interval between motion samples.
    #[arg(long = "motion-interval-ms", value_name = "MS", default_value_t = DEFAULT_MOTION_INTERVAL_MS)]
    pub motion_interval_ms: u64,
    /// Directory for log.txt, sent_data.txt and received_data.txt.
    #[arg(long = "log-dir", value_name = "DIR", default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,
    /// Calibrate distance automatically at this frame number.
    #[arg(long = "calibrate-at-frame", value_name = "N")]
    pub calibrate_at_frame: Option<u64>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<SimulatorCliArgs> for SimulatorConfig {
    type Error = anyhow::Error;

    fn try_from(args: SimulatorCliArgs) -> Result<Self> {
        // A malformed address is kept; it only disables the marker display.
        let own_address = args
            .address
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty());

        let listen = resolve_socket(&args.listen)
            .with_context(|| format!("Invalid --listen address {:?}", args.listen))?;

        let mut peers = HashMap::with_capacity(args.peers.len());
        for entry in &args.peers {
            let (address, socket) = parse_peer(entry)?;
            if peers.insert(address.clone(), socket).is_some() {
                bail!("Peer {address} listed more than once.");
            }
        }

        if let Some(width) = args.width.filter(|width| *width <= 0) {
            bail!("Width must be positive (got {width}).");
        }
        if let Some(height) = args.height.filter(|height| *height <= 0) {
            bail!("Height must be positive (got {height}).");
        }
        if let Some(fps) = args.fps.filter(|fps| !(fps.is_finite() && *fps > 0.0)) {
            bail!("Frame rate must be positive (got {fps}).");
        }
        if args.motion_interval_ms == 0 {
            bail!("Motion interval must be at least 1 ms.");
        }

        Ok(Self {
            own_address,
            listen,
            peers,
            scenario: args.scenario,
            frame: FrameOverrides {
                width: args.width,
                height: args.height,
                fps: args.fps,
            },
            motion_interval: Duration::from_millis(args.motion_interval_ms),
            log_dir: args.log_dir,
            calibrate_at_frame: args.calibrate_at_frame,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

/// Parse a `MAC=host:port` peer directory entry.
fn parse_peer(entry: &str) -> Result<(String, SocketAddr)> {
    let (address, socket) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid --peer {entry:?}. Expected <MAC>=<host:port>."))?;
    let address = address.trim();
    if !is_peer_address(address) {
        bail!("Invalid peer address {address:?} in --peer {entry:?}.");
    }
    let socket = resolve_socket(socket.trim())
        .with_context(|| format!("Invalid socket address in --peer {entry:?}"))?;
    Ok((address.to_string(), socket))
}

fn resolve_socket(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("{value} did not resolve to any address"))
}
