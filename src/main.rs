//! Binary entrypoint for the pixelgw CLI.
//!
//! Commands:
//! - `start [--input <file>]` - run the gateway, replaying scan lines from stdin or a file
//! - `init` - create a starter `config.toml`
//! - `decode <hex> [--address <mac>] [--rssi <dbm>]` - classify a payload and print its fields
//! - `vmac <gateway_id>` - print the virtual bridge MAC derived from a gateway id
//!
//! Scan lines look like `<hex> <address> <rssi> [timestamp_ms] [name]`. Lines starting
//! with `#` are skipped.
//!
//! See the library crate docs for module-level details: `pixelgw::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use pixelgw::clock::now_millis;
use pixelgw::config::Config;
use pixelgw::context::{Backends, GatewayContext};
use pixelgw::logutil::escape_log;
use pixelgw::packet::codec::virtual_bridge_mac;
use pixelgw::packet::{classify, ScanEvent};
use pixelgw::queue::broker::LoggingTransportFactory;
use pixelgw::queue::credentials::LocalCredentialApi;
use pixelgw::registry::OfflineResolver;

#[derive(Parser)]
#[command(name = "pixelgw")]
#[command(about = "A BLE-to-cloud gateway for pixel tags and bridges")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and feed it scan lines
    Start {
        /// Read scan lines from this file instead of stdin
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Classify one payload and print the decoded fields as JSON
    Decode {
        /// Payload, hex
        payload: String,
        /// Source address
        #[arg(short, long, default_value = "00:00:00:00:00:00")]
        address: String,
        /// Received signal strength, dBm
        #[arg(short, long, default_value_t = -60, allow_hyphen_values = true)]
        rssi: i32,
    },
    /// Print the virtual bridge MAC for a gateway id
    Vmac { gateway_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { input } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            info!("Starting pixelgw v{}", env!("CARGO_PKG_VERSION"));

            let drain = Duration::from_millis(
                config.timing.management_window_ms() + config.timing.pipeline_tick_ms() + config.timing.queue_tick_ms(),
            );
            let ctx = GatewayContext::start(
                config,
                Backends {
                    bridge_resolver: Arc::new(OfflineResolver),
                    beacon_resolver: Arc::new(OfflineResolver),
                    credentials: Arc::new(LocalCredentialApi),
                    transport: Arc::new(LoggingTransportFactory),
                },
            )?;

            let fed = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("cannot open scan input {}", path))?;
                    replay(&ctx, BufReader::new(file)).await?
                }
                None => replay(&ctx, BufReader::new(tokio::io::stdin())).await?,
            };
            info!("{} scan line(s) fed, draining", fed);
            tokio::time::sleep(drain).await;

            let m = pixelgw::metrics::snapshot();
            info!(
                "scans={} unrecognized={} published={} failed={} echoes={}",
                m.scans_received, m.scans_unrecognized, m.publish_ok, m.publish_failed, m.echoes_emitted
            );
            ctx.shutdown().await;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Decode {
            payload,
            address,
            rssi,
        } => {
            init_logging(&None, cli.verbose);
            let packet = classify(&ScanEvent::new(payload.as_str(), address.as_str(), rssi, now_millis()))
                .ok_or_else(|| anyhow!("unrecognized payload"))?;
            let fields: serde_json::Map<String, serde_json::Value> = packet
                .layout()
                .and_then(|l| l.decode(packet.body()))
                .map(|v| v.iter().map(|(k, n)| (k.to_string(), serde_json::json!(n))).collect())
                .unwrap_or_default();
            let out = serde_json::json!({
                "kind": packet.kind,
                "bridgeId": packet.bridge_id(),
                "apiVersion": packet.api_version(),
                "firmwareVersion": packet.firmware_version(),
                "fields": fields,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Vmac { gateway_id } => {
            println!("{}", virtual_bridge_mac(&gateway_id));
        }
    }

    Ok(())
}

/// Feed scan lines until EOF or Ctrl-C. Returns the number of events ingested.
async fn replay<R: AsyncBufRead + Unpin>(ctx: &GatewayContext, reader: R) -> Result<usize> {
    let mut lines = reader.lines();
    let mut fed = 0usize;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_scan_line(&line) {
                    Some(event) => {
                        ctx.ingest(event);
                        fed += 1;
                    }
                    None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                    None => warn!("skipping malformed scan line: {}", escape_log(&line)),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(fed)
}

/// `<hex> <address> <rssi> [timestamp_ms] [name]`
fn parse_scan_line(line: &str) -> Option<ScanEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let payload = parts.next()?;
    let address = parts.next()?;
    let rssi = parts.next()?.parse::<i32>().ok()?;
    let mut timestamp = now_millis();
    let mut name = None;
    if let Some(next) = parts.next() {
        match next.parse::<i64>() {
            Ok(ts) => {
                timestamp = ts;
                name = parts.next();
            }
            Err(_) => name = Some(next),
        }
    }
    // `-` stands for an empty payload, as for connectable bridge advertisements
    let payload = if payload == "-" { "" } else { payload };
    let event = ScanEvent::new(payload, address, rssi, timestamp);
    Some(match name {
        Some(n) => event.with_name(n, true),
        None => event,
    })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let mut level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if let Some(cfg) = config {
        if verbosity == 0 {
            if let Ok(l) = cfg.logging.level.parse::<log::LevelFilter>() {
                level = l;
            }
        }
    }
    builder.filter_level(level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());
    let file = file.map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
    // Foreground with a file sink: write to both
    let is_tty = atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if record.target() == "security" {
            if let Some(ref sec_path) = security_path {
                if let Ok(mut sf) = std::fs::OpenOptions::new().create(true).append(true).open(sec_path) {
                    let _ = writeln!(sf, "{}", line);
                }
            }
        }

        match &file {
            Some(f) => {
                if let Ok(mut guard) = f.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            }
            None => writeln!(fmt, "{}", line),
        }
    });
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_lines_with_optional_fields() {
        let e = parse_scan_line("AFFD00 AA:BB:CC:DD:EE:FF -61 1700000000000").unwrap();
        assert_eq!(e.rssi, -61);
        assert_eq!(e.timestamp, 1_700_000_000_000);
        assert!(e.name.is_none());

        let e = parse_scan_line("- AA:BB:CC:DD:EE:FF -70 WLT_0A1B2C3D4E5F").unwrap();
        assert_eq!(e.payload, "");
        assert_eq!(e.name.as_deref(), Some("WLT_0A1B2C3D4E5F"));
        assert!(e.connectable);

        assert!(parse_scan_line("# comment").is_none());
        assert!(parse_scan_line("AFFD00 AA:BB").is_none());
    }
}
