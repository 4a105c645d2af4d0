// gattlink — desktop BLE workbench
//
// Cross-platform (macOS, Linux, Windows) command-line front end for the
// gattlink session core, driving the local adapter through btleplug.

mod btle;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gattlink_core::codec;
use gattlink_core::{
    BleSession, Capability, EventLoopHandle, PayloadSink, PeripheralRecord, RadioBridge,
    RadioEventHub, SessionSettings, SessionState,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "gattlink — scan, connect and talk to a BLE peripheral", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for peripherals and list what was found
    Scan {
        /// Scan length in seconds (defaults to the configured value)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect and list services, characteristics and capabilities
    Inspect { id: String },
    /// Read a readable characteristic as text
    Read {
        id: String,
        #[arg(short, long, default_value = "0")]
        index: usize,
    },
    /// Write text to a writable characteristic
    Write {
        id: String,
        text: String,
        #[arg(short, long, default_value = "0")]
        index: usize,
        /// Use write-without-response
        #[arg(long)]
        no_response: bool,
        /// Treat the text as hex and wrap it in a FEFD..FCFB frame
        #[arg(long)]
        framed: bool,
    },
    /// Subscribe to notifications and print every payload
    Monitor {
        id: String,
        #[arg(short, long, default_value = "0")]
        index: usize,
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Decode a manufacturer MAC string such as "<80eaca 000001>"
    Mac { raw: String },
    /// Wrap a hex payload in a FEFD..FCFB frame
    Frame { hex: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    gattlink_core::init_logging("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { duration } => cmd_scan(duration).await,
        Commands::Inspect { id } => cmd_inspect(id).await,
        Commands::Read { id, index } => cmd_read(id, index).await,
        Commands::Write {
            id,
            text,
            index,
            no_response,
            framed,
        } => cmd_write(id, text, index, no_response, framed).await,
        Commands::Monitor { id, index, seconds } => cmd_monitor(id, index, seconds).await,
        Commands::Mac { raw } => cmd_mac(raw),
        Commands::Frame { hex } => cmd_frame(hex),
        Commands::Config { action } => cmd_config(action),
    }
}

// ============================================================================
// SESSION PLUMBING
// ============================================================================

/// A session bound to the local adapter, dispatching radio events while alive
struct Workbench {
    session: Arc<BleSession>,
    request_timeout: Duration,
    _events: EventLoopHandle,
}

impl Workbench {
    async fn open(settings: SessionSettings, sink: Option<Arc<dyn PayloadSink>>) -> Result<Self> {
        let config = config::Config::load()?;
        let request_timeout = Duration::from_secs(config.request_timeout_secs);

        let hub = RadioEventHub::new(settings.event_buffer);
        let radio = btle::BtleplugRadio::open(config.adapter_index, request_timeout, hub.clone())
            .await?;
        let radio: Arc<dyn RadioBridge> = Arc::new(radio);

        let session = match sink {
            Some(sink) => BleSession::with_payload_sink(settings, radio, sink),
            None => BleSession::new(settings, radio),
        }
        .context("Invalid session settings")?;
        let session = Arc::new(session);
        let events = session.attach(&hub);

        session.check_state().await?;
        wait_for(request_timeout, || session.radio_on())
            .await
            .context("Bluetooth adapter is not powered on")?;

        Ok(Self {
            session,
            request_timeout,
            _events: events,
        })
    }

    /// Scan until `id` shows up in the catalog
    async fn find(&self, id: &str) -> Result<PeripheralRecord> {
        self.ensure_scanning().await?;

        let session = &self.session;
        let seen = |session: &BleSession| {
            session
                .devices()
                .into_iter()
                .find(|r| r.id.eq_ignore_ascii_case(id))
        };
        // The scan timer returns the session to Idle when the window closes
        let window =
            Duration::from_secs(session.settings().scan_duration_secs) + self.request_timeout;
        wait_for(window, || {
            seen(session).is_some() || session.state() == SessionState::Idle
        })
        .await?;

        seen(session).with_context(|| format!("Peripheral {} not found", id))
    }

    async fn ensure_scanning(&self) -> Result<()> {
        if self.session.state() != SessionState::Scanning {
            self.session.start_scan().await?;
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<()> {
        let record = self.find(id).await?;
        println!(
            "{} Connecting to {} ({})",
            "→".bright_blue(),
            record.display_name().bright_cyan(),
            record.id
        );
        self.session.connect(&record.id).await?;
        println!("  {} Connected", "✓".green());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.session.state().is_connected() {
            self.session.disconnect().await?;
        }
        Ok(())
    }
}

/// Poll `condition` every 50 ms until it holds or `limit` elapses
async fn wait_for(limit: Duration, condition: impl Fn() -> bool) -> Result<()> {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("Timed out after {:?}", limit))
}

fn session_settings() -> Result<SessionSettings> {
    Ok(config::Config::load()?.session)
}

fn print_record(index: usize, record: &PeripheralRecord) {
    let rssi = record
        .advertising
        .rssi
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {} {:<18} {:<24} {}",
        format!("[{}]", index).dimmed(),
        record.id.bright_cyan(),
        record.display_name(),
        rssi.dimmed()
    );
    if let Some(mac) = record.advertising.mac_address() {
        println!("      MAC:  {}", mac.bright_yellow());
    }
    if let Some(data) = &record.advertising.manufacturer_data {
        println!("      Data: {}", data.dimmed());
    }
}

/// Hex payload plus its text rendering when it decodes
fn describe_payload(hex: &str) -> String {
    match codec::hex_to_bytes(hex) {
        Ok(bytes) => format!("{}  {:?}", hex, codec::bytes_to_text(&bytes)),
        Err(_) => hex.to_string(),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn cmd_scan(duration: Option<u64>) -> Result<()> {
    let mut settings = session_settings()?;
    if let Some(secs) = duration {
        settings.scan_duration_secs = secs;
    }
    let scan_length = Duration::from_secs(settings.scan_duration_secs);

    let bench = Workbench::open(settings, None).await?;
    println!(
        "{} Scanning for {}s...",
        "→".bright_blue(),
        scan_length.as_secs()
    );
    bench.ensure_scanning().await?;

    let session = &bench.session;
    wait_for(scan_length + bench.request_timeout, || {
        session.state() == SessionState::Idle
    })
    .await?;

    let devices = session.devices();
    println!();
    if devices.is_empty() {
        println!("{}", "No peripherals found.".dimmed());
    } else {
        println!("{} ({} found)", "Peripherals".bold(), devices.len());
        println!();
        for (index, record) in devices.iter().enumerate() {
            print_record(index, record);
        }
    }

    Ok(())
}

async fn cmd_inspect(id: String) -> Result<()> {
    let bench = Workbench::open(session_settings()?, None).await?;
    bench.connect(&id).await?;
    let session = &bench.session;

    if let Some(peripheral_id) = session.peripheral_id() {
        match session.read_rssi(&peripheral_id).await {
            Ok(rssi) => println!("  RSSI: {} dBm", rssi),
            Err(e) => println!("  RSSI: {}", e.to_string().dimmed()),
        }
    }

    let index = session.capabilities();
    println!();
    println!("{}", "Capabilities".bold());
    for capability in Capability::ALL {
        let entries = index.list(capability);
        println!("  {} ({})", capability.to_string().bright_cyan(), entries.len());
        if entries.is_empty() {
            println!("    {}", "(none)".dimmed());
        }
        for (i, characteristic) in entries.iter().enumerate() {
            println!("    {} {}", format!("[{}]", i).dimmed(), characteristic);
        }
    }

    bench.close().await
}

async fn cmd_read(id: String, index: usize) -> Result<()> {
    let bench = Workbench::open(session_settings()?, None).await?;
    bench.connect(&id).await?;

    let result = bench.session.read(index).await;
    bench.close().await?;

    let text = result?;
    println!("{}", "Value".bold());
    println!("  {}", text.bright_cyan());
    Ok(())
}

async fn cmd_write(
    id: String,
    text: String,
    index: usize,
    no_response: bool,
    framed: bool,
) -> Result<()> {
    let mut settings = session_settings()?;
    if framed {
        // Fail on bad hex before touching the radio
        codec::frame(&text).context("Invalid frame payload")?;
        settings.frame_outgoing = true;
    }

    let bench = Workbench::open(settings, None).await?;
    bench.connect(&id).await?;

    let result = if no_response {
        bench.session.write_without_response(&text, index).await
    } else {
        bench.session.write(&text, index).await
    };
    bench.close().await?;
    result?;

    let mode = if no_response { "without response" } else { "with response" };
    println!("{} Wrote {} ({})", "✓".green(), text.bright_cyan(), mode.dimmed());
    Ok(())
}

async fn cmd_monitor(id: String, index: usize, seconds: Option<u64>) -> Result<()> {
    let printer = |peripheral_id: &str, payload: &str| {
        println!("  {} {}", peripheral_id.dimmed(), describe_payload(payload));
    };
    let sink: Arc<dyn PayloadSink> = Arc::new(printer);

    let bench = Workbench::open(session_settings()?, Some(sink)).await?;
    bench.connect(&id).await?;
    let characteristic = bench.session.enable_notify(index).await?;

    println!(
        "{} Monitoring {} {}",
        "→".bright_blue(),
        characteristic.to_string().bright_cyan(),
        "(Ctrl-C to stop)".dimmed()
    );

    let session = &bench.session;
    let dropped = async {
        while session.state().is_connected() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    let elapsed = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!(),
        _ = elapsed => {}
        _ = dropped => {
            println!("{}", "Peripheral disconnected.".bright_red());
            return Ok(());
        }
    }

    if let Err(e) = session.disable_notify(index).await {
        tracing::warn!("Failed to stop notifications: {}", e);
    }
    bench.close().await?;
    println!("{} Stopped ({} bytes received)", "✓".green(), session.received_data().len() / 2);
    Ok(())
}

fn cmd_mac(raw: String) -> Result<()> {
    let mac = codec::mac_from_advertising(&raw)
        .with_context(|| format!("No MAC address in {:?}", raw))?;
    println!("{}", mac.bright_cyan());
    Ok(())
}

fn cmd_frame(hex: String) -> Result<()> {
    let framed = codec::frame(&hex)?;
    println!("{}", framed.bright_cyan());
    println!("  Length: {} bytes", codec::hex_byte_length(&hex).dimmed());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!("  {}", config::Config::config_file()?.display().to_string().dimmed());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_write_flags() {
        let cli = Cli::parse_from(["gattlink", "write", "A1", "A0B1", "--index", "2", "--framed"]);
        match cli.command {
            Commands::Write {
                id,
                text,
                index,
                no_response,
                framed,
            } => {
                assert_eq!(id, "A1");
                assert_eq!(text, "A0B1");
                assert_eq!(index, 2);
                assert!(!no_response);
                assert!(framed);
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn test_describe_payload_shows_text() {
        assert_eq!(describe_payload("4869"), "4869  \"Hi\"");
        assert_eq!(describe_payload("xyz"), "xyz");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(wait_for(Duration::from_millis(20), || false).await.is_err());
        assert!(wait_for(Duration::from_millis(20), || true).await.is_ok());
    }
}
