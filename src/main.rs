//! `mt-npi-bridged` — host-side bridge between a UART-attached IEEE 802.15.4
//! co-processor and any number of TCP NPI clients.

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mt_npi_bridge::byte_stream::{ByteStream, TcpByteStream};
use mt_npi_bridge::config::Config;
use mt_npi_bridge::server::{Server, ServerOptions};

/// Global allocator: mimalloc gives better multi-threaded performance than
/// the system allocator under the per-connection worker-thread model.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook
/// compatibility).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "mt-npi-bridged")]
#[command(version)]
#[command(about = "MT transport + NPI multi-client bridge for an IEEE 802.15.4 co-processor")]
struct Cli {
    /// TCP address the NPI server binds for client connections.
    #[arg(long)]
    bind_addr: Option<String>,

    /// UART device path (e.g. /dev/ttyACM0). Requires the `serial` feature.
    #[arg(long)]
    uart_device: Option<String>,

    /// UART baud rate.
    #[arg(long)]
    uart_baud: Option<u32>,

    /// Connect to the co-processor over TCP instead of a real UART (used
    /// against a device emulator; always available, no feature required).
    #[arg(long)]
    uart_tcp: Option<String>,

    /// Disable the leading sync byte on the wire.
    #[arg(long)]
    no_frame_sync: bool,

    /// Disable the trailing XOR checksum on the wire.
    #[arg(long)]
    no_chksum: bool,

    /// Use a two-byte little-endian length field instead of one byte.
    #[arg(long)]
    len_2bytes: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn open_uart_stream(cli: &Cli, config: &Config) -> Result<Arc<dyn ByteStream>> {
    if let Some(addr) = cli.uart_tcp.as_deref() {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to co-processor emulator at {addr}"))?;
        return Ok(Arc::new(TcpByteStream::new(stream)?));
    }

    #[cfg(feature = "serial")]
    {
        let device = cli.uart_device.as_deref().unwrap_or(&config.uart_device);
        let baud = cli.uart_baud.unwrap_or(config.uart_baud_rate);
        return Ok(Arc::new(mt_npi_bridge::byte_stream::SerialByteStream::open(
            device, baud,
        )?));
    }

    #[cfg(not(feature = "serial"))]
    {
        let _ = &cli.uart_device;
        let _ = &cli.uart_baud;
        anyhow::bail!(
            "no UART backend available: pass --uart-tcp <addr>, or build with --features serial"
        )
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_default();
    if let Some(addr) = &cli.bind_addr {
        config.bind_addr = addr.clone();
    }
    if let Some(device) = &cli.uart_device {
        config.uart_device = device.clone();
    }
    if let Some(baud) = cli.uart_baud {
        config.uart_baud_rate = baud;
    }
    if cli.no_frame_sync {
        config.frame_sync = false;
    }
    if cli.no_chksum {
        config.include_chksum = false;
    }
    if cli.len_2bytes {
        config.len_2bytes = true;
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let uart_stream = open_uart_stream(&cli, &config)?;

    let opts = ServerOptions {
        uart_cfg: config.uart_iface_config(),
        socket_cfg_template: config.socket_iface_config(),
        bind_addr: config.bind_addr.clone(),
    };
    let server = Server::start(opts, uart_stream)?;
    log::info!("mt-npi-bridged started, bound on {}", config.bind_addr);

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        if server.uart_is_dead() {
            anyhow::bail!("UART interface died; shutting down");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutdown signal received, tearing down");
    drop(server);

    Ok(())
}
