use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use unicorn_rs::{PairedDevice, Unicorn, UnicornConnector, SAMPLING_RATE_HZ};

#[derive(Parser, Debug)]
#[command(
    name = "unicorn-demo",
    about = "Connect to a Unicorn headset and stream samples"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List paired headsets (requires the bluez feature).
    List,
    /// Connect to a headset and stream for a while.
    Stream {
        /// Device serial (Bluetooth name), e.g. UN-2021.02.47.
        #[arg(long, conflicts_with = "mac")]
        serial: Option<String>,
        /// MAC address of an already-paired headset.
        #[arg(long)]
        mac: Option<String>,
        /// Serial port path (e.g. /dev/rfcomm0) instead of Bluetooth.
        #[arg(long, conflicts_with_all = ["serial", "mac"])]
        port: Option<String>,
        /// Streaming duration in seconds.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() {
    unicorn_rs::init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::List => list(),
        Command::Stream {
            serial,
            mac,
            port,
            seconds,
        } => stream(serial, mac, port, seconds),
    }
}

#[cfg(feature = "bluez")]
fn list() -> Result<()> {
    let connector = UnicornConnector::default();
    let devices = connector.list_paired()?;
    if devices.is_empty() {
        println!("No paired headsets found.");
    }
    for device in devices {
        println!("{}\t{}", device.name, device.address);
    }
    Ok(())
}

#[cfg(not(feature = "bluez"))]
fn list() -> Result<()> {
    bail!("device listing requires the bluez feature")
}

fn open_device(serial: Option<String>, mac: Option<String>, port: Option<String>) -> Result<Unicorn> {
    if let Some(path) = port {
        println!("Opening serial port {path}...");
        return Ok(Unicorn::connect_serial(&path)?);
    }

    let connector = UnicornConnector::default();
    let target = match (serial, mac) {
        (_, Some(mac)) => PairedDevice {
            name: String::new(),
            address: mac,
        },
        #[cfg(feature = "bluez")]
        (Some(serial), None) => {
            let devices = connector.list_paired()?;
            match devices.into_iter().find(|d| d.name == serial) {
                Some(device) => device,
                None => bail!("no paired headset named {serial}"),
            }
        }
        #[cfg(not(feature = "bluez"))]
        (Some(_), None) => bail!("lookup by serial requires the bluez feature; use --mac"),
        (None, None) => bail!("one of --serial, --mac or --port is required"),
    };

    println!("Connecting to {} ({})...", target.name, target.address);
    let stream = connector.connect(&target)?;
    Ok(Unicorn::from_rfcomm(stream))
}

fn stream(
    serial: Option<String>,
    mac: Option<String>,
    port: Option<String>,
    seconds: u64,
) -> Result<()> {
    let mut device = open_device(serial, mac, port)?;

    println!("Connected. Starting acquisition...");
    device.start_acquisition()?;

    // One worker thread owns the session and drives the pipeline; clearing
    // the flag stops it cooperatively within get_data's one-second bound.
    let running = Arc::new(AtomicBool::new(true));
    let worker_flag = running.clone();
    let worker = thread::spawn(move || -> Result<(u64, u64)> {
        let mut genuine = 0u64;
        let mut interpolated = 0u64;
        while worker_flag.load(Ordering::Relaxed) {
            let sample = device.get_data()?;
            if sample.valid {
                genuine += 1;
            } else {
                interpolated += 1;
            }
            if (genuine + interpolated) % SAMPLING_RATE_HZ as u64 == 0 {
                println!(
                    "counter={} battery={:.0}% eeg0={:+9.2} uV",
                    sample.counter, sample.battery_percent, sample.eeg[0]
                );
            }
        }
        device.stop_acquisition()?;
        device.close();
        Ok((genuine, interpolated))
    });

    thread::sleep(Duration::from_secs(seconds));
    running.store(false, Ordering::Relaxed);

    match worker.join() {
        Ok(result) => {
            let (genuine, interpolated) = result?;
            println!("Done: {genuine} samples received, {interpolated} interpolated.");
            Ok(())
        }
        Err(_) => bail!("worker thread panicked"),
    }
}
