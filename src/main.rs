//! Swarm testbed controller CLI.
//!
//! Usage:
//!   swarmit --port /dev/ttyACM0 start
//!   swarmit --port /dev/ttyACM0 status --watch
//!   swarmit --port /dev/ttyACM0 flash firmware.bin --yes --start
//!   swarmit --wifi-host 192.168.1.10 monitor

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use swarmit_controller::{AdapterKind, CliOverrides, Controller, ControllerSettings, ResetLocation};

#[derive(Parser)]
#[command(name = "swarmit")]
#[command(version, about = "Swarm testbed controller CLI")]
struct Cli {
    /// Path to a .toml configuration file.
    #[arg(short = 'c', long = "config-path")]
    config_path: Option<PathBuf>,

    /// Serial port to use to reach the gateway (edge adapter).
    #[arg(short, long)]
    port: Option<String>,

    /// Serial port baudrate.
    #[arg(short, long)]
    baudrate: Option<u32>,

    /// MQTT/cloud host (cloud adapter).
    #[arg(short = 'H', long = "mqtt-host")]
    mqtt_host: Option<String>,

    /// MQTT/cloud port (cloud adapter).
    #[arg(short = 'P', long = "mqtt-port")]
    mqtt_port: Option<u16>,

    /// Use TLS with the cloud adapter.
    #[arg(short = 'T', long = "mqtt-use-tls")]
    mqtt_use_tls: bool,

    /// Mesh network ID to use, as a hex string.
    #[arg(short, long)]
    network_id: Option<String>,

    /// Which transport to instantiate.
    #[arg(short, long, value_enum)]
    adapter: Option<AdapterArg>,

    /// Subset list of device addresses to interact with, comma-separated.
    #[arg(short, long)]
    devices: Option<String>,

    /// Enable verbose diagnostic output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum AdapterArg {
    Edge,
    Cloud,
}

impl From<AdapterArg> for AdapterKind {
    fn from(value: AdapterArg) -> Self {
        match value {
            AdapterArg::Edge => AdapterKind::Edge,
            AdapterArg::Cloud => AdapterKind::Cloud,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start the user application on ready devices.
    Start,

    /// Stop the user application.
    Stop,

    /// Reset robot locations.
    ///
    /// Locations are given as '<device_addr>:<x>,<y>-<device_addr>:<x>,<y>-...'
    Reset { locations: String },

    /// Flash a firmware image to the robots.
    Flash {
        /// Flash without a confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Start the firmware once flashed.
        #[arg(short, long)]
        start: bool,

        /// Timeout in seconds for each OTA ACK message.
        #[arg(short = 't', long = "ota-timeout")]
        ota_timeout: Option<f64>,

        /// Number of retries for each OTA message (start or chunk) transfer.
        #[arg(short = 'r', long = "ota-max-retries")]
        ota_max_retries: Option<u32>,

        firmware: PathBuf,
    },

    /// Stream device log events.
    Monitor,

    /// Print current status of the robots.
    Status {
        /// Keep watching the testbed status.
        #[arg(short, long)]
        watch: bool,
    },

    /// Send a custom text message to the robots.
    Message { text: String },
}

fn build_settings(cli: &Cli) -> anyhow::Result<ControllerSettings> {
    let mut settings = ControllerSettings::load(cli.config_path.as_deref())?;
    let devices = cli.devices.as_ref().map(|text| {
        text.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<String>>()
    });
    settings.apply_overrides(CliOverrides {
        serial_port: cli.port.clone(),
        serial_baudrate: cli.baudrate,
        mqtt_host: cli.mqtt_host.clone(),
        mqtt_port: cli.mqtt_port,
        mqtt_use_tls: cli.mqtt_use_tls,
        network_id: cli.network_id.clone(),
        adapter: cli.adapter.map(Into::into),
        devices,
        verbose: cli.verbose,
        ota_timeout_secs: None,
        ota_max_retries: None,
    })?;
    Ok(settings)
}

fn parse_locations(text: &str) -> anyhow::Result<HashMap<u32, ResetLocation>> {
    let mut locations = HashMap::new();
    for entry in text.split('-') {
        let (addr_part, coords_part) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed location entry: {entry}"))?;
        let address = u32::from_str_radix(addr_part, 16)
            .map_err(|_| anyhow::anyhow!("invalid device address: {addr_part}"))?;
        let (x_part, y_part) = coords_part
            .split_once(',')
            .ok_or_else(|| anyhow::anyhow!("malformed coordinates: {coords_part}"))?;
        let pos_x: i32 = x_part
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("invalid x coordinate: {x_part}"))? as i32;
        let pos_y: i32 = y_part
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("invalid y coordinate: {y_part}"))? as i32;
        locations.insert(address, ResetLocation { pos_x, pos_y });
    }
    Ok(locations)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::init();

    let mut settings = build_settings(&cli)?;

    match cli.command {
        Command::Start => {
            let controller = Controller::new(&settings)?;
            let pending = controller.start(None)?;
            if !pending.is_empty() {
                eprintln!("Devices failed to start: {pending:?}");
            }
            controller.terminate();
            if !pending.is_empty() {
                std::process::exit(1);
            }
        }

        Command::Stop => {
            let controller = Controller::new(&settings)?;
            let pending = controller.stop(None)?;
            if !pending.is_empty() {
                eprintln!("Devices failed to stop: {pending:?}");
            }
            controller.terminate();
            if !pending.is_empty() {
                std::process::exit(1);
            }
        }

        Command::Reset { locations } => {
            let controller = Controller::new(&settings)?;
            let locations = parse_locations(&locations)?;
            let result = controller.reset(&locations, None);
            controller.terminate();
            let pending = result?;
            if !pending.is_empty() {
                eprintln!("Devices failed to reset: {pending:?}");
                std::process::exit(1);
            }
        }

        Command::Flash {
            yes,
            start,
            ota_timeout,
            ota_max_retries,
            firmware,
        } => {
            if let Some(t) = ota_timeout {
                settings.ota_timeout_secs = t;
            }
            if let Some(r) = ota_max_retries {
                settings.ota_max_retries = r;
            }
            let firmware_bytes = std::fs::read(&firmware)
                .map_err(|e| anyhow::anyhow!("failed to read firmware {}: {e}", firmware.display()))?;

            let controller = Controller::new(&settings)?;
            let ready = controller.ready_devices();
            if ready.is_empty() {
                eprintln!("No ready device found. Exiting.");
                controller.terminate();
                std::process::exit(1);
            }

            if !yes {
                eprint!("Flash {} bytes to {} device(s)? [Y/n] ", firmware_bytes.len(), ready.len());
                use std::io::Write;
                std::io::stderr().flush().ok();
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer).ok();
                if answer.trim().eq_ignore_ascii_case("n") {
                    controller.terminate();
                    std::process::exit(1);
                }
            }

            let start_data = controller.start_ota(&firmware_bytes)?;
            if !start_data.missed.is_empty() {
                eprintln!(
                    "Error: {} acknowledgment(s) missing. Aborting.",
                    start_data.missed.len()
                );
                let _ = controller.stop(None);
                controller.terminate();
                std::process::exit(1);
            }

            println!("Image size: {}B", firmware_bytes.len());
            println!("Image hash: {}", hex::encode_upper(start_data.ota.fw_hash));
            println!("Radio chunks (128B): {}", start_data.ota.chunks);

            let results = controller.transfer(&firmware_bytes, &start_data.acked)?;
            let all_succeeded = results.values().all(|r| r.success);
            for (addr, result) in &results {
                println!(
                    "{:08X}: {}",
                    addr,
                    if result.success { "OK" } else { "FAILED" }
                );
            }

            if !all_succeeded {
                controller.terminate();
                eprintln!("Error: Transfer failed.");
                std::process::exit(1);
            }

            if start {
                std::thread::sleep(Duration::from_secs(1));
                let _ = controller.start(None);
            }
            controller.terminate();
        }

        Command::Monitor => {
            let controller = Controller::new(&settings)?;
            controller.monitor(true, None);
            controller.terminate();
        }

        Command::Status { watch } => {
            let controller = Controller::new(&settings)?;
            controller.status(watch, None);
            controller.terminate();
        }

        Command::Message { text } => {
            let controller = Controller::new(&settings)?;
            controller.send_message(&text)?;
            controller.terminate();
        }
    }

    Ok(())
}
