use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Serialize;

use cozylife_control_lib::config::{DeviceConfig, SwitchConfig, DEFAULT_PORT};
use cozylife_control_lib::coordinator::{Rocker, SwitchCoordinator, SwitchEntity};
use cozylife_control_lib::device_link::DeviceLink;
use cozylife_control_lib::util::catalog::Catalog;
use cozylife_control_lib::util::frame::RegisterMap;
use cozylife_control_lib::util::scanner::{DeviceKind, ScannedDevice, Scanner};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "cozylife_control",
    about = "Controls CozyLife switches and lights on the local network",
    version = "0.1.0"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `scan` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text table.
    Plaintext,
    /// JSON configuration.
    Json,
    /// YAML configuration.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the CozyLife device
        #[clap(long)]
        ip: String,

        /// Control port of the device
        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Per-attempt timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 3000)]
        timeout: u64,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Probes an address range and prints the devices found
    #[clap(name = "scan")]
    Scan {
        /// First address of the range
        start: Ipv4Addr,

        /// Last address of the range, defaults to the first one
        end: Option<Ipv4Addr>,

        /// Control port to probe
        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        output: OutputFormat,

        /// Per-address timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 300)]
        timeout: u64,
    },
    /// Keeps the switches of a configuration file refreshed and logs their state
    #[clap(name = "watch")]
    Watch {
        /// YAML file with `switches`, `switches2` and `optimistic`
        #[clap(short, long)]
        config: PathBuf,

        /// Seconds between refreshes
        #[clap(long, default_value_t = 10)]
        interval: u64,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Prints the identity and catalog metadata of the device.
    #[clap(name = "info")]
    Info,
    /// Prints every register.
    #[clap(name = "query")]
    Query,
    /// Writes registers, given as `register=value` pairs.
    #[clap(name = "set")]
    Set {
        #[clap(required = true, value_parser = parse_register)]
        registers: Vec<(String, u64)>,
    },
    /// Turns one rocker on without touching the others.
    #[clap(name = "turn-on")]
    TurnOn {
        /// Rocker number, starting at 1
        #[clap(long, default_value_t = 1)]
        rocker: u8,
    },
    /// Turns one rocker off without touching the others.
    #[clap(name = "turn-off")]
    TurnOff {
        /// Rocker number, starting at 1
        #[clap(long, default_value_t = 1)]
        rocker: u8,
    },
}

fn parse_register(s: &str) -> Result<(String, u64), String> {
    let (register, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected register=value, got {:?}", s))?;
    let register = register.trim();
    if register.parse::<u32>().is_err() {
        return Err(format!("register {:?} is not a number", register));
    }
    let value = value
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("value {:?} is not an unsigned integer", value))?;
    Ok((register.to_string(), value))
}

/// Scan results laid out as light and switch platform configuration.
#[derive(Serialize)]
struct ScanReport {
    light: Vec<LightPlatform>,
    switch: Vec<SwitchPlatform>,
}

#[derive(Serialize)]
struct LightPlatform {
    platform: &'static str,
    lights: Vec<ScannedDevice>,
}

#[derive(Serialize)]
struct SwitchPlatform {
    platform: &'static str,
    switches: Vec<ScannedDevice>,
}

impl ScanReport {
    fn new(devices: Vec<ScannedDevice>) -> Self {
        let (lights, others): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|device| device.kind() == DeviceKind::Light);
        let switches = others
            .into_iter()
            .filter(|device| device.kind() == DeviceKind::Switch)
            .collect();
        ScanReport {
            light: vec![LightPlatform {
                platform: "cozylife",
                lights,
            }],
            switch: vec![SwitchPlatform {
                platform: "cozylife",
                switches,
            }],
        }
    }
}

fn rocker_from_number(number: u8) -> Result<Rocker> {
    let index = number
        .checked_sub(1)
        .ok_or_else(|| anyhow!("Rocker numbers start at 1"))?;
    Rocker::new(index)
}

async fn switch_rocker(config: DeviceConfig, number: u8, on: bool) -> Result<()> {
    let rocker = rocker_from_number(number)?;
    let mut coordinator = SwitchCoordinator::new(false);
    let entities = coordinator.add_device(DeviceLink::new(config), &[rocker]);
    let entity = entities
        .first()
        .ok_or_else(|| anyhow!("No entity bound for {}", rocker))?;
    coordinator.setup().await;

    let acknowledged = if on {
        entity.turn_on().await
    } else {
        entity.turn_off().await
    };
    coordinator.shutdown().await;
    if !acknowledged {
        bail!("Device did not acknowledge turning {} {}", rocker, if on { "on" } else { "off" });
    }
    println!("{} is now {}", entity.name(), if entity.is_on() { "on" } else { "off" });
    Ok(())
}

async fn watch(config: PathBuf, interval: u64) -> Result<()> {
    let text = tokio::fs::read_to_string(&config)
        .await
        .with_context(|| format!("Failed to read {}", config.display()))?;
    let switch_config: SwitchConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse {}", config.display()))?;

    let mut coordinator = SwitchCoordinator::from_config(&switch_config);
    if coordinator.entities().is_empty() {
        bail!("{} does not configure any switch", config.display());
    }
    coordinator.setup().await;

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let answered = coordinator.refresh().await;
                info!("Refreshed {}/{} devices", answered, coordinator.links().len());
                for entity in coordinator.entities() {
                    if entity.available() {
                        info!("{}: {}", entity.name(), if entity.is_on() { "on" } else { "off" });
                    } else {
                        warn!("{}: unavailable", entity.name());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    coordinator.shutdown().await;
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan {
            start,
            end,
            port,
            output,
            timeout,
        } => {
            let scanner = Scanner::new(port, Duration::from_millis(timeout), Catalog::global());
            let devices = scanner.scan(start, end.unwrap_or(start)).await?;
            match output {
                OutputFormat::Plaintext => {
                    Scanner::pretty_print_devices(&devices);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&ScanReport::new(devices))?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&ScanReport::new(devices))?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::DeviceCall {
            ip,
            port,
            timeout,
            action,
        } => {
            let config = DeviceConfig::new(&ip)
                .with_port(port)
                .with_timeout(Duration::from_millis(timeout));

            match action {
                DeviceAction::Info => {
                    let link = DeviceLink::new(config);
                    let info = link.fetch_identity().await;
                    link.disconnect().await;
                    let info = info.ok_or_else(|| anyhow!("No identity received from {}", ip))?;
                    println!("Device info:\n{:#?}", info);
                    println!("Product metadata:\n{:#?}", link.identity().metadata);
                }
                DeviceAction::Query => {
                    let link = DeviceLink::new(config);
                    let registers = link.query().await;
                    link.disconnect().await;
                    let registers = registers.ok_or_else(|| anyhow!("Failed to query {}", ip))?;
                    for (register, value) in registers {
                        println!("{} = {}", register, value);
                    }
                }
                DeviceAction::Set { registers } => {
                    let registers: RegisterMap = registers.into_iter().collect();
                    let link = DeviceLink::new(config);
                    let acknowledged = link.control(&registers).await;
                    link.disconnect().await;
                    if !acknowledged {
                        bail!("Device {} did not acknowledge {:?}", ip, registers);
                    }
                    println!("Registers set: {:?}", registers);
                }
                DeviceAction::TurnOn { rocker } => {
                    switch_rocker(config, rocker, true).await?;
                }
                DeviceAction::TurnOff { rocker } => {
                    switch_rocker(config, rocker, false).await?;
                }
            }
        }
        Commands::Watch { config, interval } => {
            watch(config, interval).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("1=1"), Ok(("1".to_string(), 1)));
        assert_eq!(parse_register(" 3 = 500 "), Ok(("3".to_string(), 500)));
        assert!(parse_register("1").is_err());
        assert!(parse_register("x=1").is_err());
        assert!(parse_register("1=-1").is_err());
    }

    #[test]
    fn test_rocker_numbers_start_at_one() {
        assert_eq!(rocker_from_number(1).unwrap(), Rocker::FIRST);
        assert_eq!(rocker_from_number(2).unwrap(), Rocker::SECOND);
        assert!(rocker_from_number(0).is_err());
        assert!(rocker_from_number(9).is_err());
    }

    #[test]
    fn test_scan_report_layout() {
        let device = |ip: u8, code: &str| ScannedDevice {
            ip: Ipv4Addr::new(192, 168, 1, ip),
            did: Some(format!("device{}", ip)),
            pid: None,
            dmn: None,
            dpid: vec![1],
            device_type_code: Some(code.to_string()),
        };
        let report = ScanReport::new(vec![device(10, "01"), device(11, "00"), device(12, "02")]);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["light"][0]["platform"], "cozylife");
        assert_eq!(value["light"][0]["lights"][0]["ip"], "192.168.1.10");
        assert_eq!(value["switch"][0]["switches"][0]["did"], "device11");
        assert_eq!(value["switch"][0]["switches"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_cli_parses_device_call() {
        let cli = Cli::try_parse_from([
            "cozylife_control",
            "device-call",
            "--ip",
            "192.168.1.20",
            "set",
            "1=1",
            "3=500",
        ])
        .unwrap();
        match cli.command {
            Commands::DeviceCall { ip, port, action, .. } => {
                assert_eq!(ip, "192.168.1.20");
                assert_eq!(port, DEFAULT_PORT);
                match action {
                    DeviceAction::Set { registers } => assert_eq!(registers.len(), 2),
                    _ => panic!("expected set"),
                }
            }
            _ => panic!("expected device-call"),
        }
    }
}
