//! Command-line sender
//!
//! Connects to a controller on a serial port, waits for the firmware to boot
//! and then streams a file, sends single commands or reads the firmware
//! settings. Console messages of the controller go to stdout, logging to
//! stderr.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use cncstream_communication::{Controller, Firmware};
use cncstream_core::{Command, ControllerListener, FirmwareSetting, MessageLevel};
use cncstream_settings::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long the firmware gets to finish its boot handshake
const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a single command sent with `send` may take to be acknowledged
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(name = "cncstream", version, about = "Stream G-code to a CNC controller")]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(long, short, global = true)]
    pub port: Option<String>,

    /// Baud rate, overrides the configuration
    #[arg(long, short, global = true)]
    pub baud: Option<u32>,

    /// Firmware dialect: grbl, grblesp32, tinyg, g2core, marlin, smoothie
    #[arg(long, short, global = true)]
    pub firmware: Option<Firmware>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream a G-code file
    Stream { file: PathBuf },
    /// Send commands one at a time, each argument is one line
    Send {
        #[arg(required = true, num_args = 1..)]
        commands: Vec<String>,
    },
    /// Print the firmware settings, or change one
    Settings {
        key: Option<String>,
        #[arg(requires = "key")]
        value: Option<String>,
    },
}

impl Cli {
    /// Apply the command-line overrides on top of a loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.connection.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.connection.baud_rate = baud;
        }
        if let Some(firmware) = self.firmware {
            config.connection.firmware = firmware;
        }
    }

    /// Load the configuration and apply the overrides
    pub fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = cncstream_settings::load_or_default(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Prints console messages and reports the end of a stream
struct ConsolePrinter {
    stream_done: mpsc::UnboundedSender<bool>,
}

#[async_trait]
impl ControllerListener for ConsolePrinter {
    async fn on_console_message(&self, level: MessageLevel, message: &str) {
        match level {
            MessageLevel::Verbose => tracing::trace!("{}", message.trim_end()),
            MessageLevel::Info => println!("{}", message.trim_end()),
            MessageLevel::Error => eprintln!("{}", message.trim_end()),
        }
    }

    async fn on_command_complete(&self, command: &Command) {
        if let Some(response) = &command.response {
            tracing::debug!("{} -> {}", command.text, response);
        }
    }

    async fn on_stream_complete(&self, success: bool) {
        let _ = self.stream_done.send(success);
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config()?;
    let Some(port) = config.connection.port.clone() else {
        bail!("no serial port given, use --port or set connection.port in the configuration");
    };

    let controller = Controller::serial(config.controller_config())?;
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    controller.register_listener(Arc::new(ConsolePrinter {
        stream_done: done_tx,
    }));

    controller
        .open(&port, config.connection.baud_rate)
        .with_context(|| format!("failed to open {port}"))?;

    let result = match wait_until_ready(&controller).await {
        Ok(()) => execute(&controller, cli.command, done_rx).await,
        Err(e) => Err(e),
    };

    controller.close()?;
    controller.flush_events().await;
    result
}

async fn execute(
    controller: &Controller,
    command: Commands,
    done_rx: mpsc::UnboundedReceiver<bool>,
) -> anyhow::Result<()> {
    match command {
        Commands::Stream { file } => stream_file(controller, file, done_rx).await,
        Commands::Send { commands } => {
            for line in commands {
                controller.send_command_immediately(Command::new(line.as_str()))?;
                wait_until_drained(controller, COMMAND_TIMEOUT)
                    .await
                    .with_context(|| format!("no response to '{line}'"))?;
            }
            Ok(())
        }
        Commands::Settings { key, value } => {
            wait_until_drained(controller, READY_TIMEOUT).await?;
            match (key, value) {
                (Some(key), Some(value)) => {
                    controller.set_setting(&key, &value).await?;
                    println!("{key}={value}");
                }
                (Some(key), None) => match controller.setting(&key) {
                    Some(setting) => println!("{}", format_setting(&setting)),
                    None => bail!("the firmware did not report {key}"),
                },
                _ => {
                    let mut settings = controller.settings();
                    if settings.is_empty() {
                        bail!("the firmware reported no settings");
                    }
                    settings.sort_by_key(|s| setting_order(&s.key));
                    for setting in &settings {
                        println!("{}", format_setting(setting));
                    }
                }
            }
            Ok(())
        }
    }
}

async fn stream_file(
    controller: &Controller,
    file: PathBuf,
    mut done_rx: mpsc::UnboundedReceiver<bool>,
) -> anyhow::Result<()> {
    controller
        .queue_file(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    controller.begin_streaming()?;

    let success = tokio::select! {
        done = done_rx.recv() => done.unwrap_or(false),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling the stream");
            controller.cancel_send()?;
            false
        }
    };

    let rows = controller.rows();
    tracing::info!(
        "Sent {} of {} rows, {} completed, {} skipped",
        rows.sent,
        rows.total,
        rows.completed,
        rows.skipped
    );
    if !success {
        bail!("streaming {} did not complete", file.display());
    }
    Ok(())
}

async fn wait_until_ready(controller: &Controller) -> anyhow::Result<()> {
    wait_for(READY_TIMEOUT, || {
        if !controller.is_open() {
            bail!("connection closed while waiting for the firmware");
        }
        Ok(controller.is_ready())
    })
    .await
    .context("the firmware did not become ready")
}

async fn wait_until_drained(controller: &Controller, timeout: Duration) -> anyhow::Result<()> {
    wait_for(timeout, || {
        if !controller.is_open() {
            bail!("connection closed");
        }
        Ok(controller.active_command_count() == 0 && controller.queued_rows() == 0)
    })
    .await
}

async fn wait_for<F>(timeout: Duration, mut done: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let poll = async {
        loop {
            if done()? {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .with_context(|| format!("timed out after {} ms", timeout.as_millis()))?
}

/// Numeric order for `$n` keys, named keys last
fn setting_order(key: &str) -> (u32, String) {
    key.trim_start_matches('$')
        .parse::<u32>()
        .map(|n| (n, String::new()))
        .unwrap_or_else(|_| (u32::MAX, key.to_string()))
}

fn format_setting(setting: &FirmwareSetting) -> String {
    let mut line = format!("{}={}", setting.key, setting.value);
    if !setting.short_description.is_empty() {
        line.push_str(&format!("  ({}", setting.short_description));
        if !setting.units.is_empty() {
            line.push_str(&format!(", {}", setting.units));
        }
        line.push(')');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream() {
        let cli = Cli::try_parse_from([
            "cncstream",
            "--port",
            "/dev/ttyUSB0",
            "--firmware",
            "tinyg",
            "stream",
            "part.nc",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.firmware, Some(Firmware::TinyG));
        assert!(matches!(cli.command, Commands::Stream { ref file } if file == &PathBuf::from("part.nc")));
    }

    #[test]
    fn test_parse_send_requires_commands() {
        assert!(Cli::try_parse_from(["cncstream", "send"]).is_err());

        let cli = Cli::try_parse_from(["cncstream", "send", "$H", "G0 X10", "--baud", "250000"])
            .unwrap();
        assert_eq!(cli.baud, Some(250000));
        match cli.command {
            Commands::Send { commands } => assert_eq!(commands, vec!["$H", "G0 X10"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_firmware() {
        assert!(Cli::try_parse_from(["cncstream", "--firmware", "mach3", "settings"]).is_err());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "cncstream",
            "-p",
            "COM3",
            "-b",
            "9600",
            "-f",
            "marlin",
            "--json",
            "settings",
        ])
        .unwrap();
        assert!(cli.json);

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.connection.port.as_deref(), Some("COM3"));
        assert_eq!(config.connection.baud_rate, 9600);
        assert_eq!(config.connection.firmware, Firmware::Marlin);
        assert_eq!(config.streaming, Config::default().streaming);
    }

    #[test]
    fn test_resolve_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(
            &path,
            "[connection]\nfirmware = \"Smoothie\"\nport = \"/dev/ttyACM0\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "cncstream",
            "--config",
            path.to_str().unwrap(),
            "--baud",
            "57600",
            "settings",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.connection.firmware, Firmware::Smoothie);
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud_rate, 57600);

        let cli = Cli::try_parse_from([
            "cncstream",
            "--config",
            path.to_str().unwrap(),
            "--baud",
            "0",
            "settings",
        ])
        .unwrap();
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_setting_order() {
        let mut keys = vec!["$110", "$2", "fv", "$13"];
        keys.sort_by_key(|k| setting_order(k));
        assert_eq!(keys, vec!["$2", "$13", "$110", "fv"]);
    }

    #[test]
    fn test_format_setting() {
        let setting = FirmwareSetting {
            key: "$110".to_string(),
            value: "500.000".to_string(),
            units: "mm/min".to_string(),
            description: String::new(),
            short_description: "X max rate".to_string(),
        };
        assert_eq!(format_setting(&setting), "$110=500.000  (X max rate, mm/min)");
    }
}
