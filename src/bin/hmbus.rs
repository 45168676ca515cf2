use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use hmbus::arbiter::{Arbiter, ArbiterConfig, ArbiterHandle};
use hmbus::link::{self, Link, LinkTarget, DEFAULT_BAUD_RATE};
use hmbus::protocol::{Command, CommandKind, Outcome, StateDelta};
use hmbus::simulator::SimulatedController;
use hmbus::telemetry::{action_payload, hotwater_payload, mode_payload};
use hmbus::zone::{RunMode, SensorKind, ZoneType};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_PORT: &str = "1024";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct CommandReport {
    address: u8,
    command: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<StateDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CommandReport {
    fn new(kind: CommandKind, outcome: Outcome) -> Self {
        let (ok, result, error) = match outcome {
            Outcome::Decoded(delta) => (true, Some(delta), None),
            Outcome::Failed(err) => (false, None, Some(err.to_string())),
        };
        Self {
            address: kind.address(),
            command: kind.to_string(),
            ok,
            result,
            error,
        }
    }
}

fn address_arg() -> Arg<'static, 'static> {
    Arg::with_name("address")
        .help("Thermostat address on the bus")
        .required(true)
        .validator(|v| match v.parse::<u8>() {
            Ok(a) if a > 0 => Ok(()),
            _ => Err("address must be a number from 1 to 255".into()),
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hmbus")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Heatmiser V3 bus tool: read and set thermostats through a UH1")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device of the UH1")
                .takes_value(true)
                .global(true)
                .conflicts_with_all(&["host", "simulate"]),
        )
        .arg(
            Arg::with_name("baud")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate")
                .takes_value(true)
                .default_value("4800")
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Network address of a serial-to-IP bridge")
                .takes_value(true)
                .global(true)
                .conflicts_with("simulate"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port of the serial-to-IP bridge")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Talk to a built-in simulated thermostat chain")
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("retries")
                .long("retries")
                .value_name("N")
                .help("Retries per command")
                .takes_value(true)
                .default_value("2")
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Response timeout per exchange")
                .takes_value(true)
                .default_value("1000")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log bus activity")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read thermostat state")
                .arg(address_arg().multiple(true))
                .arg(
                    Arg::with_name("sensor")
                        .long("sensor")
                        .takes_value(true)
                        .possible_values(&["air", "floor"])
                        .default_value("air"),
                )
                .arg(Arg::with_name("hotwater").long("hotwater").help("Also read the hot water relay")),
        )
        .subcommand(
            SubCommand::with_name("set-target")
                .about("Set the target temperature")
                .arg(address_arg())
                .arg(Arg::with_name("celsius").help("Whole degrees, 5-35").required(true)),
        )
        .subcommand(
            SubCommand::with_name("set-mode")
                .about("Switch between heating and frost protection")
                .arg(address_arg())
                .arg(
                    Arg::with_name("mode")
                        .required(true)
                        .possible_values(&["heat", "on", "off", "frost"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("hotwater")
                .about("Switch the hot water relay")
                .arg(address_arg())
                .arg(Arg::with_name("state").required(true).possible_values(&["on", "off"])),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Poll thermostats until interrupted")
                .arg(address_arg().multiple(true))
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .value_name("SECS")
                        .takes_value(true)
                        .default_value("10"),
                ),
        )
        .get_matches();

    // Global options are propagated into the subcommand's matches.
    let (name, sub) = matches.subcommand();
    let Some(sub) = sub else {
        return Ok(());
    };

    let format = sub.value_of("format").unwrap_or("table").to_string();
    if sub.is_present("verbose") {
        hmbus::logging::init("debug", None)?;
    }

    let config = ArbiterConfig {
        retry_max: sub.value_of("retries").unwrap_or("2").parse()?,
        exchange_timeout: Duration::from_millis(sub.value_of("timeout").unwrap_or("1000").parse()?),
        ..ArbiterConfig::default()
    };

    let addresses = parse_addresses(sub)?;
    let link = open_link(sub, &addresses).await?;

    let (mut arbiter, handle, _outcomes) = Arbiter::new(config);
    let cancel = CancellationToken::new();
    let runner = {
        let cancel = cancel.clone();
        tokio::spawn(async move { arbiter.run(link, &cancel).await })
    };

    let ok = match name {
        "read" => {
            let sensor = sensor_kind(sub.value_of("sensor"));
            let mut kinds: Vec<CommandKind> = addresses
                .iter()
                .map(|&address| CommandKind::ReadZone { address, sensor })
                .collect();
            if sub.is_present("hotwater") {
                kinds.extend(addresses.iter().map(|&address| CommandKind::ReadHotwater { address }));
            }
            run_commands(&handle, kinds, &format).await
        }
        "set-target" => {
            let target_c: u8 = sub.value_of("celsius").unwrap_or_default().parse()?;
            run_commands(&handle, vec![CommandKind::WriteTarget { address: addresses[0], target_c }], &format).await
        }
        "set-mode" => {
            let frost = matches!(sub.value_of("mode"), Some("off" | "frost"));
            let mode = RunMode::from_frost_flag(frost);
            run_commands(&handle, vec![CommandKind::WriteMode { address: addresses[0], mode }], &format).await
        }
        "hotwater" => {
            let on = sub.value_of("state") == Some("on");
            run_commands(&handle, vec![CommandKind::WriteHotwater { address: addresses[0], on }], &format).await
        }
        "watch" => {
            let interval = Duration::from_secs(sub.value_of("interval").unwrap_or("10").parse()?);
            watch(&handle, &addresses, interval, &format).await;
            true
        }
        _ => true,
    };

    cancel.cancel();
    let _ = runner.await;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_addresses(sub: &ArgMatches<'_>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut addresses = Vec::new();
    for value in sub.values_of("address").into_iter().flatten() {
        addresses.push(value.parse::<u8>()?);
    }
    Ok(addresses)
}

fn sensor_kind(value: Option<&str>) -> SensorKind {
    match value {
        Some("floor") => SensorKind::Floor,
        _ => SensorKind::Air,
    }
}

async fn open_link(matches: &ArgMatches<'_>, addresses: &[u8]) -> Result<Box<dyn Link>, Box<dyn std::error::Error>> {
    if matches.is_present("simulate") {
        let simulator = addresses.iter().fold(SimulatedController::new(), |sim, &address| {
            sim.with_thermostat(address, ZoneType::ProgrammableHotwater)
        });
        return Ok(Box::new(simulator));
    }

    let target = if let Some(device) = matches.value_of("device") {
        let baud_rate = matches
            .value_of("baud")
            .map_or(Ok(DEFAULT_BAUD_RATE), str::parse)?;
        LinkTarget::Serial { device: device.to_string(), baud_rate }
    } else if let Some(host) = matches.value_of("host") {
        let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
        LinkTarget::Tcp { host: host.to_string(), port }
    } else {
        eprintln!("{} give --device, --host or --simulate", "error:".red().bold());
        std::process::exit(2);
    };

    match link::open(&target, CONNECT_TIMEOUT).await {
        Ok(link) => Ok(link),
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err.to_string().bright_white());
            std::process::exit(2);
        }
    }
}

async fn run_commands(handle: &ArbiterHandle, kinds: Vec<CommandKind>, format: &str) -> bool {
    let pending: Vec<_> = kinds
        .into_iter()
        .map(|kind| {
            let command = if kind.is_write() { Command::control(kind) } else { Command::poll(kind) };
            (kind, handle.submit(command))
        })
        .collect();

    let mut reports = Vec::with_capacity(pending.len());
    for (kind, outcome) in pending {
        reports.push(CommandReport::new(kind, outcome.outcome().await));
    }
    let ok = reports.iter().all(|report| report.ok);

    match format {
        "json" => match serde_json::to_string_pretty(&reports) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("{} {err}", "error:".red().bold()),
        },
        _ => {
            print_header();
            for report in &reports {
                print_row(report);
            }
        }
    }
    ok
}

async fn watch(handle: &ArbiterHandle, addresses: &[u8], interval: Duration, format: &str) {
    let mut ticker = tokio::time::interval(interval);
    if format != "json" {
        println!("{}", "Watching thermostats (Ctrl+C to stop)".bright_blue().bold());
        print_header();
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        for &address in addresses {
            let kind = CommandKind::ReadZone { address, sensor: SensorKind::Air };
            let outcome = handle.submit(Command::poll(kind)).outcome().await;
            let report = CommandReport::new(kind, outcome);
            if format == "json" {
                if let Ok(line) = serde_json::to_string(&report) {
                    println!("{line}");
                }
            } else {
                print_row(&report);
            }
        }
    }
}

fn print_header() {
    println!(
        "{}",
        format!("{:>4}  {:<28} {:>8} {:>7} {:<5} {:<8}", "ADDR", "COMMAND", "TEMP", "TARGET", "MODE", "ACTION")
            .bright_white()
            .bold()
    );
}

fn print_row(report: &CommandReport) {
    let address = format!("{:>4}", report.address);
    let command = format!("{:<28}", report.command);
    match (&report.result, &report.error) {
        (Some(StateDelta::Zone(state)), _) => {
            let temp = format!("{:>6.1}°C", state.measured_celsius());
            let target = format!("{:>5}°C", state.target_c);
            let mode = match state.mode {
                RunMode::On => format!("{:<5}", mode_payload(state.mode)).green(),
                RunMode::Frost => format!("{:<5}", mode_payload(state.mode)).cyan(),
            };
            let action = if state.heating {
                format!("{:<8}", action_payload(true)).bright_red()
            } else {
                format!("{:<8}", action_payload(false)).white()
            };
            println!("{address}  {command} {temp} {target} {mode} {action}");
        }
        (Some(StateDelta::Hotwater(on)), _) => {
            let state = if *on { hotwater_payload(true).bright_red() } else { hotwater_payload(false).white() };
            println!("{address}  {command} hot water {state}");
        }
        (Some(_), _) => println!("{address}  {command} {}", "done".bright_green()),
        (None, Some(error)) => println!("{address}  {command} {}", error.bright_red()),
        (None, None) => println!("{address}  {command}"),
    }
}
