use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use regex::Regex;
use serde::Serialize;
use sketchforge_build::{BuildOrchestrator, CliBoardProbe, MonitorEvent, UploadOptions};
use sketchforge_core::{load_config, BoardFamily, ResetMethod, ToolConfig};
use sketchforge_device::{DeviceRegistry, HotplugEvent, HotplugMonitor};
use sketchforge_process::ProcessRunner;
use sketchforge_recovery::{PipelineRequest, RecoveryEngine, RecoverySettings};
use sketchforge_report::create_run_report;
use sketchforge_serial::{
    parse_sensor_data, RecordingConfig, RecordingFormat, SerialConfig, SerialEvent,
    SerialSessionManager,
};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "sketchforge")]
#[command(about = "Build, flash and monitor microcontroller sketches")]
#[command(version)]
struct Cli {
    /// JSON config file; SKETCHFORGE_* environment variables override it
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Show debug messages
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long = "json", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports and what is connected to them
    Ports,

    /// Identify the board on one port
    Identify { port: String },

    /// Reset a board
    Reset {
        port: String,
        #[arg(short = 'm', long = "method", default_value = "dtr")]
        method: String,
    },

    /// Put a board into its bootloader
    Bootloader {
        port: String,
        #[arg(short = 'b', long = "fqbn")]
        fqbn: String,
    },

    /// Compile a sketch
    Compile {
        sketch: PathBuf,
        #[arg(short = 'b', long = "fqbn")]
        fqbn: String,
        /// Extra arguments passed through to the build tool
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Upload an already compiled sketch
    Upload {
        sketch: PathBuf,
        #[arg(short = 'b', long = "fqbn")]
        fqbn: String,
        #[arg(short = 'p', long = "port")]
        port: Option<String>,
        #[arg(long = "baud")]
        baud: Option<u32>,
        #[arg(long = "verify")]
        verify: bool,
    },

    /// Compile with automatic fixes, upload with recovery, then monitor
    Flash {
        sketch: PathBuf,
        #[arg(short = 'b', long = "fqbn")]
        fqbn: String,
        #[arg(short = 'p', long = "port")]
        port: Option<String>,
        /// Only compile and fix
        #[arg(long = "no-upload")]
        no_upload: bool,
        /// Stream serial output after a successful upload
        #[arg(long = "monitor")]
        monitor: bool,
        /// Seconds to monitor for; runs until the port closes when omitted
        #[arg(long = "duration")]
        duration: Option<u64>,
        /// Write a run report bundle under this directory
        #[arg(long = "report-dir")]
        report_dir: Option<PathBuf>,
    },

    /// Stream serial output from a port
    Monitor {
        port: String,
        #[arg(long = "baud")]
        baud: Option<u32>,
        /// Only show lines matching one of these patterns
        #[arg(short = 'f', long = "filter")]
        filters: Vec<String>,
        /// Print parsed sensor readings next to each line
        #[arg(long = "sensors")]
        sensors: bool,
        #[arg(long = "duration")]
        duration: Option<u64>,
        /// Record the session to this file
        #[arg(long = "record")]
        record: Option<PathBuf>,
        #[arg(long = "format", value_enum, default_value = "raw")]
        format: FormatArg,
        #[arg(long = "timestamps")]
        timestamps: bool,
        /// Use the build tool's own monitor instead of a direct connection
        #[arg(long = "tool")]
        tool: bool,
        #[arg(short = 'b', long = "fqbn")]
        fqbn: Option<String>,
    },

    /// Send one line to a port, optionally waiting for a reply
    Send {
        port: String,
        data: String,
        #[arg(long = "baud")]
        baud: Option<u32>,
        #[arg(long = "no-newline")]
        no_newline: bool,
        /// Wait for a line matching this pattern
        #[arg(short = 'e', long = "expect")]
        expect: Option<String>,
        #[arg(long = "timeout-ms", default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Report boards as they are plugged in and removed
    Watch {
        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,
        #[arg(long = "duration")]
        duration: Option<u64>,
    },

    /// Write a report bundle describing connected boards
    Report {
        #[arg(long = "base", default_value = ".")]
        base: PathBuf,
    },

    /// Library management
    #[command(subcommand)]
    Lib(LibCommand),

    /// Board listing and search
    #[command(subcommand)]
    Board(BoardCommand),

    /// Platform core management
    #[command(subcommand)]
    Core(CoreCommand),
}

#[derive(Subcommand)]
enum LibCommand {
    Search { query: String },
    Install { name: String },
    Uninstall { name: String },
    List,
}

#[derive(Subcommand)]
enum BoardCommand {
    List,
    Search { query: String },
}

#[derive(Subcommand)]
enum CoreCommand {
    Install { core: String },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Raw,
    Csv,
    Json,
}

impl From<FormatArg> for RecordingFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Raw => RecordingFormat::Raw,
            FormatArg::Csv => RecordingFormat::Csv,
            FormatArg::Json => RecordingFormat::Json,
        }
    }
}

struct App {
    config: ToolConfig,
    orchestrator: Arc<BuildOrchestrator>,
    json: bool,
}

impl App {
    fn new(config: ToolConfig, json: bool) -> Self {
        let runner = Arc::new(ProcessRunner::new());
        let orchestrator = Arc::new(BuildOrchestrator::new(runner, config.clone()));
        Self {
            config,
            orchestrator,
            json,
        }
    }

    fn registry(&self) -> Result<DeviceRegistry> {
        let mut registry = DeviceRegistry::new(&self.config)?;
        registry.set_tool_probe(Box::new(CliBoardProbe::new(self.orchestrator.clone())));
        Ok(registry)
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("SKETCHFORGE_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string())),
    )
    .format_timestamp(None)
    .format_target(false)
    .init();

    if let Err(err) = run(cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    debug!("build tool: {}", config.cli_path);
    let app = App::new(config, cli.json);

    match cli.command {
        Commands::Ports => {
            let registry = app.registry()?;
            let ports = registry.list_ports()?;
            let identified: Vec<_> = ports
                .iter()
                .map(|port| (port.clone(), registry.identify(port)))
                .collect();
            app.emit(&identified, || {
                identified
                    .iter()
                    .map(|(port, device)| match device {
                        Some(device) => format!(
                            "{}  {} ({}) [{:?} {:.1}]",
                            port.path, device.board_name, device.fqbn, device.method, device.confidence
                        ),
                        None => format!("{}  unidentified", port.path),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Identify { port } => {
            let registry = app.registry()?;
            let device = registry
                .identify_path(&port)?
                .ok_or_else(|| anyhow!("no board identified on {}", port))?;
            app.emit(&device, || {
                format!(
                    "{}: {} ({}) via {:?}, confidence {:.1}",
                    port, device.board_name, device.fqbn, device.method, device.confidence
                )
            })
        }
        Commands::Reset { port, method } => {
            let method = ResetMethod::parse(&method)
                .ok_or_else(|| anyhow!("unknown reset method '{}' (dtr, 1200, auto)", method))?;
            let result = app.registry()?.reset(&port, method);
            app.emit(&result, || format!("{:?}: {}", result.method, result.message))?;
            if !result.success {
                return Err(anyhow!("reset of {} failed", port));
            }
            Ok(())
        }
        Commands::Bootloader { port, fqbn } => {
            let outcome = app
                .registry()?
                .bootloader_mode(&port, BoardFamily::from_fqbn(&fqbn));
            app.emit(&outcome, || {
                let mut lines = vec![outcome.message.clone()];
                if let Some(boot_port) = &outcome.port {
                    lines.push(format!("bootloader port: {}", boot_port));
                }
                lines.extend(outcome.manual_steps.iter().map(|step| format!("  - {}", step)));
                lines.join("\n")
            })
        }
        Commands::Compile { sketch, fqbn, extra } => {
            let outcome = app.orchestrator.compile(&sketch, &fqbn, &extra)?;
            app.emit(&outcome, || {
                let mut lines: Vec<String> = outcome
                    .report
                    .diagnostics
                    .iter()
                    .map(|d| format!("{}:{}:{}: [{}] {}", d.file, d.line, d.column, d.code.as_str(), d.message))
                    .collect();
                if let Some(memory) = &outcome.report.memory {
                    lines.push(format!(
                        "flash {} bytes ({}%), ram {} bytes ({}%)",
                        memory.flash_bytes, memory.flash_pct, memory.sram_bytes, memory.sram_pct
                    ));
                }
                match &outcome.binary {
                    Some(binary) => lines.push(format!("binary: {}", binary.display())),
                    None if outcome.success => lines.push("compiled".to_string()),
                    None => lines.push("compile failed".to_string()),
                }
                lines.join("\n")
            })?;
            if !outcome.success {
                return Err(anyhow!("compile failed"));
            }
            Ok(())
        }
        Commands::Upload {
            sketch,
            fqbn,
            port,
            baud,
            verify,
        } => {
            let registry = app.registry()?;
            let port = match port {
                Some(port) => port,
                None => registry.resolve_port(Some(&fqbn))?.port.path,
            };
            let safety = registry.safe_guard(&port, &fqbn);
            for warning in &safety.warnings {
                log::warn!("{}", warning);
            }
            if !safety.is_safe() {
                return Err(anyhow!(safety.errors.join("; ")));
            }
            let options = UploadOptions {
                baud,
                verify,
                ..UploadOptions::default()
            };
            let result = app.orchestrator.upload(&sketch, &fqbn, &port, &options)?;
            app.emit(&result, || {
                if result.success() {
                    format!("uploaded to {}", port)
                } else {
                    result.error_text().unwrap_or_else(|| "upload failed".to_string())
                }
            })?;
            if !result.success() {
                return Err(anyhow!("upload to {} failed", port));
            }
            Ok(())
        }
        Commands::Flash {
            sketch,
            fqbn,
            port,
            no_upload,
            monitor,
            duration,
            report_dir,
        } => {
            let registry = app.registry()?;
            let engine = RecoveryEngine::new(
                app.orchestrator.as_ref(),
                &registry,
                RecoverySettings::from(&app.config),
            );
            let report = engine.run(&PipelineRequest {
                sketch,
                fqbn,
                port,
                extra_args: Vec::new(),
                upload: !no_upload,
                monitor,
                report_dir,
            });
            app.emit(&report, || report.logs.join("\n"))?;
            if let Some(paths) = &report.report {
                info!("report: {}", paths.root.display());
            }
            if !report.success {
                let reason = report
                    .failure()
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "pipeline failed".to_string());
                return Err(anyhow!(reason));
            }
            match (&report.port, monitor) {
                (Some(port), true) => stream_serial(
                    &app,
                    port,
                    app.config.default_baud,
                    &[],
                    true,
                    duration,
                    None,
                ),
                _ => Ok(()),
            }
        }
        Commands::Monitor {
            port,
            baud,
            filters,
            sensors,
            duration,
            record,
            format,
            timestamps,
            tool,
            fqbn,
        } => {
            let baud = baud.unwrap_or(app.config.default_baud);
            if tool {
                return tool_monitor(&app, &port, baud, fqbn.as_deref(), duration);
            }
            let recording = record.map(|output_file| RecordingConfig {
                format: format.into(),
                include_timestamp: timestamps,
                output_file,
            });
            stream_serial(&app, &port, baud, &filters, sensors, duration, recording)
        }
        Commands::Send {
            port,
            data,
            baud,
            no_newline,
            expect,
            timeout_ms,
        } => {
            let manager = SerialSessionManager::new(&app.config);
            manager.open(&port, SerialConfig::with_baud(baud.unwrap_or(app.config.default_baud)))?;
            let written = manager.write(&port, &data, !no_newline)?;
            info!("wrote {} byte(s) to {}", written, port);
            if let Some(pattern) = expect {
                let pattern = Regex::new(&pattern).with_context(|| format!("bad pattern '{}'", pattern))?;
                let outcome = manager.expect(&port, &pattern, Duration::from_millis(timeout_ms))?;
                app.emit(&outcome, || match &outcome.capture {
                    Some(capture) => capture.clone(),
                    None => format!("no match within {}ms", timeout_ms),
                })?;
                if !outcome.matched {
                    manager.close(&port);
                    return Err(anyhow!("'{}' not seen on {}", pattern, port));
                }
            }
            manager.close(&port);
            Ok(())
        }
        Commands::Watch {
            interval_ms,
            duration,
        } => {
            let registry = Arc::new(app.registry()?);
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| app.config.hotplug_interval());
            let (tx, rx) = mpsc::channel();
            let monitor = HotplugMonitor::start(registry, interval, tx);
            let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            loop {
                let wait = match deadline {
                    Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                        Some(left) => left,
                        None => break,
                    },
                    None => Duration::from_secs(3600),
                };
                match rx.recv_timeout(wait) {
                    Ok(event) => app.emit(&event, || match &event {
                        HotplugEvent::Added { port, device } => format!(
                            "+ {} {}",
                            port.path,
                            device
                                .as_ref()
                                .map(|d| format!("{} ({})", d.board_name, d.fqbn))
                                .unwrap_or_else(|| "unidentified".to_string())
                        ),
                        HotplugEvent::Removed { port } => format!("- {}", port.path),
                    })?,
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            monitor.stop();
            Ok(())
        }
        Commands::Report { base } => {
            let registry = app.registry()?;
            let devices: Vec<_> = registry
                .list_ports()?
                .iter()
                .filter_map(|port| registry.identify(port))
                .collect();
            let paths = create_run_report(base, &devices, None, &[])?;
            app.emit(&paths, || {
                format!(
                    "report_root: {}\ndevices: {}\nrun_json: {}\nlogs: {}",
                    paths.root.display(),
                    paths.devices_json.display(),
                    paths.run_json.display(),
                    paths.logs_path.display()
                )
            })
        }
        Commands::Lib(command) => {
            let result = match command {
                LibCommand::Search { query } => app.orchestrator.lib_search(&query)?,
                LibCommand::Install { name } => app.orchestrator.lib_install(&name)?,
                LibCommand::Uninstall { name } => app.orchestrator.lib_uninstall(&name)?,
                LibCommand::List => {
                    let libraries = app.orchestrator.lib_list()?;
                    return app.emit(&libraries, || {
                        libraries
                            .iter()
                            .map(|lib| format!("{} {}", lib.name, lib.version))
                            .collect::<Vec<_>>()
                            .join("\n")
                    });
                }
            };
            passthrough_output(&app, &result)
        }
        Commands::Board(command) => match command {
            BoardCommand::List => {
                let boards = app.orchestrator.board_list()?;
                app.emit(&boards, || {
                    boards
                        .iter()
                        .map(|board| {
                            let names: Vec<String> = board
                                .boards
                                .iter()
                                .map(|b| format!("{} ({})", b.name, b.fqbn))
                                .collect();
                            format!("{}  {}", board.port, names.join(", "))
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            BoardCommand::Search { query } => {
                let result = app.orchestrator.board_search(&query)?;
                passthrough_output(&app, &result)
            }
        },
        Commands::Core(command) => {
            let result = match command {
                CoreCommand::Install { core } => app.orchestrator.core_install(&core)?,
                CoreCommand::List => app.orchestrator.core_list()?,
            };
            passthrough_output(&app, &result)
        }
    }
}

fn passthrough_output(app: &App, result: &sketchforge_core::CommandResult) -> Result<()> {
    app.emit(result, || result.combined_output().trim_end().to_string())?;
    if !result.success() {
        return Err(anyhow!("{} exited with {:?}", result.command, result.exit_code));
    }
    Ok(())
}

fn stream_serial(
    app: &App,
    port: &str,
    baud: u32,
    filters: &[String],
    sensors: bool,
    duration: Option<u64>,
    recording: Option<RecordingConfig>,
) -> Result<()> {
    let manager = SerialSessionManager::new(&app.config);
    manager.open(port, SerialConfig::with_baud(baud))?;
    if !filters.is_empty() {
        manager.set_filters(port, filters)?;
    }
    if let Some(config) = recording {
        manager.start_recording(port, config)?;
    }
    let events = manager.subscribe(port)?;
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(3600),
        };
        match events.recv_timeout(wait) {
            Ok(SerialEvent::Data { line, .. }) => {
                let reading = parse_sensor_data(&line);
                if app.json {
                    let value = if sensors && !reading.is_empty() {
                        serde_json::json!({ "line": line, "sensors": reading })
                    } else {
                        serde_json::json!({ "line": line })
                    };
                    println!("{}", value);
                } else if sensors && !reading.is_empty() {
                    println!("{}  {}", line, serde_json::to_string(&reading)?);
                } else {
                    println!("{}", line);
                }
            }
            Ok(SerialEvent::Disconnected { reason, .. }) => log::warn!("{} disconnected: {}", port, reason),
            Ok(SerialEvent::Reconnected { attempt, .. }) => info!("{} reconnected (attempt {})", port, attempt),
            Ok(SerialEvent::Closed { .. }) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Ok(summary) = manager.stop_recording(port) {
        info!(
            "recorded {} entries to {}",
            summary.entries,
            summary.output_file.display()
        );
    }
    manager.close(port);
    Ok(())
}

fn tool_monitor(app: &App, port: &str, baud: u32, fqbn: Option<&str>, duration: Option<u64>) -> Result<()> {
    let mut stream = app.orchestrator.monitor(port, baud, fqbn)?;
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            stream.stop();
            return Ok(());
        }
        match stream.next_event(Duration::from_millis(250)) {
            Some(MonitorEvent::Line(line)) => println!("{}", line),
            Some(MonitorEvent::Ended(code)) => {
                debug!("monitor exited with {:?}", code);
                return Ok(());
            }
            None => continue,
        }
    }
}
