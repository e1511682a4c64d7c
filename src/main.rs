use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;

use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nuicam_lib::constants::{PID_AUDIO, PID_CAMERA, PID_MOTOR, VID};
use nuicam_lib::mode::Endpoint;
use nuicam_lib::register::Register;
use nuicam_lib::transport::{IsoBatch, IsoTransfer, IsochronousTransport, NusbControl};
use nuicam_lib::{CamError, CamMode, Camera, CameraConfig};

/// Register access and mode switching for the Kinect NUI camera.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// JSON file with camera config overrides.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected Kinect devices
    List,
    /// Read one register, by name (`depth-type`) or address (`0x06`)
    Read { register: String },
    /// Write one register
    Write { register: String, value: u16 },
    /// Read every known register
    Status {
        /// Print a JSON object instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Program the stream registers of both endpoints, e.g. `--depth depth --video ir`
    /// or `--video visible:bayer:vga:30:flip`
    Mode {
        #[arg(long, default_value = "off")]
        depth: CamMode,
        #[arg(long, default_value = "off")]
        video: CamMode,
    },
    /// Show dimensions, frame size and register writes of a mode, no device needed
    Info { mode: CamMode },
    /// Set the infrared emitter brightness, 1 to 50
    Brightness { value: u16 },
}

/// The command-line tools only touch registers; frames need a host
/// isochronous stack, so streaming is refused.
struct ControlOnly;

impl IsochronousTransport for ControlOnly {
    async fn claim_interface(&self, _interface: u8) -> Result<(), CamError> {
        Ok(())
    }

    async fn release_interface(&self, _interface: u8) -> Result<(), CamError> {
        Ok(())
    }

    async fn set_alt_setting(&self, _interface: u8, _alt_setting: u8) -> Result<(), CamError> {
        Ok(())
    }

    async fn read_isochronous(&self, endpoint: u8, _batch: IsoBatch) -> Result<IsoTransfer, CamError> {
        Err(CamError::Transport(format!(
            "no isochronous transport for endpoint {endpoint:#04x}"
        )))
    }
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv; RUST_LOG still wins
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let config = match &cli.config {
        Some(path) => CameraConfig::from_json_file(path)?,
        None => CameraConfig::default(),
    };

    if let Err(e) = run(cli.command, config).await {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(command: Command, config: CameraConfig) -> Result<()> {
    match command {
        Command::List => return list_devices(),
        Command::Info { mode } => return print_mode(&mode),
        _ => {}
    }

    let camera = Camera::open(ControlOnly, config).await?;
    let result = run_on_camera(&camera, command).await;
    camera.close().await?;
    result
}

async fn run_on_camera(camera: &Camera<NusbControl, ControlOnly>, command: Command) -> Result<()> {
    match command {
        Command::List => list_devices()?,
        Command::Info { mode } => print_mode(&mode)?,
        Command::Read { register } => {
            let register = parse_register(&register)?;
            let value = camera.read_register(register).await?;
            println!("{register} ({:#06x}) = {value} ({value:#06x})", register.address());
        }
        Command::Write { register, value } => {
            let register = parse_register(&register)?;
            camera.write_register(register, value).await?;
            println!("{register} <- {value}");
        }
        Command::Status { json } => {
            let mut values = serde_json::Map::new();
            for register in Register::ALL {
                match camera.read_register(register).await {
                    Ok(value) => {
                        if !json {
                            println!("{:<22} {:#06x}  {value}", register.to_string(), register.address());
                        }
                        values.insert(register.to_string(), value.into());
                    }
                    Err(e) => {
                        warn!(%register, error = %e, "Read failed");
                        values.insert(register.to_string(), serde_json::Value::Null);
                    }
                }
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&values)?);
            }
        }
        Command::Mode { depth, video } => {
            // Validate both before touching the device
            let mut writes = depth.register_writes(Endpoint::Depth)?;
            writes.extend(video.register_writes(Endpoint::Video)?);
            for (register, value) in writes {
                camera.write_register(register, value).await?;
            }
            info!(%depth, %video, "Stream registers programmed");
        }
        Command::Brightness { value } => {
            camera.set_infrared_brightness(value).await?;
            println!("{} <- {value}", Register::InfraredBrightness);
        }
    }
    Ok(())
}

/// Accepts a register name or a decimal / `0x` hex address
fn parse_register(text: &str) -> Result<Register> {
    if let Some(register) = Register::from_name(text) {
        return Ok(register);
    }
    let address = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .map_err(|_| anyhow!("'{text}' is neither a register name nor an address"))?;
    Register::try_from(address).map_err(|_| anyhow!("no known register at {address:#06x}"))
}

fn print_mode(mode: &CamMode) -> Result<()> {
    let Some(endpoint) = mode.endpoint() else {
        println!("off: no stream, frame size 0");
        return Ok(());
    };
    let (width, height) = mode.dimensions().unwrap_or_default();
    println!("{mode}");
    println!("  endpoint:   {endpoint} ({:#04x})", endpoint.address());
    println!("  dimensions: {width}x{height}");
    println!("  frame size: {} bytes", mode.frame_size());
    println!("  register writes:");
    for (register, value) in mode.register_writes(endpoint)? {
        println!("    {register:<20} <- {value}");
    }
    Ok(())
}

fn list_devices() -> Result<()> {
    let mut count = 0;
    for device_info in nusb::list_devices()?.filter(|d| d.vendor_id() == VID) {
        let role = match device_info.product_id() {
            PID_CAMERA => "camera",
            PID_MOTOR => "motor",
            PID_AUDIO => "audio",
            _ => continue,
        };
        count += 1;
        println!(
            "{role:<6} VID: {:#06x}, PID: {:#06x}, Bus: {:03}, Address: {:03}, Serial: {}",
            device_info.vendor_id(),
            device_info.product_id(),
            device_info.bus_number(),
            device_info.device_address(),
            device_info.serial_number().unwrap_or("<none>"),
        );
    }
    if count == 0 {
        warn!("No Kinect devices found.");
    }
    Ok(())
}
