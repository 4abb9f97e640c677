use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use depthwall_core::{DepthController, SessionConfig};
use depthwall_hw::{profiles, v4l2, DeviceBackend, SimBackend, V4l2Backend};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `DepthwallProxy` (async) and `DepthwallProxyBlocking`.
#[zbus::proxy(
    interface = "org.depthwall.Depthwall1",
    default_service = "org.depthwall.Depthwall1",
    default_path = "/org/depthwall/Depthwall1"
)]
trait Depthwall {
    async fn status(&self) -> zbus::Result<String>;
    async fn set_depth(&self, delta: i32) -> zbus::Result<i32>;
    async fn set_motor_angle(&self, delta: i32) -> zbus::Result<i32>;
    async fn reset_motor_angle(&self) -> zbus::Result<i32>;
    async fn reset(&self) -> zbus::Result<()>;
    async fn snapshot(&self, dir: &str) -> zbus::Result<Vec<String>>;
}

#[derive(Parser)]
#[command(name = "depthwall", about = "depthwall depth camera CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local session and save the final depth/users matrices as PNGs
    Capture {
        /// Use the simulated backend instead of a V4L2 device
        #[arg(long)]
        sim: bool,
        /// V4L2 depth node
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of update cycles to run
        #[arg(short, long, default_value_t = 30)]
        frames: u32,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// Session settings TOML file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the depth threshold
        #[arg(long)]
        threshold: Option<i32>,
    },
    /// List V4L2 capture devices
    Devices,
    /// List bundled device profiles
    Profiles,
    /// Show daemon status
    Status,
    /// Tilt the sensor by a relative amount
    Tilt {
        #[arg(allow_hyphen_values = true)]
        delta: i32,
    },
    /// Return the sensor to its initial tilt
    TiltReset,
    /// Shift the depth threshold by a relative amount
    Depth {
        #[arg(allow_hyphen_values = true)]
        delta: i32,
    },
    /// Reset the daemon's device session
    Reset,
    /// Ask the daemon to write its latest matrices as PNGs
    Snapshot {
        /// Target directory on the daemon's host (default: daemon setting)
        dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture {
            sim,
            device,
            frames,
            out,
            config,
            threshold,
        } => {
            let mut session = match config {
                Some(path) => {
                    let src = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    SessionConfig::from_toml_str(&src)?
                }
                None => SessionConfig::default(),
            };
            if let Some(t) = threshold {
                session.depth_threshold = t;
            }
            if sim {
                capture(SimBackend::new(), session, frames, &out)?;
            } else {
                capture(V4l2Backend::new(device), session, frames, &out)?;
            }
        }
        Commands::Devices => {
            let devices = v4l2::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!(
                    "{}  {}  (driver: {}, bus: {}, profile: {})",
                    d.path,
                    d.name,
                    d.driver,
                    d.bus,
                    d.profile.as_deref().unwrap_or("none")
                );
            }
        }
        Commands::Profiles => {
            for p in profiles::list_profiles() {
                let tilt = p
                    .tilt
                    .map(|t| format!("tilt {}..{}", t.min, t.max))
                    .unwrap_or_else(|| "no tilt".to_string());
                println!(
                    "{:04x}:{:04x}  {}  ({}, {})",
                    p.device.vendor_id, p.device.product_id, p.device.name, p.depth.fourcc, tilt
                );
            }
        }
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Tilt { delta } => {
            let proxy = connect(cli.system).await?;
            println!("Tilt angle: {}", proxy.set_motor_angle(delta).await?);
        }
        Commands::TiltReset => {
            let proxy = connect(cli.system).await?;
            println!("Tilt angle: {}", proxy.reset_motor_angle().await?);
        }
        Commands::Depth { delta } => {
            let proxy = connect(cli.system).await?;
            println!("Depth threshold: {}", proxy.set_depth(delta).await?);
        }
        Commands::Reset => {
            let proxy = connect(cli.system).await?;
            proxy.reset().await?;
            println!("Session reset");
        }
        Commands::Snapshot { dir } => {
            let proxy = connect(cli.system).await?;
            for path in proxy.snapshot(dir.as_deref().unwrap_or("")).await? {
                println!("Wrote {path}");
            }
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<DepthwallProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    DepthwallProxy::new(&conn)
        .await
        .context("depthwalld is not reachable")
}

/// Run `frames` update cycles on a local controller and save both matrices.
fn capture<B: DeviceBackend>(
    backend: B,
    config: SessionConfig,
    frames: u32,
    out: &Path,
) -> Result<()> {
    let mut controller = DepthController::new(backend, config)?;
    println!("Capturing {frames} frames from {}...", controller.backend().name());

    let mut failures = 0u32;
    for _ in 0..frames {
        if let Err(e) = controller.update() {
            if !e.is_recoverable() {
                return Err(e.into());
            }
            failures += 1;
            tracing::warn!(error = %e, "frame skipped");
        }
    }

    std::fs::create_dir_all(out)?;
    let depth_path = out.join("depth.png");
    let users_path = out.join("users.png");
    controller.depth_matrix().save(&depth_path)?;
    controller.users_matrix().save(&users_path)?;

    println!(
        "Done: {} failed cycles, {} resets, threshold {}, tilt {}, users {:?}, {:.0}% valid depth",
        failures,
        controller.resets(),
        controller.depth_threshold(),
        controller.motor_angle(),
        controller.tracked_users(),
        controller.valid_fraction() * 100.0
    );
    println!("Wrote {}", depth_path.display());
    println!("Wrote {}", users_path.display());
    Ok(())
}
