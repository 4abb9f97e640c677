use anyhow::Result;
use depthwall_hw::{SimBackend, SimScene, V4l2Backend};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BackendKind, Config};
use dbus_interface::{DepthwallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("depthwalld starting");

    let config = Config::from_env()?;
    let options = config.engine_options();

    let engine = match config.backend {
        BackendKind::V4l2 => {
            let depth_device = config.depth_device.clone();
            let motor_devices = config.motor_devices.clone();
            engine::spawn_engine(
                move || V4l2Backend::new(depth_device).with_motor_devices(motor_devices),
                config.session.clone(),
                options,
            )?
        }
        BackendKind::Sim => engine::spawn_engine(
            || {
                SimBackend::with_scene(SimScene {
                    paced: true,
                    ..SimScene::default()
                })
            },
            config.session.clone(),
            options,
        )?,
    };

    let service = DepthwallService::new(engine, config.snapshot_dir.clone());
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "depthwalld ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("depthwalld shutting down");

    Ok(())
}
