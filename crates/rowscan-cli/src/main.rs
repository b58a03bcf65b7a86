use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rowscan_core::codec;
use rowscan_hw::{AlignmentEngine, DeviceRegistry};
use rowscand::{Config, Fleet, ShutdownToken};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rowscan", about = "rowscan operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered devices and their preview ports
    Devices,
    /// Capture every camera once and align them to a reference camera
    Align {
        /// Index of the reference camera, in discovery order
        #[arg(short, long, default_value_t = 0)]
        reference: usize,
    },
    /// Reset every camera's alignment to identity
    ResetAlignment,
    /// Decode a point cloud capture and print a summary
    Inspect {
        /// Path to a camera-<i>.drc file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Command output owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Devices => {
            let registry = DeviceRegistry::new(
                config.backend(),
                config.excluded_devices.clone(),
                config.stream_port_base,
            );
            let devices = registry.discover();
            if devices.is_empty() {
                println!("No devices found");
            }
            for (index, device) in devices.iter().enumerate() {
                println!(
                    "{index}  {:<16} {:<12} port {}",
                    device.info.identity, device.info.model, device.stream_port
                );
            }
        }
        Commands::Align { reference } => {
            let mut fleet = Fleet::discover(&config, config.backend(), &ShutdownToken::new());
            if fleet.cameras().len() < 2 {
                bail!("alignment needs at least two running cameras, found {}", fleet.cameras().len());
            }
            for camera in fleet.cameras_mut() {
                let identity = camera.identity().to_string();
                let points = camera
                    .update()
                    .with_context(|| format!("capture failed for {identity}"))?
                    .len();
                println!("{identity}: {points} points");
            }

            tracing::info!(cameras = fleet.cameras().len(), reference, "aligning");
            let report = AlignmentEngine::default().align(fleet.cameras_mut(), reference)?;
            let mut failed = 0;
            for entry in &report {
                match &entry.outcome {
                    Ok(result) => println!(
                        "{}: fitness {:.3}, rmse {:.4} m, {} iterations",
                        entry.identity, result.fitness, result.inlier_rmse, result.iterations
                    ),
                    Err(err) => {
                        failed += 1;
                        tracing::warn!(identity = %entry.identity, error = %err, "alignment kept previous transform");
                        println!("{}: failed: {err}", entry.identity);
                    }
                }
            }
            fleet.shutdown();
            if failed > 0 {
                bail!("{failed} camera(s) could not be aligned");
            }
        }
        Commands::ResetAlignment => {
            let mut fleet = Fleet::discover(&config, config.backend(), &ShutdownToken::new());
            AlignmentEngine::default().reset(fleet.cameras_mut())?;
            println!("Alignment reset for {} camera(s)", fleet.cameras().len());
        }
        Commands::Inspect { file } => {
            let blob = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let cloud = codec::decode(&blob).with_context(|| format!("decoding {}", file.display()))?;
            println!("{}: {} points ({} bytes)", file.display(), cloud.len(), blob.len());
            if let Some((min, max)) = cloud.bounding_box() {
                println!("  min   [{:.1}, {:.1}, {:.1}] mm", min.x, min.y, min.z);
                println!("  max   [{:.1}, {:.1}, {:.1}] mm", max.x, max.y, max.z);
                let color = cloud.mean_color();
                println!("  color [{:.3}, {:.3}, {:.3}]", color.x, color.y, color.z);
            }
        }
    }

    Ok(())
}
