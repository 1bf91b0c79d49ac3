use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facetrack_core::registry::MAX_IMAGE_BYTES;
use facetrack_hw::frame::is_dark_frame;
use facetrack_hw::Camera;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facetrack", about = "facetrack live face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Print the recognition result whenever it changes
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
    /// Claim the unknown face under a point for enrollment
    Claim {
        x: f64,
        y: f64,
        /// Width of the view the point was taken in (defaults to the frame width)
        #[arg(long)]
        display_width: Option<f64>,
    },
    /// Enroll the last claimed face
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        age: Option<u32>,
        #[arg(short, long)]
        gender: Option<String>,
    },
    /// Enroll a face from an image file
    EnrollImage {
        path: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        age: Option<u32>,
        #[arg(short, long)]
        gender: Option<String>,
    },
    /// List enrolled faces
    List,
    /// Remove an enrolled face
    Remove {
        /// Face ID to remove
        id: String,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Frames to grab
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Write the last frame here as JPEG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.facetrack.Tracker1",
    default_service = "org.facetrack.Tracker1",
    default_path = "/org/facetrack/Tracker1"
)]
trait Tracker {
    fn status(&self) -> zbus::Result<String>;
    fn recognition(&self) -> zbus::Result<String>;
    fn overlay(&self) -> zbus::Result<String>;
    fn claim(&self, x: f64, y: f64, display_width: f64) -> zbus::Result<String>;
    fn enroll(&self, name: &str, age: i32, gender: &str) -> zbus::Result<String>;
    fn enroll_image(&self, name: &str, age: i32, gender: &str, image: &[u8])
        -> zbus::Result<String>;
    fn list_faces(&self) -> zbus::Result<String>;
    fn remove_face(&self, id: &str) -> zbus::Result<bool>;
}

async fn connect() -> Result<TrackerProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    TrackerProxy::new(&conn)
        .await
        .context("facetrackd is not reachable; is it running?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// `-1` and `""` tell the daemon a field was left out.
fn wire_age(age: Option<u32>) -> Result<i32> {
    age.map_or(Ok(-1), |a| i32::try_from(a).context("age out of range"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect().await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Watch { interval_ms } => {
            let proxy = connect().await?;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
            let mut last = String::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = proxy.recognition().await?;
                        if current != last {
                            println!("{current}");
                            last = current;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Claim { x, y, display_width } => {
            let proxy = connect().await?;
            let display_width = match display_width {
                Some(w) => w,
                None => {
                    let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
                    status["frame_width"].as_f64().unwrap_or(0.0)
                }
            };
            let raw = proxy.claim(x, y, display_width).await?;
            if raw == "null" {
                println!("No unknown face at ({x}, {y})");
            } else {
                println!("Claimed face:");
                print_json(&raw)?;
                println!("Run `facetrack enroll --name <NAME>` to save it.");
            }
        }
        Commands::Enroll { name, age, gender } => {
            let proxy = connect().await?;
            let id = proxy
                .enroll(&name, wire_age(age)?, gender.as_deref().unwrap_or(""))
                .await?;
            println!("Enrolled {name} as {id}");
        }
        Commands::EnrollImage {
            path,
            name,
            age,
            gender,
        } => {
            let image = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            if image.len() > MAX_IMAGE_BYTES {
                anyhow::bail!("{} is {} bytes; the limit is 5 MiB", path.display(), image.len());
            }
            let proxy = connect().await?;
            let id = proxy
                .enroll_image(&name, wire_age(age)?, gender.as_deref().unwrap_or(""), &image)
                .await?;
            println!("Enrolled {name} from {} as {id}", path.display());
        }
        Commands::List => {
            let proxy = connect().await?;
            let faces: serde_json::Value = serde_json::from_str(&proxy.list_faces().await?)?;
            let faces = faces.as_array().cloned().unwrap_or_default();
            if faces.is_empty() {
                println!("No faces enrolled");
            }
            for face in faces {
                println!(
                    "{}  {}  age {}  {}",
                    face["id"].as_str().unwrap_or("?"),
                    face["name"].as_str().unwrap_or("?"),
                    face["age"].as_u64().map_or("?".to_string(), |a| a.to_string()),
                    face["created_at"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Remove { id } => {
            let proxy = connect().await?;
            if proxy.remove_face(&id).await? {
                println!("Removed {id}");
            } else {
                anyhow::bail!("no face with id {id}");
            }
        }
        Commands::Test {
            device,
            width,
            height,
            frames,
            save,
        } => camera_test(&device, width, height, frames, save)?,
    }

    Ok(())
}

fn camera_test(
    device: &str,
    width: u32,
    height: u32,
    frames: usize,
    save: Option<PathBuf>,
) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    tracing::debug!(count = devices.len(), "enumerated capture devices");
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let camera = Camera::open(device, width, height).with_context(|| format!("opening {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut last = None;
    for i in 0..frames.max(1) {
        let frame = camera.capture_frame()?;
        let dark = is_dark_frame(&frame.data, 0.95);
        println!(
            "  frame {i}: seq {} brightness {:.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if dark { " (dark)" } else { "" }
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (save, last) {
        std::fs::write(&path, frame.encode_jpeg(90)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}
