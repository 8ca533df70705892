use anyhow::{Context, Result};
use bioentry_hw::{FaceDetector, FrameSource, ReplaySource};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

// `#[zbus::proxy]` generates `TerminalProxy` with one async method per
// daemon method and a `receive_status_changed` signal stream.
#[zbus::proxy(
    interface = "org.bioentry.Terminal1",
    default_service = "org.bioentry.Terminal1",
    default_path = "/org/bioentry/Terminal1"
)]
trait Terminal {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_pending(&self) -> zbus::Result<String>;
    async fn list_attention(&self) -> zbus::Result<String>;
    async fn requeue(&self, token: &str) -> zbus::Result<bool>;
    async fn sync_now(&self) -> zbus::Result<String>;
    async fn probe_now(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn status_changed(&self, status: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "bioentry", about = "BioEntry access terminal CLI")]
struct Cli {
    /// Bus the daemon is registered on
    #[arg(long, value_enum, default_value_t = Bus::System)]
    bus: Bus,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Bus {
    System,
    Session,
}

#[derive(Subcommand)]
enum Commands {
    /// Show terminal status, connectivity and queue counts
    Status,
    /// List captures waiting for delivery
    Pending,
    /// List captures that need operator attention
    Attention,
    /// Return a parked capture to the delivery queue
    Requeue {
        /// Idempotency token of the capture
        token: String,
    },
    /// Deliver queued captures now
    Sync,
    /// Probe the verification service now
    Probe,
    /// Print status changes as they happen
    Watch,
    /// Check a replay directory without the daemon
    ReplayCheck {
        /// Directory of frames plus annotations.json
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&connect(cli.bus).await?.status().await?)?,
        Commands::Pending => print_records(
            &connect(cli.bus).await?.list_pending().await?,
            "no pending captures",
        )?,
        Commands::Attention => print_records(
            &connect(cli.bus).await?.list_attention().await?,
            "nothing needs attention",
        )?,
        Commands::Requeue { token } => {
            if connect(cli.bus).await?.requeue(&token).await? {
                println!("requeued {token}");
            } else {
                println!("{token} is not waiting for attention");
            }
        }
        Commands::Sync => print_json(&connect(cli.bus).await?.sync_now().await?)?,
        Commands::Probe => println!("{}", connect(cli.bus).await?.probe_now().await?),
        Commands::Watch => {
            let proxy = connect(cli.bus).await?;
            let mut changes = proxy.receive_status_changed().await?;
            println!("watching status changes (ctrl-c to stop)");
            while let Some(signal) = changes.next().await {
                let args = signal.args()?;
                println!("{}", args.status());
            }
        }
        Commands::ReplayCheck { dir } => replay_check(dir).await?,
    }

    Ok(())
}

async fn connect(bus: Bus) -> Result<TerminalProxy<'static>> {
    let conn = match bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    }
    .method_timeout(Duration::from_secs(30))
    .build()
    .await
    .context("failed to connect to D-Bus")?;
    TerminalProxy::new(&conn)
        .await
        .context("bioentryd is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_records(raw: &str, empty: &str) -> Result<()> {
    let records: Vec<serde_json::Value> =
        serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    if records.is_empty() {
        println!("{empty}");
        return Ok(());
    }
    for r in &records {
        println!(
            "{}  captured {}  attempts {}  {}",
            r["token"].as_str().unwrap_or("?"),
            r["captured_at"].as_str().unwrap_or("?"),
            r["attempts"],
            r["last_error"].as_str().unwrap_or(""),
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}

/// Play every frame once through the source and detector and report what the
/// capture loop would see.
async fn replay_check(dir: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut source = ReplaySource::open(&dir, 1000)
            .with_context(|| format!("failed to open {}", dir.display()))?;
        let mut detector = source.detector();
        let info = source.info();
        println!(
            "{} frame(s), {}x{}, {} annotated",
            info.frames, info.width, info.height, info.annotated
        );

        let mut tally = FaceTally::default();
        for _ in 0..info.frames {
            let frame = source.next_frame()?;
            let faces = if frame.is_dark {
                None
            } else {
                Some(detector.detect(&frame)?.len())
            };
            tally.record(faces);
        }
        println!(
            "dark: {}  single face: {}  multiple faces: {}",
            tally.dark, tally.single, tally.multi
        );
        if tally.capturable() == 0 {
            println!("warning: no frame shows a face; the terminal will never capture");
        }
        Ok(())
    })
    .await?
}

/// Per-frame detection counts from a replay check.
#[derive(Debug, Default, PartialEq)]
struct FaceTally {
    dark: usize,
    single: usize,
    multi: usize,
}

impl FaceTally {
    /// `None` for a dark frame, otherwise the number of faces detected.
    fn record(&mut self, faces: Option<usize>) {
        match faces {
            None => self.dark += 1,
            Some(0) => {}
            Some(1) => self.single += 1,
            Some(_) => self.multi += 1,
        }
    }

    /// Frames that can count toward a stable window. With several faces the
    /// largest one is tracked, so those frames count too.
    fn capturable(&self) -> usize {
        self.single + self.multi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_face_frames_are_capturable() {
        let mut tally = FaceTally::default();
        for faces in [None, Some(0), Some(2), Some(3)] {
            tally.record(faces);
        }
        assert_eq!(
            tally,
            FaceTally {
                dark: 1,
                single: 0,
                multi: 2
            }
        );
        assert_eq!(tally.capturable(), 2);
    }

    #[test]
    fn test_no_faces_not_capturable() {
        let mut tally = FaceTally::default();
        tally.record(None);
        tally.record(Some(0));
        assert_eq!(tally.capturable(), 0);
    }
}
