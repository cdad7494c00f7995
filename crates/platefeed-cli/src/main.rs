use std::env;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use platefeed_contracts::console::{parse_intent, CONSOLE_HELP_COMMANDS};
use platefeed_contracts::feed::FeedEntry;
use platefeed_contracts::journal::Journal;
use platefeed_engine::{
    resolve_image_url, ActionTransport, CaptureCoordinator, CaptureOutcome, CaptureSource,
    ChannelState, ClientConfig, ConnectionManager, DryRunActionClient, HttpActionClient,
    PermissionState, StagedImage, SyncSession,
};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "platefeed-rs", version, about = "Platefeed field client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive console: stage, submit, and watch the feed.
    Session(SessionArgs),
    /// Print feed entries as they arrive until the channel closes.
    Watch(WatchArgs),
    /// One-shot image submission.
    SendImage(SendImageArgs),
    /// One-shot car-number submission.
    SendPlate(SendPlateArgs),
}

#[derive(Debug, Parser)]
struct ConnectArgs {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,
    #[arg(long)]
    ws: Option<String>,
    #[arg(long)]
    images: Option<String>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    journal: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[command(flatten)]
    connect: ConnectArgs,
}

#[derive(Debug, Parser)]
struct WatchArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
struct SendImageArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    plate: Option<String>,
}

#[derive(Debug, Parser)]
struct SendPlateArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    plate: String,
}

const CAPTURE_MAX_DIM: u32 = 1600;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("platefeed-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Session(args) => run_session(args)?,
        Command::Watch(args) => run_watch(args)?,
        Command::SendImage(args) => run_send_image(args)?,
        Command::SendPlate(args) => run_send_plate(args)?,
    }
    Ok(0)
}

fn run_session(args: SessionArgs) -> Result<()> {
    let config = build_config(&args.connect);
    let journal = build_journal(&args.connect, &config);
    let transport = build_transport(&args.connect, &config);
    let (mut session, tx) = SyncSession::new(journal.clone());
    let mut connection = ConnectionManager::new(config.clone(), tx.clone());
    let mut coordinator = CaptureCoordinator::new(tx, journal);

    if args.connect.dry_run {
        println!("Dry-run transport active; actions are acknowledged locally.");
    } else if let Err(err) = connection.open() {
        eprintln!("error: {err}");
        println!("Push channel unavailable; /connect to retry.");
    }

    let stdin = io::stdin();
    let mut line = String::new();
    let mut printed = 0usize;

    println!("Platefeed session started. Type /help for commands.");

    loop {
        session.pump();
        printed = print_new_entries(&session, &config, printed);

        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => {
                println!("Commands: {}", CONSOLE_HELP_COMMANDS.join(" "));
            }
            "stage_plate" => match value_as_non_empty_string(intent.command_args.get("plate")) {
                Some(plate) => {
                    coordinator.stage_identifier(&plate);
                    println!("Staged car number {}", coordinator.pending_identifier());
                }
                None => println!("/plate requires text"),
            },
            "stage_image" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/attach requires a path");
                    continue;
                };
                let mut source = FileCaptureSource::new(PathBuf::from(path));
                match coordinator.acquire_image(&mut source) {
                    Ok(true) => {
                        if let Some(image) = coordinator.pending_image() {
                            println!(
                                "Staged image {} ({})",
                                image.path.display(),
                                image.short_fingerprint()
                            );
                        }
                    }
                    Ok(false) => println!("Capture cancelled."),
                    Err(err) => eprintln!("error: {err}"),
                }
            }
            "submit_image" => match coordinator.confirm_image_submit(transport.as_ref()) {
                Ok(ack) => println!(
                    "Image accepted{}",
                    ack.image_path
                        .map(|path| format!(" ({path})"))
                        .unwrap_or_default()
                ),
                Err(err) => eprintln!("error: {err}"),
            },
            "submit_plate" => match coordinator.confirm_identifier_submit(transport.as_ref()) {
                Ok(_) => println!("Car number accepted"),
                Err(err) => eprintln!("error: {err}"),
            },
            "show_feed" => {
                let snapshot = session.store().snapshot();
                if snapshot.is_empty() {
                    println!("Feed is empty.");
                }
                for entry in &snapshot {
                    println!("{}", format_entry_line(entry, &config));
                }
                printed = snapshot.len();
            }
            "show_status" => {
                println!(
                    "channel={} entries={} staged_image={} staged_plate={}",
                    session.state().as_str(),
                    session.store().len(),
                    coordinator
                        .pending_image()
                        .map(|image| image.short_fingerprint())
                        .unwrap_or_else(|| "none".to_string()),
                    if coordinator.pending_identifier().is_empty() {
                        "none"
                    } else {
                        coordinator.pending_identifier()
                    },
                );
            }
            "discard_image" => {
                coordinator.discard_image();
                println!("Staged image discarded.");
            }
            "connect" => match connection.open() {
                Ok(()) => println!("Push channel connected."),
                Err(err) => eprintln!("error: {err}"),
            },
            "disconnect" => {
                connection.close();
                println!("Push channel closed.");
            }
            "quit" => break,
            "unknown" => {
                let command =
                    value_as_non_empty_string(intent.command_args.get("command")).unwrap_or_default();
                println!("Unknown command /{command}; type /help");
            }
            _ => {}
        }
    }

    connection.close();
    session.pump();
    Ok(())
}

fn run_watch(args: WatchArgs) -> Result<()> {
    let config = build_config(&args.connect);
    let journal = build_journal(&args.connect, &config);
    let (mut session, tx) = SyncSession::new(journal);
    let mut connection = ConnectionManager::new(config.clone(), tx);
    connection.open()?;

    let print_config = config.clone();
    session
        .store_mut()
        .subscribe(move |entry| println!("{}", format_entry_line(entry, &print_config)));

    loop {
        session.pump_wait(Duration::from_millis(500));
        if let Some(limit) = args.limit {
            if session.store().len() >= limit {
                break;
            }
        }
        if session.state() == ChannelState::Closed {
            break;
        }
    }

    connection.close();
    session.pump();
    Ok(())
}

fn run_send_image(args: SendImageArgs) -> Result<()> {
    let config = build_config(&args.connect);
    let journal = build_journal(&args.connect, &config);
    let transport = build_transport(&args.connect, &config);
    let (mut session, tx) = SyncSession::new(journal.clone());
    let mut coordinator = CaptureCoordinator::new(tx, journal);

    let mut source = FileCaptureSource::new(args.file.clone());
    if !coordinator.acquire_image(&mut source)? {
        bail!("capture cancelled for {}", args.file.display());
    }
    if let Some(plate) = args.plate.as_deref() {
        coordinator.stage_identifier(plate);
    }

    let ack = coordinator.confirm_image_submit(transport.as_ref())?;
    session.pump();
    println!(
        "Image accepted{}",
        ack.image_path
            .map(|path| format!(" ({path})"))
            .unwrap_or_default()
    );
    Ok(())
}

fn run_send_plate(args: SendPlateArgs) -> Result<()> {
    let config = build_config(&args.connect);
    let journal = build_journal(&args.connect, &config);
    let transport = build_transport(&args.connect, &config);
    let (mut session, tx) = SyncSession::new(journal.clone());
    let mut coordinator = CaptureCoordinator::new(tx, journal);

    coordinator.stage_identifier(&args.plate);
    let submitted = coordinator.pending_identifier().to_string();
    coordinator.confirm_identifier_submit(transport.as_ref())?;
    session.pump();
    println!("Car number {submitted} accepted");
    Ok(())
}

fn build_config(args: &ConnectArgs) -> ClientConfig {
    let device = args
        .device
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut config = ClientConfig::new(&args.server, &device);
    if let Some(ws) = args.ws.as_deref() {
        config = config.with_ws_base(ws);
    }
    if let Some(images) = args.images.as_deref() {
        config = config.with_image_base(images);
    }
    config
}

fn build_journal(args: &ConnectArgs, config: &ClientConfig) -> Journal {
    let path = args
        .journal
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("platefeed-journal.jsonl"));
    Journal::new(path, config.device_id.clone())
}

fn build_transport(args: &ConnectArgs, config: &ClientConfig) -> Box<dyn ActionTransport> {
    if args.dry_run {
        Box::new(DryRunActionClient)
    } else {
        Box::new(HttpActionClient::new(config.clone()))
    }
}

fn print_new_entries(session: &SyncSession, config: &ClientConfig, printed: usize) -> usize {
    let snapshot = session.store().snapshot();
    for entry in snapshot.iter().skip(printed) {
        println!("{}", format_entry_line(entry, config));
    }
    snapshot.len()
}

fn format_entry_line(entry: &FeedEntry, config: &ClientConfig) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(text) = entry.text.as_deref() {
        parts.push(text.to_string());
    }
    if let Some(image_ref) = entry.image_ref.as_deref() {
        parts.push(resolve_image_url(config, image_ref));
    }
    if let Some(plate) = entry.car_identifier.as_deref() {
        parts.push(format!("[{plate}]"));
    }
    format!(
        "#{:04} {} {} {}",
        entry.sequence_key,
        entry.timestamp,
        entry.origin.as_str(),
        parts.join(" ")
    )
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

/// File-backed stand-in for the camera/gallery collaborator: permission is
/// file readability, capture re-encodes to a bounded JPEG.
struct FileCaptureSource {
    path: PathBuf,
}

impl FileCaptureSource {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CaptureSource for FileCaptureSource {
    fn request_permission(&mut self) -> PermissionState {
        if fs::metadata(&self.path).is_ok() {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        }
    }

    fn capture(&mut self) -> CaptureOutcome {
        match prepare_capture_jpeg(&self.path, CAPTURE_MAX_DIM) {
            Some(bytes) => {
                CaptureOutcome::Captured(StagedImage::from_bytes(self.path.with_extension("jpg"), bytes))
            }
            None => CaptureOutcome::Cancelled,
        }
    }
}

/// Flattens alpha, bounds the longest edge, and re-encodes as JPEG. Files
/// the image crate cannot decode pass through as raw bytes.
fn prepare_capture_jpeg(path: &Path, max_dim: u32) -> Option<Vec<u8>> {
    let dim = max_dim.max(128);
    if let Ok(decoded) = image::open(path) {
        let rgba = decoded.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let resized = DynamicImage::ImageRgba8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8();
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder
            .encode_image(&DynamicImage::ImageRgb8(resized))
            .is_ok()
        {
            return Some(bytes);
        }
    }

    fs::read(path).ok().filter(|bytes| !bytes.is_empty())
}

#[cfg(test)]
mod tests {
    use platefeed_contracts::feed::{EntryOrigin, FeedEntry};
    use platefeed_engine::{CaptureOutcome, CaptureSource, ClientConfig, PermissionState};
    use serde_json::json;

    use super::{
        format_entry_line, prepare_capture_jpeg, value_as_non_empty_string, FileCaptureSource,
    };

    #[test]
    fn format_entry_line_resolves_image_and_plate() {
        let config = ClientConfig::new("http://host:8000", "d1");
        let entry = FeedEntry {
            origin: EntryOrigin::Remote,
            text: Some("hello".to_string()),
            image_ref: Some("2024/car.jpg".to_string()),
            car_identifier: Some("CAR12345".to_string()),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            sequence_key: 7,
        };
        assert_eq!(
            format_entry_line(&entry, &config),
            "#0007 2024-01-01T00:00:00Z remote hello http://host:8000/images/2024/car.jpg [CAR12345]"
        );
    }

    #[test]
    fn prepare_capture_jpeg_reencodes_decodable_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("capture.png");
        let mut canvas = image::RgbaImage::new(8, 8);
        for pixel in canvas.pixels_mut() {
            *pixel = image::Rgba([200, 40, 40, 255]);
        }
        image::DynamicImage::ImageRgba8(canvas).save(&path)?;

        let bytes = prepare_capture_jpeg(&path, 1600).unwrap_or_default();
        assert!(bytes.starts_with(&[0xFF, 0xD8]), "expected JPEG magic bytes");
        Ok(())
    }

    #[test]
    fn prepare_capture_jpeg_passes_raw_bytes_through() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("opaque.bin");
        std::fs::write(&path, b"not an image")?;
        assert_eq!(
            prepare_capture_jpeg(&path, 1600),
            Some(b"not an image".to_vec())
        );
        Ok(())
    }

    #[test]
    fn file_capture_source_denies_missing_files() {
        let mut source = FileCaptureSource::new("/tmp/platefeed-does-not-exist.jpg".into());
        assert_eq!(source.request_permission(), PermissionState::Denied);
        assert!(matches!(source.capture(), CaptureOutcome::Cancelled));
    }

    #[test]
    fn non_empty_string_extraction() {
        assert_eq!(
            value_as_non_empty_string(Some(&json!("  CAR1  "))),
            Some("CAR1".to_string())
        );
        assert_eq!(value_as_non_empty_string(Some(&json!("   "))), None);
        assert_eq!(value_as_non_empty_string(Some(&json!(42))), None);
        assert_eq!(value_as_non_empty_string(None), None);
    }
}
