// Evidence Cam CLI binary

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};

use evidence_cam_lib::capture::ffmpeg::InputSpec;
use evidence_cam_lib::capture::{Collaborators, FfmpegCapture, Location};
use evidence_cam_lib::constants::{self, DEFAULT_LOG_FILTER};
use evidence_cam_lib::db::schema::UploadDestination;
use evidence_cam_lib::db::{get_db_path, get_recordings_dir, init_data_folders, resolve_data_dir, Database};
use evidence_cam_lib::quota::{self, QuotaEnforcer, StatvfsProbe};
use evidence_cam_lib::settings::{clamp_storage_percent, VideoQuality};
use evidence_cam_lib::tools::Tool;
use evidence_cam_lib::upload::{AssumeOnline, FolderConnector, UploadPipeline};
use evidence_cam_lib::{Event, EventBus, EvidenceCam, EvidenceCamConfig, Ledger, RecordingState, SettingsStore};

#[derive(Parser)]
#[command(name = "evidencecam")]
#[command(about = "Evidence Cam - continuous segmented recording with background upload", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (defaults to $EVIDENCECAM_HOME or ~/.evidencecam)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "evidence_cam_lib=trace"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and database
    Init,

    /// Record segments until Enter is pressed (or for a fixed time)
    Record {
        /// Stop after this many seconds
        #[arg(long = "for")]
        for_secs: Option<u64>,
        /// ffmpeg input format for video
        #[arg(long, default_value = "v4l2")]
        video_format: String,
        /// Video device
        #[arg(long, default_value = "/dev/video0")]
        video_device: String,
        /// ffmpeg input format for audio
        #[arg(long, default_value = "pulse")]
        audio_format: String,
        /// Audio device
        #[arg(long, default_value = "default")]
        audio_device: String,
        /// Latitude for the overlay
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Longitude for the overlay
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },

    /// List recorded segments, newest first
    List {
        /// Maximum segments to show
        #[arg(long, default_value = "100")]
        limit: i64,
    },

    /// Show segment details
    Show {
        /// Segment ID
        id: String,
    },

    /// Delete a segment and its file
    Delete {
        /// Segment ID
        id: String,
    },

    /// Run one upload pass now
    Upload,

    /// Enforce the storage quota
    Cleanup {
        /// Also delete recording files the ledger does not know about
        #[arg(long)]
        purge_orphans: bool,
    },

    /// Storage and upload status
    Status,

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings
    Show,
    /// Set one value
    Set {
        /// destination | quality | segment-duration | max-storage | wifi-only | audio | auto-delete | remote-folder
        key: String,
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());

    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(&data_dir),
        Commands::Record { for_secs, video_format, video_device, audio_format, audio_device, lat, lon } => {
            let video = InputSpec::new(video_format, video_device);
            let audio = InputSpec::new(audio_format, audio_device);
            let location = lat.zip(lon).map(|(lat, lon)| Location::new(lat, lon));
            cmd_record(&data_dir, for_secs, video, audio, location)
        }
        Commands::List { limit } => cmd_list(&data_dir, limit),
        Commands::Show { id } => cmd_show(&data_dir, &id),
        Commands::Delete { id } => cmd_delete(&data_dir, &id),
        Commands::Upload => cmd_upload(&data_dir),
        Commands::Cleanup { purge_orphans } => cmd_cleanup(&data_dir, purge_orphans),
        Commands::Status => cmd_status(&data_dir),
        Commands::Settings { action } => match action {
            SettingsAction::Show => cmd_settings_show(&data_dir),
            SettingsAction::Set { key, value } => cmd_settings_set(&data_dir, &key, &value),
        },
    }
}

fn init_logging(filter: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}

fn cmd_init(data_dir: &Path) -> Result<()> {
    let db_path = get_db_path(data_dir);
    if db_path.exists() {
        anyhow::bail!("Already initialized at {}", data_dir.display());
    }

    init_data_folders(data_dir)?;
    Database::open(&db_path)?;

    println!("Initialized Evidence Cam at {}", data_dir.display());
    println!("Structure created:");
    println!("  {}   - Database", constants::DB_FILENAME);
    println!("  {}/       - Segment files", constants::RECORDINGS_FOLDER);
    println!();
    for tool in [Tool::Ffmpeg, Tool::Ffprobe] {
        let version = tool.version().unwrap_or_else(|| "not found".to_string());
        println!("{:<8} {}", format!("{}:", tool.name()), version);
    }

    Ok(())
}

fn cmd_record(
    data_dir: &Path,
    for_secs: Option<u64>,
    video: InputSpec,
    audio: InputSpec,
    location: Option<Location>,
) -> Result<()> {
    if !Tool::Ffmpeg.is_available() {
        anyhow::bail!("ffmpeg not found. Set EVIDENCECAM_FFMPEG_PATH or install ffmpeg.");
    }

    let collaborators = Collaborators::ffmpeg(FfmpegCapture::new(video, Some(audio)), location);
    let app = EvidenceCam::build(EvidenceCamConfig::new(data_dir.to_path_buf(), collaborators))?;

    let events = app.subscribe_events();
    std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || {
            for event in events {
                print_event(&event);
            }
        })?;

    app.request_start()?;

    match for_secs {
        Some(secs) => {
            println!("Recording for {}s...", secs);
            std::thread::sleep(Duration::from_secs(secs));
        }
        None => {
            println!("Recording. Press Enter to stop.");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
        }
    }

    app.request_stop()?;
    let states = app.subscribe_state()?;
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        match app.state()? {
            RecordingState::Idle => break,
            RecordingState::Error { message } => {
                eprintln!("Recorder error: {}", message);
                break;
            }
            _ if Instant::now() >= deadline => {
                eprintln!("Timed out waiting for the recorder to stop");
                break;
            }
            _ => {
                let _ = states.recv_timeout(Duration::from_millis(200));
            }
        }
    }

    if !app.wait_uploads_idle(Duration::from_secs(30)) {
        println!("Uploads still running; they will resume on next start.");
    }
    app.shutdown();

    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::SegmentStarted { index } => println!("  segment {} started", index),
        Event::SegmentCompleted { id, destination } => println!("  segment saved: {} [{}]", id, destination),
        Event::UploadCompleted { id, url } => println!("  uploaded {} -> {}", id, url),
        Event::UploadAttention { file_name, reason, .. } => println!("  upload problem: {}: {}", file_name, reason),
        Event::StorageCleaned { deleted } => println!("  quota: deleted {} old segment(s)", deleted),
        Event::RecordingError { message } => println!("  error: {}", message),
        Event::RecordingStarted | Event::RecordingStopped => {}
    }
}

fn cmd_list(data_dir: &Path, limit: i64) -> Result<()> {
    let ledger = Ledger::new(open_database(data_dir)?);
    let segments = ledger.list_newest_first(Some(limit))?;
    let total = ledger.count()?;

    println!("{} segments total", total);
    println!();

    if segments.is_empty() {
        println!("No segments found. Use 'evidencecam record' to start recording.");
        return Ok(());
    }

    println!("{:>36}  {:>10}  {:>10}  {:>10}  {}", "ID", "Duration", "Size", "Status", "Recorded");
    println!("{}", "-".repeat(95));

    for seg in segments {
        let recorded = seg.recorded_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S");
        println!("{:>36}  {:>10}  {:>10}  {:>10}  {}",
            seg.id,
            format_duration(seg.duration_ms),
            format_size(seg.file_size_bytes),
            seg.upload_status,
            recorded
        );
    }

    if total > limit {
        println!();
        println!("Showing {} of {} segments. Use --limit to see more.", limit, total);
    }

    Ok(())
}

fn cmd_show(data_dir: &Path, id: &str) -> Result<()> {
    let ledger = Ledger::new(open_database(data_dir)?);
    let seg = ledger.get(id)?
        .ok_or_else(|| anyhow::anyhow!("Segment {} not found", id))?;

    println!("Segment {}", seg.id);
    println!();
    println!("File:        {}", seg.file_name);
    println!("Path:        {}", seg.file_path);
    println!("Size:        {}", format_size(seg.file_size_bytes));
    println!("Duration:    {}", format_duration(seg.duration_ms));
    println!("Recorded:    {}", seg.recorded_at.to_rfc3339());
    println!("Destination: {}", seg.upload_destination);
    println!("Status:      {}", seg.upload_status);

    if seg.retry_count > 0 {
        println!("Retries:     {}", seg.retry_count);
    }
    if let Some(ref url) = seg.remote_url {
        println!("Remote:      {}", url);
    }
    if let Some(ref uploaded) = seg.uploaded_at {
        println!("Uploaded:    {}", uploaded.to_rfc3339());
    }
    if let Some(ref err) = seg.last_error {
        println!("Last error:  {}", err);
    }
    if !Path::new(&seg.file_path).exists() {
        println!();
        println!("Warning: local file is missing");
    }

    Ok(())
}

fn cmd_delete(data_dir: &Path, id: &str) -> Result<()> {
    let ledger = Ledger::new(open_database(data_dir)?);
    let seg = ledger.get(id)?
        .ok_or_else(|| anyhow::anyhow!("Segment {} not found", id))?;

    ledger.delete_segment(&seg)?;
    println!("Deleted {} ({})", seg.file_name, format_size(seg.file_size_bytes));

    Ok(())
}

fn cmd_upload(data_dir: &Path) -> Result<()> {
    let database = open_database(data_dir)?;
    let events = EventBus::new();
    let rx = events.subscribe();

    let pipeline = UploadPipeline::new(
        Ledger::new(Arc::clone(&database)),
        Arc::new(SettingsStore::new(database)),
        Arc::new(FolderConnector),
        Arc::new(AssumeOnline),
        events,
    );
    let report = pipeline.run_pass()?;

    for event in rx.try_iter() {
        print_event(&event);
    }

    println!();
    println!("Upload pass: {:?}", report.outcome);
    println!("  Batch:     {}", report.batch_size);
    println!("  Uploaded:  {}", report.uploaded);
    println!("  Retrying:  {}", report.retried);
    println!("  Failed:    {}", report.failed);
    println!("  Skipped:   {}", report.skipped);
    if report.quota_hit {
        println!("  Remote storage is full");
    }

    Ok(())
}

fn cmd_cleanup(data_dir: &Path, purge_orphans: bool) -> Result<()> {
    let database = open_database(data_dir)?;
    let ledger = Ledger::new(Arc::clone(&database));
    let settings = SettingsStore::new(database).load()?.settings;
    let recordings_dir = get_recordings_dir(data_dir);

    let enforcer = QuotaEnforcer::new(ledger.clone(), Arc::new(StatvfsProbe::new(recordings_dir.clone())));
    let evicted = enforcer.enforce(settings.max_storage_percent)?;
    println!("Quota ({}%): deleted {} segment(s)", settings.max_storage_percent, evicted);

    if purge_orphans {
        let removed = quota::purge_orphans(&recordings_dir, &ledger, None)?;
        println!("Orphans: deleted {} file(s)", removed);
    } else {
        let orphans = quota::scan_orphans(&recordings_dir, &ledger, None)?;
        if !orphans.is_empty() {
            println!("Found {} orphaned file(s). Use --purge-orphans to delete them.", orphans.len());
        }
    }

    Ok(())
}

fn cmd_status(data_dir: &Path) -> Result<()> {
    let database = open_database(data_dir)?;
    let ledger = Ledger::new(Arc::clone(&database));
    let snapshot = SettingsStore::new(database).load()?;
    let enforcer = QuotaEnforcer::new(ledger.clone(), Arc::new(StatvfsProbe::new(get_recordings_dir(data_dir))));
    let info = enforcer.storage_info()?;

    println!("Data dir:    {}", data_dir.display());
    println!();
    println!("Storage:");
    println!("  Total:       {}", format_size(info.total_bytes as i64));
    println!("  Used:        {} ({:.1}%)", format_size(info.used_bytes as i64), info.used_percent());
    println!("  Available:   {}", format_size(info.available_bytes as i64));
    println!("  Recordings:  {} ({})", info.recordings_count, format_size(info.recordings_size));
    println!("  Limit:       {}%", snapshot.settings.max_storage_percent);
    if info.is_near_full() {
        println!("  Storage is nearly full");
    }

    let counts = ledger.count_by_status()?;
    if !counts.is_empty() {
        println!();
        println!("Uploads ({}):", snapshot.settings.upload_destination);
        for (status, count) in counts {
            println!("  {:<10} {}", status, count);
        }
    }

    Ok(())
}

fn cmd_settings_show(data_dir: &Path) -> Result<()> {
    let snapshot = SettingsStore::new(open_database(data_dir)?).load()?;
    let s = snapshot.settings;

    println!("Settings (version {})", snapshot.version);
    println!();
    println!("  destination       {}", s.upload_destination);
    println!("  quality           {}", s.video_quality.display_name());
    println!("  segment-duration  {}", format_duration(s.segment_duration_ms as i64));
    println!("  max-storage       {}%", s.max_storage_percent);
    println!("  wifi-only         {}", s.upload_on_wifi_only);
    println!("  audio             {}", s.enable_audio);
    println!("  auto-delete       {}", s.auto_delete_after_upload);
    println!(
        "  remote-folder     {}",
        s.remote_folder.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string())
    );

    Ok(())
}

fn cmd_settings_set(data_dir: &Path, key: &str, value: &str) -> Result<()> {
    let store = SettingsStore::new(open_database(data_dir)?);
    let mut settings = store.load()?.settings;

    match key {
        "destination" => {
            settings.upload_destination = value.parse::<UploadDestination>()?;
        }
        "quality" => {
            settings.video_quality = match value.to_lowercase().as_str() {
                "sd" => VideoQuality::Sd,
                "hd" => VideoQuality::Hd,
                "fhd" => VideoQuality::Fhd,
                other => anyhow::bail!("Unknown quality '{}' (expected sd, hd or fhd)", other),
            };
        }
        "segment-duration" => {
            let secs: u64 = value.parse()
                .map_err(|_| anyhow::anyhow!("segment-duration takes seconds, got '{}'", value))?;
            settings.segment_duration_ms = secs * 1000;
        }
        "max-storage" => {
            let percent: u8 = value.trim_end_matches('%').parse()
                .map_err(|_| anyhow::anyhow!("max-storage takes a percentage, got '{}'", value))?;
            if clamp_storage_percent(percent) != percent {
                println!("Clamping {}% to {}%", percent, clamp_storage_percent(percent));
            }
            settings.max_storage_percent = percent;
        }
        "wifi-only" => settings.upload_on_wifi_only = parse_bool(value)?,
        "audio" => settings.enable_audio = parse_bool(value)?,
        "auto-delete" => settings.auto_delete_after_upload = parse_bool(value)?,
        "remote-folder" => {
            settings.remote_folder = if value.is_empty() || value == "-" {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        other => anyhow::bail!("Unknown setting '{}'", other),
    }

    let saved = store.save(settings)?;
    println!("Saved settings version {}", saved.version);

    Ok(())
}

// --- Helper Functions ---

fn open_database(data_dir: &Path) -> Result<Arc<Database>> {
    let db_path = get_db_path(data_dir);
    if !db_path.exists() {
        anyhow::bail!(
            "No data found at {}. Use 'evidencecam init' to create it.",
            data_dir.display()
        );
    }
    Ok(Arc::new(Database::open(&db_path)?))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => anyhow::bail!("Expected true/false, got '{}'", other),
    }
}

fn format_duration(ms: i64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn format_size(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
