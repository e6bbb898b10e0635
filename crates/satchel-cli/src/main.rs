//! Satchel CLI - Offline-first form submission capture
//!
//! Capture submissions locally, sync them when a connection is available.

use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use satchel_core::db::{
    Database, LibSqlSnapshotRepository, LibSqlSubmissionRepository, SnapshotRepository,
    SubmissionRepository,
};
use satchel_core::remote::{FormsRemote, HttpFormsRemote, RemoteError};
use satchel_core::sync::{
    ConflictResolver, ConnectivityObserver, ConnectivityProbe, HttpConnectivityProbe,
    ObserverEvent, SyncEngine, SyncOptions, SyncReport, SyncStatus,
};
use satchel_core::{FormSnapshot, NewSubmission, SubmissionRecord, SubmissionStatus, Visibility};
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Capture form submissions offline and sync them later")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a submission for a form
    #[command(alias = "add")]
    Capture {
        /// Target form identifier
        form_id: String,
        /// Submission payload as JSON (stdin or $EDITOR when omitted)
        payload: Vec<String>,
        /// Form version to record (defaults to the cached snapshot's version)
        #[arg(long, value_name = "VERSION")]
        form_version: Option<String>,
        /// Submit through the anonymous endpoint
        #[arg(long)]
        public: bool,
    },
    /// Fetch a form definition and cache it for offline capture
    Fetch {
        /// Form identifier
        form_id: String,
    },
    /// Sync queued submissions to the server
    Sync {
        /// Also retry submissions that failed in earlier runs
        #[arg(long)]
        retry_failed: bool,
    },
    /// Show queue state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List submissions waiting on a conflict decision
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve version-conflicted submissions
    Resolve {
        /// Submit against the changed form definitions anyway
        #[arg(long)]
        force: bool,
        /// Permanently delete the conflicted submissions
        #[arg(long)]
        discard: bool,
    },
    /// Watch connectivity and sync automatically when online
    Watch {
        /// Seconds between connectivity probes
        #[arg(long, default_value = "30")]
        interval_secs: u64,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] satchel_core::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Payload is not valid JSON: {0}")]
    InvalidPayloadJson(#[from] serde_json::Error),
    #[error("No submission payload provided")]
    EmptyPayload,
    #[error("No cached snapshot for form '{0}'. Run `satchel fetch {0}` or pass --form-version.")]
    NoSnapshot(String),
    #[error("Server is not configured. Set SATCHEL_SERVER_URL (and SATCHEL_API_TOKEN for private forms).")]
    ServerNotConfigured,
    #[error("Pass exactly one of --force or --discard")]
    InvalidResolveFlags,
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

/// Which terminal action a `resolve` invocation requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResolveMode {
    Force,
    Discard,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("satchel_core=info".parse().unwrap())
                .add_directive("satchel_cli=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Capture {
            form_id,
            payload,
            form_version,
            public,
        } => {
            run_capture(&form_id, &payload, form_version.as_deref(), public, &db_path).await?;
        }
        Commands::Fetch { form_id } => run_fetch(&form_id, &db_path).await?,
        Commands::Sync { retry_failed } => run_sync(retry_failed, &db_path).await?,
        Commands::Status { json } => run_status(json, &db_path).await?,
        Commands::Conflicts { json } => run_conflicts(json, &db_path).await?,
        Commands::Resolve { force, discard } => {
            let mode = validate_resolve_mode(force, discard)?;
            run_resolve(mode, &db_path).await?;
        }
        Commands::Watch { interval_secs } => run_watch(interval_secs, &db_path).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}

async fn run_capture(
    form_id: &str,
    payload_parts: &[String],
    form_version: Option<&str>,
    public: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let payload = resolve_payload(payload_parts)?;

    let db = open_database(db_path).await?;
    let form_version = match form_version {
        Some(version) => version.to_string(),
        None => {
            let snapshots = LibSqlSnapshotRepository::new(db.connection());
            snapshots
                .get(form_id)
                .await?
                .map(|snapshot| snapshot.version)
                .ok_or_else(|| CliError::NoSnapshot(form_id.to_string()))?
        }
    };

    let visibility = if public {
        Visibility::Public
    } else {
        Visibility::Private
    };

    let repo = LibSqlSubmissionRepository::new(db.connection());
    let record = repo
        .add(NewSubmission::new(
            form_id,
            form_version,
            payload.into_bytes(),
            visibility,
        ))
        .await?;

    println!("{}", record.local_id);
    Ok(())
}

async fn run_fetch(form_id: &str, db_path: &Path) -> Result<(), CliError> {
    let (server_url, api_token) = remote_settings();
    let remote = build_remote(server_url, api_token)?;
    let form = remote.fetch_form(form_id).await?;

    let db = open_database(db_path).await?;
    let snapshots = LibSqlSnapshotRepository::new(db.connection());
    let payload = serde_json::to_vec(&form.definition)?;
    snapshots
        .put(&FormSnapshot::new(
            form.form_id.clone(),
            form.project_id,
            form.version.clone(),
            payload,
        ))
        .await?;

    tracing::info!(form_id = %form.form_id, version = %form.version, "form snapshot refreshed");
    println!("{} @ {}", form.form_id, form.version);
    Ok(())
}

async fn run_sync(retry_failed: bool, db_path: &Path) -> Result<(), CliError> {
    let (server_url, api_token) = remote_settings();
    let remote = build_remote(server_url, api_token)?;

    let db = Arc::new(open_database(db_path).await?);
    let engine = SyncEngine::with_options(db, remote, SyncOptions { retry_failed });

    tracing::info!(retry_failed, "starting sync run");
    engine.recover().await?;
    let report = engine.sync().await?;
    print_report(&report);
    Ok(())
}

async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;

    // A one-shot invocation reports reachability, not an engine's view of it
    let is_online = match remote_settings().0 {
        Some(server_url) => HttpConnectivityProbe::new(server_url).check().await,
        None => false,
    };
    let status = SyncStatus::read(&db, is_online, false).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        let now_ms = Utc::now().timestamp_millis();
        let last_synced = status.last_synced_at.map_or_else(
            || "never".to_string(),
            |at| format_relative_time(at, now_ms),
        );
        println!("online:      {}", if status.is_online { "yes" } else { "no" });
        println!("pending:     {}", status.pending_count);
        println!("conflicts:   {}", status.conflict_count);
        println!("last synced: {last_synced}");
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct ConflictListItem {
    local_id: i64,
    form_id: String,
    form_version: String,
    error: Option<String>,
    created_at: i64,
    relative_time: String,
}

async fn run_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let repo = LibSqlSubmissionRepository::new(db.connection());
    let conflicts = repo
        .list_by_status(&[SubmissionStatus::VersionConflict])
        .await?;

    if as_json {
        let items = conflicts
            .iter()
            .map(conflict_to_list_item)
            .collect::<Vec<ConflictListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if conflicts.is_empty() {
        println!("No conflicts");
    } else {
        let now_ms = Utc::now().timestamp_millis();
        for record in &conflicts {
            let detail = record.error.as_deref().unwrap_or("version changed");
            let relative_time = format_relative_time(record.created_at, now_ms);
            println!(
                "{:<6}  {:<24}  {relative_time:<10}  {detail}",
                record.local_id.to_string(),
                record.form_id
            );
        }
    }

    Ok(())
}

async fn run_resolve(mode: ResolveMode, db_path: &Path) -> Result<(), CliError> {
    let (server_url, api_token) = remote_settings();
    let remote = build_remote(server_url, api_token)?;

    let db = Arc::new(open_database(db_path).await?);
    let engine = SyncEngine::new(db, remote);
    let resolver = ConflictResolver::new(&engine);

    match mode {
        ResolveMode::Force => {
            let report = resolver.force_submit().await?;
            print_report(&report);
        }
        ResolveMode::Discard => {
            let discarded = resolver.discard().await?;
            println!("discarded {discarded}");
        }
    }

    Ok(())
}

async fn run_watch(interval_secs: u64, db_path: &Path) -> Result<(), CliError> {
    let (server_url, api_token) = remote_settings();
    let Some(server_url) = server_url else {
        return Err(CliError::ServerNotConfigured);
    };
    let remote = build_remote(Some(server_url.clone()), api_token)?;

    let db = Arc::new(open_database(db_path).await?);
    let engine = Arc::new(SyncEngine::new(db, remote));
    engine.recover().await?;

    tracing::info!(interval_secs, "watching connectivity");
    let probe = HttpConnectivityProbe::new(server_url);
    let observer = ConnectivityObserver::new(
        Arc::clone(&engine),
        probe,
        Duration::from_secs(interval_secs.max(1)),
    );
    let mut handle = observer.start();

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(ObserverEvent::Started(status)) => {
                    println!(
                        "watching ({}, {} pending)",
                        if status.is_online { "online" } else { "offline" },
                        status.pending_count
                    );
                }
                Some(ObserverEvent::Online) => println!("online, syncing..."),
                Some(ObserverEvent::Offline) => println!("offline"),
                Some(ObserverEvent::SyncCompleted(report)) => print_report(&report),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                handle.stop().await;
                break;
            }
        }
    }

    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "satchel", buffer);
}

fn print_report(report: &SyncReport) {
    if report.skipped {
        println!("skipped (offline or already syncing)");
    } else {
        println!(
            "attempted {}, synced {}, failed {}, conflicts {}",
            report.attempted, report.synced, report.failed, report.conflicts
        );
    }
}

fn conflict_to_list_item(record: &SubmissionRecord) -> ConflictListItem {
    let now_ms = Utc::now().timestamp_millis();
    ConflictListItem {
        local_id: record.local_id.as_i64(),
        form_id: record.form_id.clone(),
        form_version: record.form_version.clone(),
        error: record.error.clone(),
        created_at: record.created_at,
        relative_time: format_relative_time(record.created_at, now_ms),
    }
}

fn validate_resolve_mode(force: bool, discard: bool) -> Result<ResolveMode, CliError> {
    match (force, discard) {
        (true, false) => Ok(ResolveMode::Force),
        (false, true) => Ok(ResolveMode::Discard),
        _ => Err(CliError::InvalidResolveFlags),
    }
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

fn resolve_payload(payload_parts: &[String]) -> Result<String, CliError> {
    if let Some(payload) = normalize_payload(&payload_parts.join(" "))? {
        return Ok(payload);
    }

    if let Some(payload) = read_piped_stdin()? {
        return Ok(payload);
    }

    if let Some(payload) = capture_editor_input()? {
        return Ok(payload);
    }

    Err(CliError::EmptyPayload)
}

/// Trim the raw payload and require well-formed JSON; the engine treats the
/// payload as opaque, so malformed input would only surface server-side.
fn normalize_payload(payload: &str) -> Result<Option<String>, CliError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<serde_json::Value>(trimmed)?;
    Ok(Some(trimmed.to_string()))
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    normalize_payload(&buffer)
}

fn capture_editor_input() -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_payload_file_path();
    std::fs::write(&temp_file, "{}")?;

    let launch_result = launch_editor(&editor, &temp_file);
    let payload = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    normalize_payload(&payload)
}

fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Fallback for editor commands with args, e.g. "code --wait"
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_payload_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("satchel-payload-{}-{now}.json", std::process::id()))
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SATCHEL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("satchel")
        .join("satchel.db")
}

fn remote_settings() -> (Option<String>, Option<String>) {
    let server_url = env::var("SATCHEL_SERVER_URL")
        .ok()
        .filter(|value| !value.trim().is_empty());
    let api_token = env::var("SATCHEL_API_TOKEN")
        .ok()
        .filter(|value| !value.trim().is_empty());
    (server_url, api_token)
}

fn build_remote(
    server_url: Option<String>,
    api_token: Option<String>,
) -> Result<HttpFormsRemote, CliError> {
    let Some(server_url) = server_url else {
        return Err(CliError::ServerNotConfigured);
    };

    let mut remote = HttpFormsRemote::new(server_url)?;
    if let Some(token) = api_token {
        remote = remote.with_token(token);
    }
    Ok(remote)
}

async fn open_database(path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!(path = %path.display(), "opening local database");
    Ok(Database::open(path).await?)
}
