//! Command surface of the `soil` binary.
//!
//! Every command opens the store at `--db`, applies migrations and prints a
//! pretty JSON document on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use soil_twin_core::{
    format_rfc3339, normalize_event, now_utc, BaselineSource, CurrentState, EntityId,
    EventSource, JsonlBaselineSource, JsonlEventSource, Provenance, RawEvent, SourceKind,
    StreamLayout, TransformRuleset,
};
use soil_twin_store_sqlite::{
    ProjectorCheck, ProjectorIssueSeverity, ProjectorStaleEntity, ProjectorStatus,
    SqliteSoilStore, StoredEvent,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "soil")]
#[command(about = "Soil digital-twin CLI")]
pub struct Cli {
    #[arg(long, env = "SOIL_TWIN_DB", default_value = "./soil_twin.sqlite3")]
    db: PathBuf,

    /// Ruleset JSON file stored (or replaced) before the command runs.
    #[arg(long, env = "SOIL_TWIN_RULESET")]
    ruleset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Baseline {
        #[command(subcommand)]
        command: BaselineCommand,
    },
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    History(HistoryArgs),
    Replay(ReplayArgs),
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    Projector {
        #[command(subcommand)]
        command: ProjectorCommand,
    },
    Ruleset {
        #[command(subcommand)]
        command: RulesetCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum BaselineCommand {
    Import(BaselineImportArgs),
    Show(UserArgs),
}

#[derive(Debug, Args)]
pub struct BaselineImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Log(EventLogArgs),
    Import(EventImportArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceKindArg {
    Manual,
    Historical,
    Live,
}

#[derive(Debug, Args)]
pub struct EventLogArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "type")]
    event_type: String,
    /// RFC3339, ISO 8601 or epoch seconds; defaults to now.
    #[arg(long)]
    timestamp: Option<String>,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[arg(long, value_enum, default_value_t = SourceKindArg::Manual)]
    source_kind: SourceKindArg,
    #[arg(long, default_value = "manual")]
    source_id: String,
}

#[derive(Debug, Args)]
pub struct EventImportArgs {
    #[arg(long)]
    file: PathBuf,
    /// rain, live-weather, irrigation, fertilizer, crop, amendment or tagged.
    #[arg(long)]
    layout: String,
    #[arg(long, value_enum, default_value_t = SourceKindArg::Historical)]
    source_kind: SourceKindArg,
    /// Defaults to the file stem.
    #[arg(long)]
    source_id: Option<String>,
    /// Entity credited with records that carry no `user_id`.
    #[arg(long)]
    default_user: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[arg(long)]
    ruleset_version: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    Show(StateShowArgs),
}

#[derive(Debug, Args)]
pub struct StateShowArgs {
    #[arg(long)]
    user: String,
    #[arg(long, default_value_t = 30)]
    staleness_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum ProjectorCommand {
    Status(ProjectorStatusArgs),
    Check(ProjectorCheckArgs),
    StaleEntities(ProjectorStaleEntitiesArgs),
}

#[derive(Debug, Args)]
pub struct ProjectorStatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ProjectorCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ProjectorStaleEntitiesArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetCommand {
    Show(RulesetShowArgs),
}

#[derive(Debug, Args)]
pub struct RulesetShowArgs {
    /// Defaults to the newest stored version.
    #[arg(long)]
    version: Option<u32>,
}

#[derive(Debug, Serialize)]
struct LoggedEvent {
    event: StoredEvent,
    /// State after every event logged since the last replay, this one included.
    projected_state: Option<CurrentState>,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteSoilStore::open(&cli.db)?;
    store.migrate()?;

    if let Some(path) = &cli.ruleset {
        let ruleset = load_ruleset_file(path)?;
        store.upsert_ruleset(&ruleset)?;
        info!(
            ruleset_version = ruleset.ruleset_version,
            path = %path.display(),
            "ruleset stored"
        );
    }

    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence, replay or the
/// projector check fails.
pub fn run_command(command: Command, store: &mut SqliteSoilStore) -> Result<()> {
    match command {
        Command::Baseline { command } => run_baseline(command, store),
        Command::Event { command } => run_event(command, store),
        Command::Events { command } => match command {
            EventsCommand::List(args) => {
                let user = args.user.as_deref().map(parse_user).transpose()?;
                let events = store.list_events(user.as_ref(), args.limit)?;
                print_json(&events)
            }
        },
        Command::History(args) => {
            let user = parse_user(&args.user)?;
            let events = store.history(&user, args.limit)?;
            print_json(&events)
        }
        Command::Replay(args) => {
            let report = store.replay(args.ruleset_version)?;
            print_json(&report)
        }
        Command::State { command } => match command {
            StateCommand::Show(args) => {
                let user = parse_user(&args.user)?;
                let view = store
                    .current_view(&user, now_utc(), args.staleness_secs)?
                    .ok_or_else(|| anyhow!("no state for {user}: missing baseline"))?;
                print_json(&view)
            }
        },
        Command::Projector { command } => run_projector(command, store),
        Command::Ruleset { command } => match command {
            RulesetCommand::Show(args) => {
                let ruleset = store.resolve_ruleset(args.version)?;
                print_json(&ruleset)
            }
        },
    }
}

fn run_baseline(command: BaselineCommand, store: &mut SqliteSoilStore) -> Result<()> {
    match command {
        BaselineCommand::Import(args) => {
            let mut source = JsonlBaselineSource::new(&args.file);
            let baselines = source
                .load_baselines()
                .with_context(|| format!("failed to read baselines from {}", args.file.display()))?;
            let report = store.import_baselines(&baselines)?;
            print_json(&report)
        }
        BaselineCommand::Show(args) => {
            let user = parse_user(&args.user)?;
            let baseline = store
                .get_baseline(&user)?
                .ok_or_else(|| anyhow!("no baseline recorded for {user}"))?;
            print_json(&baseline)
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteSoilStore) -> Result<()> {
    match command {
        EventCommand::Log(args) => {
            let timestamp = match args.timestamp {
                Some(raw) => raw,
                None => format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?,
            };
            let raw = RawEvent {
                user_id: args.user,
                timestamp,
                event_type: args.event_type,
                payload: parse_payload_json(&args.payload_json)?,
            };
            let event = normalize_event(&raw).map_err(|err| anyhow!("invalid event: {err}"))?;
            let provenance = Provenance::new(map_source_kind(args.source_kind), args.source_id);

            let stored = store.append_event(&event, &provenance)?;
            let projected_state = store
                .pending_projection(&stored.event.user_id)?
                .map(|(state, _)| state);
            print_json(&LoggedEvent {
                event: stored,
                projected_state,
            })
        }
        EventCommand::Import(args) => {
            let layout = StreamLayout::parse(&args.layout)
                .ok_or_else(|| anyhow!("unknown stream layout: {}", args.layout))?;
            let source_id = match args.source_id {
                Some(value) => value,
                None => file_stem(&args.file)?,
            };
            let provenance = Provenance::new(map_source_kind(args.source_kind), source_id);

            let mut source = JsonlEventSource::new(&args.file, layout, provenance.clone());
            if let Some(raw) = args.default_user.as_deref() {
                source = source.with_default_user(parse_user(raw)?);
            }
            let events = source
                .read_events()
                .with_context(|| format!("failed to read events from {}", args.file.display()))?;

            let report = store.import_events(&events, &provenance)?;
            print_json(&report)
        }
    }
}

fn run_projector(command: ProjectorCommand, store: &SqliteSoilStore) -> Result<()> {
    match command {
        ProjectorCommand::Status(args) => {
            let status = store.projector_status()?;
            if args.json {
                print_json(&status)?;
            } else {
                print_projector_status(&status);
            }
            Ok(())
        }
        ProjectorCommand::Check(args) => {
            let check = store.projector_check()?;
            if args.json {
                print_json(&check)?;
            } else {
                print_projector_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "projector consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
        ProjectorCommand::StaleEntities(args) => {
            let stale = store.projector_stale_entities(args.limit)?;
            if args.json {
                print_json(&stale)?;
            } else {
                print_projector_stale_entities(&stale);
            }
            Ok(())
        }
    }
}

fn load_ruleset_file(path: &Path) -> Result<TransformRuleset> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ruleset file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("ruleset file must be valid JSON: {}", path.display()))?;
    TransformRuleset::from_json(&value).map_err(|err| anyhow!("invalid ruleset: {err}"))
}

fn parse_payload_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}

fn parse_user(raw: &str) -> Result<EntityId> {
    EntityId::parse(raw).map_err(|err| anyhow!("invalid user: {err}"))
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a source id from {}", path.display()))
}

fn map_source_kind(value: SourceKindArg) -> SourceKind {
    match value {
        SourceKindArg::Manual => SourceKind::Manual,
        SourceKindArg::Historical => SourceKind::Historical,
        SourceKindArg::Live => SourceKind::Live,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_projector_status(status: &ProjectorStatus) {
    println!(
        "contract={} projector={} ruleset={} generation={} projected_event_seq={} latest_event_seq={} lag_events={}",
        status.contract_version,
        status.projector_name,
        status.ruleset_version,
        status.generation,
        status.projected_event_seq,
        status.latest_event_seq,
        status.lag_events
    );
    println!(
        "baselines={} state_rows={} entities_with_events={} entities_missing_baseline={} stale_state_rows={} baselines_without_state={} updated_at={}",
        status.baselines,
        status.state_rows,
        status.entities_with_events,
        status.entities_missing_baseline,
        status.stale_state_rows,
        status.baselines_without_state,
        status.updated_at.as_deref().unwrap_or("n/a")
    );
}

fn print_projector_check(check: &ProjectorCheck) {
    println!("contract={}", check.contract_version);
    print_projector_status(&check.status);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    ProjectorIssueSeverity::Warning => "warning",
                    ProjectorIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `soil replay` to publish pending events");
    }
}

fn print_projector_stale_entities(stale: &[ProjectorStaleEntity]) {
    println!(
        "{:<32} {:<14} projected_event_seq",
        "user_id", "max_event_seq"
    );
    println!("{}", "-".repeat(70));
    for item in stale {
        println!(
            "{:<32} {:<14} {}",
            item.user_id,
            item.max_event_seq,
            item.projected_event_seq
                .map_or_else(|| "none".to_string(), |value| value.to_string())
        );
    }
}
