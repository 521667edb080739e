use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use stat7_api::{
    load_config, AddressRequest, DeriveRequest, IngestRequest, ScoreRequest, Stat7Api,
    SweepRequest,
};
use stat7_core::{
    Address, CalibrationOptions, CancellationToken, Classification, Coordinate, DerivationRule,
    Horizon, LabeledPair, Payload, Realm, SweepOptions, POLARITY_LEN,
};
use stat7_gate::{RecoveryIntent, RecoveryOutcome, RecoveryRequest};
use stat7_store_sqlite::RecordQuery;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "S7_LOG";
const DENIED_EXIT_CODE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "s7")]
#[command(about = "STAT7 addressing, entanglement and recovery CLI")]
struct Cli {
    #[arg(long, default_value = "./stat7.sqlite3")]
    db: PathBuf,

    /// YAML configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Entangle {
        #[command(subcommand)]
        command: Box<EntangleCommand>,
    },
    Recover(Box<RecoverArgs>),
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Fail on rows that already exist instead of skipping them.
    #[arg(long, default_value_t = false)]
    strict: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Address(RecordAddressArgs),
    Add(RecordAddArgs),
    Derive(RecordDeriveArgs),
    Show(AddressArgs),
    List(RecordListArgs),
    Adjacency(AddressArgs),
}

#[derive(Debug, Args)]
struct CoordinateArgs {
    #[arg(long, value_enum)]
    realm: RealmArg,
    #[arg(long, default_value_t = 0)]
    lineage: u32,
    #[arg(long = "adjacent")]
    adjacency: Vec<String>,
    #[arg(long, value_enum, default_value = "genesis")]
    horizon: HorizonArg,
    #[arg(long)]
    luminosity: f64,
    /// Seven comma-separated values in [-1, 1]; zeros when omitted.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    polarity: Vec<f64>,
    #[arg(long, default_value_t = 7)]
    dimensionality: u8,
}

#[derive(Debug, Args)]
struct PayloadArgs {
    /// UTF-8 payload text.
    #[arg(long, conflicts_with = "payload_file")]
    payload: Option<String>,
    #[arg(long)]
    payload_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RecordAddressArgs {
    #[command(flatten)]
    coordinate: CoordinateArgs,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[command(flatten)]
    coordinate: CoordinateArgs,
    #[command(flatten)]
    payload: PayloadArgs,
    #[arg(long, value_enum, default_value = "public")]
    classification: ClassificationArg,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long, default_value_t = false)]
    sign: bool,
}

#[derive(Debug, Args)]
struct RecordDeriveArgs {
    #[arg(long)]
    parent: String,
    #[arg(long, value_enum)]
    rule: RuleArg,
    /// Required for compaction and expansion.
    #[arg(long)]
    target_luminosity: Option<f64>,
    #[command(flatten)]
    payload: PayloadArgs,
    #[arg(long, default_value_t = false)]
    sign: bool,
}

#[derive(Debug, Args)]
struct AddressArgs {
    #[arg(long)]
    address: String,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long, value_enum)]
    realm: Option<RealmArg>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum EntangleCommand {
    Score(EntangleScoreArgs),
    Sweep(EntangleSweepArgs),
    Edges(EntangleEdgesArgs),
    Calibrate(EntangleCalibrateArgs),
}

#[derive(Debug, Args)]
struct EntangleScoreArgs {
    #[arg(long)]
    left: String,
    #[arg(long)]
    right: String,
    #[arg(long)]
    threshold: Option<f64>,
}

#[derive(Debug, Args)]
struct EntangleSweepArgs {
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long, default_value_t = 256)]
    shard_size: usize,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[arg(long)]
    max_pairs: Option<u64>,
    #[arg(long, default_value_t = false)]
    persist: bool,
}

#[derive(Debug, Args)]
struct EntangleEdgesArgs {
    #[arg(long)]
    address: Option<String>,
}

#[derive(Debug, Args)]
struct EntangleCalibrateArgs {
    /// JSON array of labeled pairs. A synthetic set is generated when omitted.
    #[arg(long)]
    pairs_file: Option<PathBuf>,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    #[arg(long, default_value_t = 20)]
    true_pairs: usize,
    #[arg(long, default_value_t = 20)]
    false_pairs: usize,
    #[arg(long, default_value_t = 0.0)]
    start: f64,
    #[arg(long, default_value_t = 1.0)]
    end: f64,
    #[arg(long, default_value_t = 0.01)]
    step: f64,
    #[arg(long, default_value_t = 0.90)]
    min_precision: f64,
    #[arg(long, default_value_t = 0.85)]
    min_recall: f64,
    /// Include raw per-pair scores in the output.
    #[arg(long, default_value_t = false)]
    with_pair_scores: bool,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    #[arg(long)]
    bitchain_id: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    requester: String,
    /// Defaults to a fresh ULID.
    #[arg(long)]
    request_id: Option<String>,
    /// Resources the intent covers; defaults to the bitchain id.
    #[arg(long = "resource")]
    resources: Vec<String>,
    #[arg(long)]
    second_factor: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
    Repairs(AuditRepairsArgs),
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long)]
    bitchain_id: Option<String>,
    #[arg(long)]
    requester: Option<String>,
}

#[derive(Debug, Args)]
struct AuditRepairsArgs {
    #[arg(long)]
    address: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RealmArg {
    Data,
    Narrative,
    System,
    Faculty,
    Event,
    Pattern,
    Void,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HorizonArg {
    Genesis,
    Emergence,
    Peak,
    Decay,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassificationArg {
    Public,
    Sensitive,
    Pii,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuleArg {
    Compaction,
    Expansion,
    Archive,
}

fn realm(arg: RealmArg) -> Realm {
    match arg {
        RealmArg::Data => Realm::Data,
        RealmArg::Narrative => Realm::Narrative,
        RealmArg::System => Realm::System,
        RealmArg::Faculty => Realm::Faculty,
        RealmArg::Event => Realm::Event,
        RealmArg::Pattern => Realm::Pattern,
        RealmArg::Void => Realm::Void,
    }
}

fn horizon(arg: HorizonArg) -> Horizon {
    match arg {
        HorizonArg::Genesis => Horizon::Genesis,
        HorizonArg::Emergence => Horizon::Emergence,
        HorizonArg::Peak => Horizon::Peak,
        HorizonArg::Decay => Horizon::Decay,
        HorizonArg::Archived => Horizon::Archived,
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let api = Stat7Api::open(&cli.db, config)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &api).map(|()| ExitCode::SUCCESS),
        Command::Record { command } => run_record(*command, &api).map(|()| ExitCode::SUCCESS),
        Command::Entangle { command } => {
            run_entangle(*command, &api).map(|()| ExitCode::SUCCESS)
        }
        Command::Recover(args) => run_recover(*args, &api),
        Command::Audit { command } => run_audit(*command, &api).map(|()| ExitCode::SUCCESS),
    }
}

fn run_db(command: DbCommand, api: &Stat7Api) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let skip_existing = !args.strict;
            let summary = api.import_snapshot(&args.input, skip_existing)?;
            tracing::info!(
                in_dir = %args.input.display(),
                imported = summary.imported_records,
                skipped = summary.skipped_existing_records,
                "snapshot imported"
            );
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            tracing::info!(from = %args.input.display(), "database restored from backup");
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_record(command: RecordCommand, api: &Stat7Api) -> Result<()> {
    match command {
        RecordCommand::Address(args) => {
            let result = api.address(&AddressRequest {
                coordinate: build_coordinate(args.coordinate)?,
                payload: read_payload(&args.payload)?,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize address")?)
        }
        RecordCommand::Add(args) => {
            let classification = match args.classification {
                ClassificationArg::Public => Classification::Public,
                ClassificationArg::Sensitive => Classification::Sensitive,
                ClassificationArg::Pii => Classification::Pii,
            };
            let result = api.ingest(IngestRequest {
                coordinate: build_coordinate(args.coordinate)?,
                payload: read_payload(&args.payload)?,
                classification,
                owner: args.owner,
                sign: args.sign,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize record")?)
        }
        RecordCommand::Derive(args) => {
            let rule = match (args.rule, args.target_luminosity) {
                (RuleArg::Compaction, Some(target_luminosity)) => {
                    DerivationRule::Compaction { target_luminosity }
                }
                (RuleArg::Expansion, Some(target_luminosity)) => {
                    DerivationRule::Expansion { target_luminosity }
                }
                (RuleArg::Archive, _) => DerivationRule::Archive,
                (_, None) => bail!("--target-luminosity is required for compaction and expansion"),
            };
            let payload = if args.payload.payload.is_some() || args.payload.payload_file.is_some() {
                Some(read_payload(&args.payload)?)
            } else {
                None
            };
            let result = api.derive(DeriveRequest {
                parent: parse_address(&args.parent)?,
                rule,
                payload,
                coordinate: None,
                sign: args.sign,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize record")?)
        }
        RecordCommand::Show(args) => {
            let record = api.show(&parse_address(&args.address)?)?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::List(args) => {
            let records = api.list(&RecordQuery {
                realm: args.realm.map(realm),
                limit: args.limit,
            })?;
            emit_json(serde_json::json!({ "records": records }))
        }
        RecordCommand::Adjacency(args) => {
            let report = api.adjacency(&parse_address(&args.address)?)?;
            emit_json(serde_json::to_value(&report).context("failed to serialize adjacency")?)
        }
    }
}

fn run_entangle(command: EntangleCommand, api: &Stat7Api) -> Result<()> {
    match command {
        EntangleCommand::Score(args) => {
            let result = api.score(&ScoreRequest {
                left: parse_address(&args.left)?,
                right: parse_address(&args.right)?,
                threshold: args.threshold,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize score")?)
        }
        EntangleCommand::Sweep(args) => {
            let result = api.sweep(
                &SweepRequest {
                    threshold: args.threshold,
                    options: SweepOptions {
                        shard_size: args.shard_size,
                        workers: args.workers,
                        max_pairs: args.max_pairs,
                    },
                    persist: args.persist,
                },
                &CancellationToken::new(),
            )?;
            emit_json(serde_json::to_value(&result).context("failed to serialize sweep report")?)
        }
        EntangleCommand::Edges(args) => {
            let address = args.address.as_deref().map(parse_address).transpose()?;
            let edges = api.edges(address.as_ref())?;
            emit_json(serde_json::json!({ "edges": edges }))
        }
        EntangleCommand::Calibrate(args) => {
            let (source, pairs) = match &args.pairs_file {
                Some(path) => {
                    let body = fs::read_to_string(path)
                        .with_context(|| format!("failed to read pairs file {}", path.display()))?;
                    let pairs: Vec<LabeledPair> = serde_json::from_str(&body)
                        .with_context(|| format!("failed to parse pairs file {}", path.display()))?;
                    (path.display().to_string(), pairs)
                }
                None => (
                    format!("synthetic(seed={})", args.seed),
                    api.synthetic_pairs(args.seed, args.true_pairs, args.false_pairs),
                ),
            };
            let mut report = api.calibrate(
                &pairs,
                &CalibrationOptions {
                    start: args.start,
                    end: args.end,
                    step: args.step,
                    min_precision: args.min_precision,
                    min_recall: args.min_recall,
                },
            )?;
            tracing::debug!(source = %source, pairs = pairs.len(), "calibration finished");
            if !args.with_pair_scores {
                report.pair_scores.clear();
            }
            emit_json(serde_json::json!({
                "pairs_source": source,
                "pairs": pairs.len(),
                "report": report
            }))
        }
    }
}

fn run_recover(args: RecoverArgs, api: &Stat7Api) -> Result<ExitCode> {
    let resources = if args.resources.is_empty() {
        vec![args.bitchain_id.clone()]
    } else {
        args.resources
    };
    let request = RecoveryRequest {
        bitchain_id: args.bitchain_id,
        auth_token: args.token,
        requester_id: args.requester,
        intent: Some(RecoveryIntent {
            request_id: args.request_id.unwrap_or_else(|| Ulid::new().to_string()),
            resources,
        }),
        second_factor: args.second_factor,
    };
    let outcome = api.recover(&request)?;
    let exit = match &outcome {
        RecoveryOutcome::Released(_) => ExitCode::SUCCESS,
        RecoveryOutcome::Denied(denial) => {
            tracing::debug!(
                kind = denial.kind.as_str(),
                exit_code = DENIED_EXIT_CODE,
                "recover denied"
            );
            ExitCode::from(DENIED_EXIT_CODE)
        }
    };
    emit_json(serde_json::to_value(&outcome).context("failed to serialize recovery outcome")?)?;
    Ok(exit)
}

fn run_audit(command: AuditCommand, api: &Stat7Api) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let events = api
                .audit_events()?
                .into_iter()
                .filter(|event| {
                    args.bitchain_id
                        .as_deref()
                        .map_or(true, |id| event.bitchain_id == id)
                })
                .filter(|event| {
                    args.requester
                        .as_deref()
                        .map_or(true, |requester| event.requester_id == requester)
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "events": events }))
        }
        AuditCommand::Repairs(args) => {
            let address = args.address.as_deref().map(parse_address).transpose()?;
            let repairs = api.repairs(address.as_ref())?;
            emit_json(serde_json::json!({ "repairs": repairs }))
        }
    }
}

fn build_coordinate(args: CoordinateArgs) -> Result<Coordinate> {
    let polarity = if args.polarity.is_empty() {
        [0.0; POLARITY_LEN]
    } else {
        <[f64; POLARITY_LEN]>::try_from(args.polarity.as_slice()).map_err(|_| {
            anyhow!(
                "--polarity takes exactly {POLARITY_LEN} values, got {}",
                args.polarity.len()
            )
        })?
    };
    let adjacency = args
        .adjacency
        .iter()
        .map(|address| parse_address(address))
        .collect::<Result<Vec<_>>>()?;
    let mut coordinate = Coordinate::genesis(realm(args.realm), args.luminosity, args.dimensionality)
        .with_polarity(polarity)
        .with_adjacency(adjacency);
    coordinate.lineage = args.lineage;
    coordinate.horizon = horizon(args.horizon);
    Ok(coordinate)
}

fn read_payload(args: &PayloadArgs) -> Result<Payload> {
    match (&args.payload, &args.payload_file) {
        (Some(text), _) => Ok(Payload::from(text.as_str())),
        (None, Some(path)) => fs::read(path)
            .map(Payload::new)
            .with_context(|| format!("failed to read payload file {}", path.display())),
        (None, None) => Err(anyhow!("one of --payload or --payload-file is required")),
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::parse(raw).with_context(|| format!("invalid address: {raw}"))
}
