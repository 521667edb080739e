//! Synchronous STAT7 facade shared by the `s7` CLI and the HTTP service.
//! Composes the `SQLite` store, the entanglement detector, the boundary
//! validator and the recovery gate from one YAML configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use stat7_core::{
    calibrate, canonical_coordinate, compute_address, derive_coordinate, resolve_adjacency,
    sign_address, sweep, synthetic_validation_set, AdjacencyLink, Address, AuditAction,
    AuditEvent, AuditLedger, AuditResult, BoundaryConfig, BoundaryValidator, CalibrationOptions,
    CalibrationReport, CancellationToken, Classification, Coordinate, DerivationRule,
    EntanglementConfig, EntanglementDetector, EntanglementEdge, LabeledPair, Payload, PutOutcome,
    Record, RepairEvent, ScoreComponents, SweepOptions, SweepReport,
};
use stat7_gate::{
    GateConfig, IdentityConfig, IdentityProvider, JsonlAuditLedger, RecoveryGate, RecoveryOutcome,
    RecoveryRequest,
};
use stat7_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, RecordQuery, SchemaStatus, SqliteStore,
    StoredRepair,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Requester recorded on audit events the boundary validator emits.
pub const BOUNDARY_REQUESTER: &str = "stat7-boundary";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Stat7Config {
    pub entanglement: EntanglementConfig,
    pub boundary: BoundaryConfig,
    pub gate: GateConfig,
    pub identity: IdentityConfig,
    /// Append audit events to this JSON-lines file instead of the database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

impl Stat7Config {
    /// # Errors
    /// Returns an error when any section holds an out-of-range value.
    pub fn validate(&self) -> Result<()> {
        self.entanglement
            .validate()
            .context("invalid entanglement config")?;
        BoundaryValidator::new(self.boundary).context("invalid boundary config")?;
        self.gate.validate().context("invalid gate config")?;
        Ok(())
    }
}

/// Load and validate configuration. A missing path or an empty file yields defaults.
///
/// # Errors
/// Returns an error when the file cannot be read, is not valid YAML for
/// [`Stat7Config`], or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<Stat7Config> {
    let config = match path {
        None => Stat7Config::default(),
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            if raw.trim().is_empty() {
                Stat7Config::default()
            } else {
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
        }
    };
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AddressRequest {
    pub coordinate: Coordinate,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressResult {
    pub address: Address,
    pub canonical_coordinate: String,
    pub payload_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IngestRequest {
    pub coordinate: Coordinate,
    pub payload: Payload,
    pub classification: Classification,
    #[serde(default)]
    pub owner: Option<String>,
    /// Sign the address with the configured gate key.
    #[serde(default)]
    pub sign: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeriveRequest {
    pub parent: Address,
    pub rule: DerivationRule,
    /// Defaults to the parent's payload.
    #[serde(default)]
    pub payload: Option<Payload>,
    /// Proposed child coordinate. Defaults to the rule applied to the parent.
    #[serde(default)]
    pub coordinate: Option<Coordinate>,
    #[serde(default)]
    pub sign: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestResult {
    pub record: Record,
    pub outcome: PutOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjacencyReport {
    pub address: Address,
    pub links: Vec<AdjacencyLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScoreRequest {
    pub left: Address,
    pub right: Address,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub left: Address,
    pub right: Address,
    pub score: f64,
    pub components: ScoreComponents,
    pub threshold: f64,
    pub entangled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SweepRequest {
    pub threshold: Option<f64>,
    pub options: SweepOptions,
    /// Store the detected edges, replacing earlier scores for the same pairs.
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepResult {
    pub records: usize,
    pub persisted_edges: usize,
    #[serde(flatten)]
    pub report: SweepReport,
}

pub struct Stat7Api {
    config: Stat7Config,
    store: Arc<SqliteStore>,
    ledger: Arc<dyn AuditLedger>,
    detector: EntanglementDetector,
    validator: BoundaryValidator,
    gate: RecoveryGate,
    signing_key: Option<Vec<u8>>,
}

impl Stat7Api {
    /// Open the database at `db_path` and wire every component from `config`.
    /// Schema migrations are not applied here; write paths apply them on demand.
    ///
    /// # Errors
    /// Returns an error when the config is invalid, the database or audit log
    /// cannot be opened, or prior audit events cannot be read back.
    pub fn open(db_path: &Path, config: Stat7Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::open(db_path)?);
        let ledger: Arc<dyn AuditLedger> = match &config.audit_log {
            Some(path) => Arc::new(
                JsonlAuditLedger::open(path.clone())
                    .with_context(|| format!("failed to open audit log {}", path.display()))?,
            ),
            None => store.clone(),
        };
        let identity: Arc<dyn IdentityProvider> = Arc::from(config.identity.build(
            config.gate.identity_timeout(),
            config.gate.identity_retry_backoff(),
        ));
        let gate = RecoveryGate::new(
            store.clone(),
            Arc::clone(&ledger),
            identity,
            Arc::new(config.gate.policy_source()),
            &config.gate,
        )?;

        if config.audit_log.is_some() || store.has_audit_ledger()? {
            let history = ledger.events().context("failed to replay audit ledger")?;
            let replayed = gate.restore_rate_window(&history);
            tracing::debug!(replayed, "rate window restored from audit ledger");
        }

        Ok(Self {
            detector: EntanglementDetector::new(config.entanglement.clone())?,
            validator: BoundaryValidator::new(config.boundary)?,
            signing_key: config.gate.signing_key()?,
            config,
            store,
            ledger,
            gate,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Stat7Config {
        &self.config
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let before = self.store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        self.store.migrate()?;
        let after = self.store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Compute the content address of a coordinate and payload without storing anything.
    ///
    /// # Errors
    /// Returns an error when the coordinate is out of range.
    pub fn address(&self, input: &AddressRequest) -> Result<AddressResult> {
        input.coordinate.validate()?;
        Ok(AddressResult {
            address: compute_address(&input.coordinate, input.payload.as_bytes()),
            canonical_coordinate: canonical_coordinate(&input.coordinate),
            payload_len: input.payload.len(),
        })
    }

    /// Admit a root coordinate through the boundary validator and store the record.
    ///
    /// # Errors
    /// Returns an error when repair fails, signing is requested without a key,
    /// or the address is already taken by different content.
    pub fn ingest(&self, input: IngestRequest) -> Result<IngestResult> {
        self.store.migrate()?;
        let admission = self
            .validator
            .admit_root(input.coordinate)
            .context("coordinate rejected at the root boundary")?;
        let repair = admission.repair_event().cloned();

        let mut record = Record::new(admission.into_coordinate(), input.payload, input.classification)?;
        if let Some(owner) = input.owner {
            record = record.with_owner(owner);
        }
        self.sign_if_requested(&mut record, input.sign)?;
        self.store_admitted(record, repair)
    }

    /// Derive a child of a stored record under `rule` and store it.
    ///
    /// # Errors
    /// Returns an error when the parent is missing, the derived coordinate cannot
    /// be brought back inside its region, or persistence fails.
    pub fn derive(&self, input: DeriveRequest) -> Result<IngestResult> {
        self.store.migrate()?;
        let parent = self
            .store
            .get_record(&input.parent)?
            .ok_or_else(|| anyhow!("parent record {} not found", input.parent))?;

        let proposed = match input.coordinate {
            Some(coordinate) => coordinate,
            None => derive_coordinate(&parent.coordinate, input.rule)?,
        };
        let admission = self
            .validator
            .admit_derived(proposed, &parent.coordinate, &parent.address, input.rule)
            .with_context(|| format!("{} derivation rejected", input.rule.as_str()))?;
        let repair = admission.repair_event().cloned();

        let payload = input.payload.unwrap_or_else(|| parent.payload.clone());
        let mut record = Record::new(admission.into_coordinate(), payload, parent.classification)?
            .with_parent(&parent)?;
        if let Some(owner) = &parent.owner {
            record = record.with_owner(owner.clone());
        }
        self.sign_if_requested(&mut record, input.sign)?;
        self.store_admitted(record, repair)
    }

    fn sign_if_requested(&self, record: &mut Record, sign: bool) -> Result<()> {
        if !sign {
            return Ok(());
        }
        let key = self
            .signing_key
            .as_deref()
            .ok_or_else(|| anyhow!("signing requested but gate.signing_key_hex is not configured"))?;
        record.signature = Some(sign_address(key, &record.address)?);
        Ok(())
    }

    fn store_admitted(&self, record: Record, repair: Option<RepairEvent>) -> Result<IngestResult> {
        let outcome = self.store.put_record_with_repair(&record, repair.as_ref())?;
        if let (PutOutcome::Inserted, Some(event)) = (outcome, &repair) {
            let mut audit = AuditEvent::new(
                AuditAction::BoundaryRepair,
                record.address.to_string(),
                BOUNDARY_REQUESTER,
                AuditResult::Success,
                format!("{} violation(s) repaired", event.violations.len()),
            );
            audit.classification = Some(record.classification);
            self.ledger.append(&audit)?;
            tracing::warn!(
                address = %record.address,
                repair_id = %event.repair_id,
                violations = event.violations.len(),
                "coordinate repaired at boundary"
            );
        }
        tracing::info!(address = %record.address, ?outcome, "record stored");
        Ok(IngestResult {
            record,
            outcome,
            repair,
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_record(&self, address: &Address) -> Result<Option<Record>> {
        self.store.migrate()?;
        self.store.get_record(address)
    }

    /// # Errors
    /// Returns an error when no record is stored at `address`.
    pub fn show(&self, address: &Address) -> Result<Record> {
        self.get_record(address)?
            .ok_or_else(|| anyhow!("record {address} not found"))
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        self.store.migrate()?;
        self.store.list_records(query)
    }

    /// # Errors
    /// Returns an error when the record is missing or the store cannot be read.
    pub fn adjacency(&self, address: &Address) -> Result<AdjacencyReport> {
        let record = self.show(address)?;
        let links = resolve_adjacency(&record.coordinate, self.store.as_ref())?;
        Ok(AdjacencyReport {
            address: record.address,
            links,
        })
    }

    /// Score two stored records against each other.
    ///
    /// # Errors
    /// Returns an error when either record is missing or the threshold is outside [0, 1].
    pub fn score(&self, input: &ScoreRequest) -> Result<ScoreResult> {
        let threshold = self.resolve_threshold(input.threshold)?;
        let left = self.show(&input.left)?;
        let right = self.show(&input.right)?;
        let breakdown = self.detector.breakdown(&left.coordinate, &right.coordinate);
        Ok(ScoreResult {
            left: left.address,
            right: right.address,
            score: breakdown.score,
            components: breakdown.components,
            threshold,
            entangled: self
                .detector
                .classify(&left.coordinate, &right.coordinate, threshold),
        })
    }

    /// Pairwise sweep over every stored record.
    ///
    /// # Errors
    /// Returns an error when the threshold is invalid or the store cannot be read or written.
    pub fn sweep(&self, input: &SweepRequest, cancel: &CancellationToken) -> Result<SweepResult> {
        let threshold = self.resolve_threshold(input.threshold)?;
        self.store.migrate()?;
        let entries = self.store.coordinates()?;
        let report = sweep(&entries, &self.detector, threshold, input.options, cancel);
        let persisted_edges = if input.persist {
            self.store.save_edges(&report.edges, threshold)?
        } else {
            0
        };
        tracing::info!(
            records = entries.len(),
            edges = report.edges.len(),
            pairs_scored = report.pairs_scored,
            cancelled = report.cancelled,
            persisted_edges,
            "entanglement sweep finished"
        );
        Ok(SweepResult {
            records: entries.len(),
            persisted_edges,
            report,
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn edges(&self, address: Option<&Address>) -> Result<Vec<EntanglementEdge>> {
        self.store.migrate()?;
        self.store.list_edges(address)
    }

    /// Threshold sweep over labeled pairs using the configured weights.
    ///
    /// # Errors
    /// Returns an error when labels are one-sided, options are invalid, or no
    /// threshold meets the precision and recall floors.
    pub fn calibrate(
        &self,
        pairs: &[LabeledPair],
        options: &CalibrationOptions,
    ) -> Result<CalibrationReport> {
        Ok(calibrate(pairs, &self.detector, options)?)
    }

    #[must_use]
    pub fn synthetic_pairs(&self, seed: u64, true_pairs: usize, false_pairs: usize) -> Vec<LabeledPair> {
        synthetic_validation_set(&self.config.entanglement, seed, true_pairs, false_pairs)
    }

    /// Run one request through the recovery gate.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be migrated or the audit ledger
    /// rejects the event. Policy denials are `Ok(RecoveryOutcome::Denied)`.
    pub fn recover(&self, request: &RecoveryRequest) -> Result<RecoveryOutcome> {
        self.store.migrate()?;
        Ok(self.gate.recover(request)?)
    }

    /// # Errors
    /// Returns an error when the audit ledger cannot be read.
    pub fn audit_events(&self) -> Result<Vec<AuditEvent>> {
        if self.config.audit_log.is_none() {
            self.store.migrate()?;
        }
        Ok(self.ledger.events()?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn repairs(&self, address: Option<&Address>) -> Result<Vec<StoredRepair>> {
        self.store.migrate()?;
        self.store.list_repairs(address)
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.store.migrate()?;
        self.store.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the snapshot is invalid or conflicts with stored data.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.store.migrate()?;
        self.store.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup cannot be read or migrated.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        self.store.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when the integrity checks cannot be run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.integrity_check()
    }

    fn resolve_threshold(&self, requested: Option<f64>) -> Result<f64> {
        let threshold = requested.unwrap_or(self.config.entanglement.threshold);
        if !(threshold.is_finite() && (0.0..=1.0).contains(&threshold)) {
            bail!("threshold must be in [0, 1], got {threshold}");
        }
        Ok(threshold)
    }
}
