use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stat7_core::{
    Address, AuditEvent, AuditLedger, Classification, Coordinate, DerivationRule, EntanglementEdge,
    LedgerError, Payload, PutOutcome, Realm, Record, RecordStore, RepairEvent, StoreError,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  address TEXT PRIMARY KEY CHECK (length(address) = 64),
  realm TEXT NOT NULL CHECK (realm IN ('data','narrative','system','faculty','event','pattern','void')),
  lineage INTEGER NOT NULL CHECK (lineage >= 0),
  horizon TEXT NOT NULL CHECK (horizon IN ('genesis','emergence','peak','decay','archived')),
  luminosity REAL NOT NULL CHECK (luminosity >= 0.0 AND luminosity <= 1.0),
  dimensionality INTEGER NOT NULL CHECK (dimensionality BETWEEN 1 AND 7),
  coordinate_json TEXT NOT NULL,
  classification TEXT NOT NULL CHECK (classification IN ('PUBLIC','SENSITIVE','PII')),
  payload BLOB NOT NULL,
  parent_address TEXT,
  owner TEXT,
  signature TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  action TEXT NOT NULL,
  bitchain_id TEXT NOT NULL,
  requester_id TEXT NOT NULL,
  result TEXT NOT NULL CHECK (result IN ('SUCCESS','DENIED')),
  recorded_at TEXT NOT NULL,
  event_json TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS audit_events_reject_update
BEFORE UPDATE ON audit_events
BEGIN
  SELECT RAISE(ABORT, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_reject_delete
BEFORE DELETE ON audit_events
BEGIN
  SELECT RAISE(ABORT, 'audit_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_records_realm ON records(realm);
CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_address);
CREATE INDEX IF NOT EXISTS idx_audit_events_bitchain ON audit_events(bitchain_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS boundary_repairs (
  repair_id TEXT PRIMARY KEY,
  record_address TEXT NOT NULL REFERENCES records(address),
  parent_address TEXT,
  rule TEXT,
  event_json TEXT NOT NULL,
  repaired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entanglement_edges (
  source_address TEXT NOT NULL REFERENCES records(address),
  target_address TEXT NOT NULL REFERENCES records(address),
  score REAL NOT NULL CHECK (score >= 0.0 AND score <= 1.0),
  threshold REAL NOT NULL,
  components_json TEXT NOT NULL,
  detected_at TEXT NOT NULL,
  PRIMARY KEY (source_address, target_address),
  CHECK (source_address < target_address)
);

CREATE INDEX IF NOT EXISTS idx_boundary_repairs_record ON boundary_repairs(record_address);
CREATE INDEX IF NOT EXISTS idx_entanglement_edges_target ON entanglement_edges(target_address);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const RECORD_COLUMNS: &str =
    "address, coordinate_json, classification, payload, parent_address, owner, signature";

const RECORDS_FILE: &str = "records.ndjson";
const AUDIT_EVENTS_FILE: &str = "audit_events.ndjson";
const BOUNDARY_REPAIRS_FILE: &str = "boundary_repairs.ndjson";

/// SQLite-backed record store, audit ledger and repair log. The connection sits
/// behind a mutex so one store can be shared across request threads.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordQuery {
    pub realm: Option<Realm>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRepair {
    pub record_address: Address,
    #[serde(flatten)]
    pub event: RepairEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub imported_audit_events: usize,
    pub skipped_existing_audit_events: usize,
    pub imported_repairs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Stored records whose address no longer matches their content.
    pub address_mismatches: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed STAT7 store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn()?;
        schema_status_on(&conn)
    }

    /// Whether the audit ledger table exists, whatever the rest of the schema's state.
    ///
    /// # Errors
    /// Returns an error when the schema catalog cannot be read.
    pub fn has_audit_ledger(&self) -> Result<bool> {
        let conn = self.conn()?;
        table_exists(&conn, "audit_events")
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn()?;
        migrate_on(&mut conn)
    }

    /// Insert `record` unless identical content already owns its address.
    ///
    /// # Errors
    /// Returns `StoreError::Integrity` (wrapped) when the address does not match the
    /// content, `StoreError::DuplicateAddressConflict` when different content owns the
    /// address, and a plain error for backend failures.
    pub fn put_record(&self, record: &Record) -> Result<PutOutcome> {
        self.put_record_with_repair(record, None)
    }

    /// Insert `record` and, in the same transaction, the repair that produced its coordinate.
    ///
    /// # Errors
    /// Same as [`SqliteStore::put_record`], plus failures writing the repair row.
    pub fn put_record_with_repair(
        &self,
        record: &Record,
        repair: Option<&RepairEvent>,
    ) -> Result<PutOutcome> {
        record
            .verify_address()
            .map_err(|err| anyhow::Error::new(StoreError::Integrity(err.to_string())))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to start transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO records(
                    address, realm, lineage, horizon, luminosity, dimensionality,
                    coordinate_json, classification, payload, parent_address, owner, signature,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(address) DO NOTHING",
                params![
                    record.address.as_str(),
                    record.coordinate.realm.as_str(),
                    i64::from(record.coordinate.lineage),
                    record.coordinate.horizon.as_str(),
                    record.coordinate.luminosity,
                    i64::from(record.coordinate.dimensionality),
                    serde_json::to_string(&record.coordinate)
                        .context("failed to serialize coordinate")?,
                    record.classification.as_str(),
                    record.payload.as_bytes(),
                    record.parent.as_ref().map(Address::as_str),
                    record.owner.as_deref(),
                    record.signature.as_deref(),
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert record")?;

        if inserted == 0 {
            let existing = load_record(&tx, &record.address)?
                .ok_or_else(|| anyhow!("record {} vanished during insert", record.address))?;
            if existing.same_content(record) {
                return Ok(PutOutcome::AlreadyPresent);
            }
            tracing::error!(
                address = %record.address,
                "duplicate address conflict: stored content differs from incoming record"
            );
            return Err(anyhow::Error::new(StoreError::DuplicateAddressConflict {
                address: record.address.clone(),
            }));
        }

        if let Some(event) = repair {
            insert_repair(&tx, &record.address, event)?;
        }

        tx.commit().context("failed to commit record transaction")?;
        Ok(PutOutcome::Inserted)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_record(&self, address: &Address) -> Result<Option<Record>> {
        let conn = self.conn()?;
        load_record(&conn, address)
    }

    /// List records in insertion order, optionally filtered by realm.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM records
             WHERE (?1 IS NULL OR realm = ?1)
             ORDER BY rowid ASC
             LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![
            query.realm.map(Realm::as_str),
            query.limit.map_or(-1, i64::from),
        ])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    /// Address and coordinate of every stored record, ordered by address.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn coordinates(&self) -> Result<Vec<(Address, Coordinate)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT address, coordinate_json FROM records ORDER BY address ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let address_raw: String = row.get(0)?;
            let coordinate_raw: String = row.get(1)?;
            out.push((parse_address(&address_raw)?, parse_coordinate(&coordinate_raw)?));
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error when the record is missing or the insert fails.
    pub fn record_repair(&self, record_address: &Address, event: &RepairEvent) -> Result<()> {
        let conn = self.conn()?;
        insert_repair(&conn, record_address, event)
    }

    /// Boundary repairs, oldest first, optionally limited to one record.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_repairs(&self, record_address: Option<&Address>) -> Result<Vec<StoredRepair>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_address, event_json FROM boundary_repairs
             WHERE (?1 IS NULL OR record_address = ?1)
             ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![record_address.map(Address::as_str)])?;
        let mut repairs = Vec::new();
        while let Some(row) = rows.next()? {
            let address_raw: String = row.get(0)?;
            let event_raw: String = row.get(1)?;
            repairs.push(StoredRepair {
                record_address: parse_address(&address_raw)?,
                event: serde_json::from_str(&event_raw)
                    .context("failed to decode boundary repair event")?,
            });
        }
        Ok(repairs)
    }

    /// Upserts sweep edges. Returns the number written.
    ///
    /// # Errors
    /// Returns an error when an edge references an unknown record or a write fails.
    pub fn save_edges(&self, edges: &[EntanglementEdge], threshold: f64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to start transaction")?;
        let detected_at = now_rfc3339()?;
        for edge in edges {
            tx.execute(
                "INSERT INTO entanglement_edges(
                    source_address, target_address, score, threshold, components_json, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(source_address, target_address) DO UPDATE SET
                    score = excluded.score,
                    threshold = excluded.threshold,
                    components_json = excluded.components_json,
                    detected_at = excluded.detected_at",
                params![
                    edge.source.as_str(),
                    edge.target.as_str(),
                    edge.score,
                    threshold,
                    serde_json::to_string(&edge.components)
                        .context("failed to serialize score components")?,
                    detected_at,
                ],
            )
            .with_context(|| format!("failed to save edge {} -> {}", edge.source, edge.target))?;
        }
        tx.commit().context("failed to commit edge transaction")?;
        Ok(edges.len())
    }

    /// Stored edges, optionally those touching one address.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_edges(&self, address: Option<&Address>) -> Result<Vec<EntanglementEdge>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_address, target_address, score, components_json
             FROM entanglement_edges
             WHERE (?1 IS NULL OR source_address = ?1 OR target_address = ?1)
             ORDER BY source_address ASC, target_address ASC",
        )?;
        let mut rows = stmt.query(params![address.map(Address::as_str)])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            let source_raw: String = row.get(0)?;
            let target_raw: String = row.get(1)?;
            let components_raw: String = row.get(3)?;
            edges.push(EntanglementEdge {
                source: parse_address(&source_raw)?,
                target: parse_address(&target_raw)?,
                score: row.get(2)?,
                components: serde_json::from_str(&components_raw)
                    .context("failed to decode score components")?,
            });
        }
        Ok(edges)
    }

    /// # Errors
    /// Returns an error when the event cannot be serialized or inserted.
    pub fn append_audit_event(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.conn()?;
        insert_audit_event(&conn, event)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_audit_events(&self) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT event_json FROM audit_events ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            events.push(serde_json::from_str(&raw).context("failed to decode audit event")?);
        }
        Ok(events)
    }

    /// Export records, audit events and repairs as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list_records(&RecordQuery::default())?;
        let audit_events = self.list_audit_events()?;
        let repairs = self.list_repairs(None)?;

        let mut files = Vec::new();
        for (name, digest) in [
            (RECORDS_FILE, write_ndjson_file(&out_dir.join(RECORDS_FILE), &records)?),
            (AUDIT_EVENTS_FILE, write_ndjson_file(&out_dir.join(AUDIT_EVENTS_FILE), &audit_events)?),
            (BOUNDARY_REPAIRS_FILE, write_ndjson_file(&out_dir.join(BOUNDARY_REPAIRS_FILE), &repairs)?),
        ] {
            files.push(ExportFileDigest {
                path: name.to_string(),
                sha256: digest.0,
                records: digest.1,
            });
        }

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for record in read_ndjson_file::<Record>(&in_dir.join(RECORDS_FILE))? {
            match self.put_record(&record)? {
                PutOutcome::Inserted => summary.imported_records += 1,
                PutOutcome::AlreadyPresent if skip_existing => summary.skipped_existing_records += 1,
                PutOutcome::AlreadyPresent => {
                    return Err(anyhow!("record already exists for address {}", record.address));
                }
            }
        }

        for event in read_ndjson_file::<AuditEvent>(&in_dir.join(AUDIT_EVENTS_FILE))? {
            if self.audit_event_exists(&event.event_id)? {
                if skip_existing {
                    summary.skipped_existing_audit_events += 1;
                    continue;
                }
                return Err(anyhow!("audit event already exists: {}", event.event_id));
            }
            self.append_audit_event(&event)?;
            summary.imported_audit_events += 1;
        }

        for repair in read_ndjson_file::<StoredRepair>(&in_dir.join(BOUNDARY_REPAIRS_FILE))? {
            let conn = self.conn()?;
            summary.imported_repairs +=
                write_repair(&conn, "INSERT OR IGNORE", &repair.record_address, &repair.event)?;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn()?
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        let mut conn = self.conn()?;
        conn.restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;
        migrate_on(&mut conn)
    }

    /// Run quick-check, foreign-key-check, address re-verification and schema probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn()?;
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut address_mismatches = Vec::new();
        if table_exists(&conn, "records")? {
            let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let record = record_from_row(row)?;
                if record.verify_address().is_err() {
                    address_mismatches.push(record.address.to_string());
                }
            }
        }

        let schema_status = schema_status_on(&conn)?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            address_mismatches,
            schema_status,
        })
    }

    fn audit_event_exists(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM audit_events WHERE event_id = ?1)",
                params![event_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check audit event existence")?;
        Ok(exists == 1)
    }
}

fn store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_error) => store_error,
        Err(other) => StoreError::Backend(format!("{other:#}")),
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, address: &Address) -> Result<Option<Record>, StoreError> {
        self.get_record(address).map_err(store_error)
    }

    fn put(&self, record: &Record) -> Result<PutOutcome, StoreError> {
        self.put_record(record).map_err(store_error)
    }
}

impl AuditLedger for SqliteStore {
    fn append(&self, event: &AuditEvent) -> Result<(), LedgerError> {
        self.append_audit_event(event)
            .map_err(|err| LedgerError::Backend(format!("{err:#}")))
    }

    fn events(&self) -> Result<Vec<AuditEvent>, LedgerError> {
        self.list_audit_events()
            .map_err(|err| LedgerError::Backend(format!("{err:#}")))
    }
}

fn insert_repair(conn: &Connection, record_address: &Address, event: &RepairEvent) -> Result<()> {
    write_repair(conn, "INSERT", record_address, event)?;
    Ok(())
}

fn write_repair(
    conn: &Connection,
    verb: &str,
    record_address: &Address,
    event: &RepairEvent,
) -> Result<usize> {
    conn.execute(
        &format!(
            "{verb} INTO boundary_repairs(
                repair_id, record_address, parent_address, rule, event_json, repaired_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            event.repair_id,
            record_address.as_str(),
            event.parent.as_ref().map(Address::as_str),
            event.rule.map(DerivationRule::as_str),
            serde_json::to_string(event).context("failed to serialize repair event")?,
            rfc3339(event.repaired_at)?,
        ],
    )
    .with_context(|| format!("failed to record boundary repair for {record_address}"))
}

fn insert_audit_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_events(
            event_id, action, bitchain_id, requester_id, result, recorded_at, event_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.action.as_str(),
            event.bitchain_id,
            event.requester_id,
            event.result.as_str(),
            rfc3339(event.timestamp)?,
            serde_json::to_string(event).context("failed to serialize audit event")?,
        ],
    )
    .with_context(|| format!("failed to append audit event {}", event.event_id))?;
    Ok(())
}

fn load_record(conn: &Connection, address: &Address) -> Result<Option<Record>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE address = ?1"
    ))?;
    let mut rows = stmt.query(params![address.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(row)?)),
        None => Ok(None),
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<Record> {
    let address_raw: String = row.get(0)?;
    let coordinate_raw: String = row.get(1)?;
    let classification_raw: String = row.get(2)?;
    let payload: Vec<u8> = row.get(3)?;
    let parent_raw: Option<String> = row.get(4)?;

    Ok(Record {
        address: parse_address(&address_raw)?,
        coordinate: parse_coordinate(&coordinate_raw)?,
        classification: Classification::parse(&classification_raw)
            .ok_or_else(|| anyhow!("unknown classification: {classification_raw}"))?,
        payload: Payload::new(payload),
        parent: parent_raw.as_deref().map(parse_address).transpose()?,
        owner: row.get(5)?,
        signature: row.get(6)?,
    })
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::parse(raw).with_context(|| format!("invalid stored address: {raw}"))
}

fn parse_coordinate(raw: &str) -> Result<Coordinate> {
    serde_json::from_str(raw).context("failed to decode stored coordinate")
}

fn schema_status_on(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
    })
}

fn migrate_on(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let current = current_schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
        ));
    }

    for (version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        let tx = conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version}"))?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit()
            .with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied schema migration");
    }

    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [RECORDS_FILE, AUDIT_EVENTS_FILE, BOUNDARY_REPAIRS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use stat7_core::{
        AuditAction, AuditResult, BoundaryValidator, CancellationToken, EntanglementDetector,
        SweepOptions,
    };
    use ulid::Ulid;

    fn memory_store() -> Result<SqliteStore> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_record(payload: &str, luminosity: f64) -> Result<Record> {
        Record::new(
            Coordinate::genesis(Realm::Data, luminosity, 3).with_polarity([0.4, 0.2, -0.1, 0.0, 0.0, 0.0, 0.0]),
            Payload::from(payload),
            Classification::Sensitive,
        )
        .map(|record| record.with_owner("alice"))
        .map_err(|err| anyhow!("fixture record failed: {err}"))
    }

    fn cleanup_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_is_idempotent_and_reports_latest_version() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-012
    #[test]
    fn audit_ledger_is_detected_on_partially_migrated_database() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        assert!(!store.has_audit_ledger()?);

        {
            let conn = store.conn()?;
            conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
            conn.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&conn, 1)?;
        }
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(store.has_audit_ledger()?);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn put_and_get_round_trip_preserves_record() -> Result<()> {
        let store = memory_store()?;
        let record = mk_record("hello", 0.5)?;
        assert_eq!(store.put_record(&record)?, PutOutcome::Inserted);
        assert_eq!(store.put_record(&record)?, PutOutcome::AlreadyPresent);

        let loaded = store
            .get_record(&record.address)?
            .ok_or_else(|| anyhow!("record missing after insert"))?;
        assert_eq!(loaded, record);
        assert_eq!(store.list_records(&RecordQuery::default())?.len(), 1);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn conflicting_content_under_same_address_is_rejected() -> Result<()> {
        let store = memory_store()?;
        let record = mk_record("hello", 0.5)?;
        store.put_record(&record)?;

        let mut reclassified = record.clone();
        reclassified.classification = Classification::Public;
        let Err(err) = store.put_record(&reclassified) else {
            return Err(anyhow!("expected duplicate address conflict"));
        };
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::DuplicateAddressConflict {
                address: record.address.clone()
            })
        );

        let mut tampered = record.clone();
        tampered.payload = Payload::from("tampered");
        assert!(matches!(
            RecordStore::put(&store, &tampered),
            Err(StoreError::Integrity(_))
        ));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn sqlite_checks_reject_out_of_range_rows() -> Result<()> {
        let store = memory_store()?;
        let conn = store.conn()?;
        let result = conn.execute(
            "INSERT INTO records(
                address, realm, lineage, horizon, luminosity, dimensionality, coordinate_json,
                classification, payload, created_at
            ) VALUES (?1, 'data', 0, 'genesis', 1.5, 3, '{}', 'PUBLIC', x'00', '2026-01-01T00:00:00Z')",
            params!["a".repeat(64)],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn audit_events_are_append_only() -> Result<()> {
        let store = memory_store()?;
        let event = AuditEvent::new(
            AuditAction::Recover,
            "b".repeat(64),
            "alice",
            AuditResult::Success,
            "released",
        );
        AuditLedger::append(&store, &event)?;
        assert_eq!(AuditLedger::events(&store)?, vec![event.clone()]);

        let conn = store.conn()?;
        let update = conn.execute("UPDATE audit_events SET requester_id = 'mallory'", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM audit_events", []);
        assert!(delete.is_err());
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn repair_is_stored_with_record_atomically() -> Result<()> {
        let store = memory_store()?;
        let parent = mk_record("parent", 0.8)?;
        store.put_record(&parent)?;

        let rule = DerivationRule::Compaction {
            target_luminosity: 0.4,
        };
        let mut child = parent
            .derive(rule, Some(Payload::from("child")))
            .map_err(|err| anyhow!("derive failed: {err}"))?;
        child.coordinate.luminosity = 0.95;
        let admission = BoundaryValidator::default()
            .admit_derived(child.coordinate.clone(), &parent.coordinate, &parent.address, rule)
            .map_err(|err| anyhow!("admission failed: {err}"))?;
        let event = admission
            .repair_event()
            .cloned()
            .ok_or_else(|| anyhow!("expected repair"))?;

        let repaired = Record::new(admission.into_coordinate(), child.payload.clone(), child.classification)
            .map_err(|err| anyhow!("repaired record failed: {err}"))?
            .with_parent(&parent)
            .map_err(|err| anyhow!("parent link failed: {err}"))?;
        store.put_record_with_repair(&repaired, Some(&event))?;

        let repairs = store.list_repairs(Some(&repaired.address))?;
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].event, event);
        assert!(store.list_repairs(Some(&parent.address))?.is_empty());
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn sweep_edges_persist_and_filter_by_address() -> Result<()> {
        let store = memory_store()?;
        for index in 0..6 {
            store.put_record(&mk_record(&format!("edge-{index}"), 0.5)?)?;
        }
        let report = stat7_core::sweep(
            &store.coordinates()?,
            &EntanglementDetector::default(),
            0.85,
            SweepOptions::default(),
            &CancellationToken::new(),
        );
        assert_eq!(report.edges.len(), 15);
        assert_eq!(store.save_edges(&report.edges, report.threshold)?, 15);
        assert_eq!(store.save_edges(&report.edges, report.threshold)?, 15);

        let all = store.list_edges(None)?;
        assert_eq!(all, report.edges);
        let touching = store.list_edges(Some(&all[0].source))?;
        assert_eq!(touching.len(), 5);
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let source = memory_store()?;
        let record = mk_record("exported", 0.5)?;
        source.put_record(&record)?;
        source.append_audit_event(&AuditEvent::new(
            AuditAction::Recover,
            record.address.to_string(),
            "alice",
            AuditResult::Denied,
            "no intent",
        ))?;

        let export_dir = std::env::temp_dir().join(format!("stat7-export-{}", Ulid::new()));
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 3);
        assert!(export_dir.join(RECORDS_FILE).exists());

        let target = SqliteStore::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir, true)?;
        assert_eq!(summary.imported_records, 1);
        assert_eq!(summary.imported_audit_events, 1);
        assert_eq!(target.get_record(&record.address)?, Some(record));

        let again = target.import_snapshot(&export_dir, true)?;
        assert_eq!(again.skipped_existing_records, 1);
        assert_eq!(again.skipped_existing_audit_events, 1);

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        use std::io::Write as _;

        let source = memory_store()?;
        source.put_record(&mk_record("tamper", 0.5)?)?;
        let export_dir = std::env::temp_dir().join(format!("stat7-export-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;

        let mut tampered = fs::OpenOptions::new()
            .append(true)
            .open(export_dir.join(RECORDS_FILE))?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let target = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir, true) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for records.ndjson"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-010
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let source = memory_store()?;
        let record = mk_record("backup", 0.5)?;
        source.put_record(&record)?;

        let backup_file =
            std::env::temp_dir().join(format!("stat7-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.get_record(&record.address)?, Some(record));

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-011
    #[test]
    fn integrity_check_flags_tampered_rows() -> Result<()> {
        let store = memory_store()?;
        let record = mk_record("integrity", 0.5)?;
        store.put_record(&record)?;

        let clean = store.integrity_check()?;
        assert!(clean.quick_check_ok);
        assert!(clean.foreign_key_violations.is_empty());
        assert!(clean.address_mismatches.is_empty());
        assert_eq!(clean.schema_status.current_version, LATEST_SCHEMA_VERSION);

        store.conn()?.execute(
            "UPDATE records SET payload = x'00' WHERE address = ?1",
            params![record.address.as_str()],
        )?;
        let dirty = store.integrity_check()?;
        assert_eq!(dirty.address_mismatches, vec![record.address.to_string()]);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_puts_across_connections_store_each_address_once() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("stat7-concurrency-{}.sqlite3", Ulid::new()));
        SqliteStore::open(&db_path)?.migrate()?;

        let shared = mk_record("shared", 0.5)?;
        let mut handles = Vec::new();
        for worker in 0..4 {
            let path = db_path.clone();
            let shared = shared.clone();
            handles.push(thread::spawn(move || -> Result<usize> {
                let store = SqliteStore::open(&path)?;
                let mut inserted = 0;
                if store.put_record(&shared)? == PutOutcome::Inserted {
                    inserted += 1;
                }
                for index in 0..10 {
                    store.put_record(&mk_record(&format!("worker-{worker}-{index}"), 0.5)?)?;
                }
                Ok(inserted)
            }));
        }

        let mut shared_inserts = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            shared_inserts += thread_result?;
        }
        assert_eq!(shared_inserts, 1);

        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.list_records(&RecordQuery::default())?.len(), 41);
        assert!(store.integrity_check()?.quick_check_ok);
        drop(store);
        cleanup_sqlite_files(&db_path)
    }
}
