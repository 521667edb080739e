use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use stat7_core::{AuditEvent, AuditLedger, LedgerError};

/// Append-only JSON-lines audit ledger. Appends are serialized through one
/// file handle and fsynced before `append` returns.
#[derive(Debug)]
pub struct JsonlAuditLedger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLedger {
    /// # Errors
    /// Returns `LedgerError::Io` when the file or its parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                LedgerError::Io(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| LedgerError::Io(format!("failed to open {}: {err}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLedger for JsonlAuditLedger {
    fn append(&self, event: &AuditEvent) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(event)
            .map_err(|err| LedgerError::Serialization(err.to_string()))?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| LedgerError::Backend("audit ledger lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|err| LedgerError::Io(err.to_string()))?;
        file.sync_data()
            .map_err(|err| LedgerError::Io(err.to_string()))?;
        Ok(())
    }

    fn events(&self) -> Result<Vec<AuditEvent>, LedgerError> {
        let file = File::open(&self.path)
            .map_err(|err| LedgerError::Io(format!("failed to open {}: {err}", self.path.display())))?;
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| LedgerError::Io(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|err| LedgerError::Corrupted {
                line: index + 1,
                detail: err.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use stat7_core::{AuditAction, AuditResult};
    use ulid::Ulid;

    use super::*;

    fn temp_ledger_path() -> PathBuf {
        std::env::temp_dir().join(format!("stat7-ledger-{}.jsonl", Ulid::new()))
    }

    fn event(requester: &str) -> AuditEvent {
        AuditEvent::new(
            AuditAction::Recover,
            "c".repeat(64),
            requester,
            AuditResult::Success,
            "released",
        )
    }

    // Test IDs: TLED-001
    #[test]
    fn appended_events_survive_reopen() -> Result<(), LedgerError> {
        let path = temp_ledger_path();
        {
            let ledger = JsonlAuditLedger::open(&path)?;
            ledger.append(&event("alice"))?;
            ledger.append(&event("bob"))?;
        }
        let reopened = JsonlAuditLedger::open(&path)?;
        reopened.append(&event("carol"))?;
        let requesters = reopened
            .events()?
            .into_iter()
            .map(|event| event.requester_id)
            .collect::<Vec<_>>();
        assert_eq!(requesters, vec!["alice", "bob", "carol"]);
        let _ = fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TLED-002
    #[test]
    fn concurrent_appends_do_not_interleave() -> Result<(), LedgerError> {
        let path = temp_ledger_path();
        let ledger = Arc::new(JsonlAuditLedger::open(&path)?);
        let handles = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for index in 0..25 {
                        ledger.append(&event(&format!("worker-{worker}-{index}")))?;
                    }
                    Ok::<(), LedgerError>(())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => panic!("ledger thread panicked"),
            }
        }
        assert_eq!(ledger.events()?.len(), 200);
        let _ = fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TLED-003
    #[test]
    fn corrupted_line_is_reported_with_position() -> Result<(), LedgerError> {
        let path = temp_ledger_path();
        let ledger = JsonlAuditLedger::open(&path)?;
        ledger.append(&event("alice"))?;
        {
            let mut raw = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|err| LedgerError::Io(err.to_string()))?;
            raw.write_all(b"{not json\n")
                .map_err(|err| LedgerError::Io(err.to_string()))?;
        }
        match ledger.events() {
            Err(LedgerError::Corrupted { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption at line 2, got {other:?}"),
        }
        let _ = fs::remove_file(&path);
        Ok(())
    }
}
