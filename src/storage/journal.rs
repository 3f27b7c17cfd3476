use crate::config::Config;
use crate::error::{Error, Result};
use crate::replay::replay_entries;
use crate::state::LedgerState;
use crate::storage::Record;
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Durability sink behind a `TableStore`.
pub trait Journal: Send {
    /// Persist one commit's records before it is acknowledged.
    fn append(&mut self, records: &[Record]) -> Result<()>;

    /// Called with the post-commit state; backends may snapshot here.
    fn after_commit(&mut self, _state: &LedgerState) -> Result<()> {
        Ok(())
    }
}

/// Journal that keeps nothing (in-memory store).
#[derive(Debug, Clone, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&mut self, _records: &[Record]) -> Result<()> {
        Ok(())
    }
}

/// File-based journal using an append-only log and periodic snapshots.
///
/// Files:
/// - `journal.log`: one entry per commit, `[len: u64 LE][bincode Vec<Record>]`
/// - `snapshot.bin`: bincode `LedgerState` followed by the journal entry count it covers
/// - `snapshot.bin.tmp`: temporary file for atomic snapshot writes
/// - `ledger.lock`: exclusively locked while a process has the journal open
pub struct FileJournal {
    journal_path: PathBuf,
    snapshot_path: PathBuf,
    snapshot_tmp_path: PathBuf,
    lock_path: PathBuf,
    snapshot_every: u64,
    entries: u64,
    since_snapshot: u64,

    /// Released when the journal is dropped
    lock: Option<File>,
}

impl FileJournal {
    /// Create a FileJournal with paths from config
    pub fn new(config: &Config) -> Self {
        FileJournal::with_paths(
            config.get_journal_path(),
            config.get_snapshot_path(),
            config.snapshot_every,
        )
    }

    /// Create FileJournal with custom paths (for testing)
    pub fn with_paths(journal_path: PathBuf, snapshot_path: PathBuf, snapshot_every: u64) -> Self {
        let snapshot_tmp_path = snapshot_path.with_extension("bin.tmp");
        let lock_path = journal_path.with_file_name("ledger.lock");
        FileJournal {
            journal_path,
            snapshot_path,
            snapshot_tmp_path,
            lock_path,
            snapshot_every,
            entries: 0,
            since_snapshot: 0,
            lock: None,
        }
    }

    /// Number of commits in the journal.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.journal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::StorageError(format!("Failed to create data directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// Take the data directory for this process.
    ///
    /// Every process replays its own copy of the tables, so two writers on one
    /// directory would each accept writes the other never sees.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        self.ensure_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::StorageError(format!("Failed to open lock file: {}", e)))?;
        let acquired = FileExt::try_lock_exclusive(&file)
            .map_err(|e| Error::StorageError(format!("Failed to lock data directory: {}", e)))?;
        if !acquired {
            let dir = self
                .lock_path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(Error::DataDirLocked(dir));
        }
        debug!(path = %self.lock_path.display(), "locked data directory");
        self.lock = Some(file);
        Ok(())
    }

    /// Rebuild state: load the snapshot (if any) and replay the journal after it.
    pub fn recover(&mut self) -> Result<LedgerState> {
        let (snapshot, covered) = self.load_snapshot()?.unwrap_or_default();
        let (entries, total) = self.load_entries_from(covered)?;
        if total < covered {
            return Err(Error::StorageError(format!(
                "Snapshot covers {} journal entries but journal holds {}",
                covered, total
            )));
        }
        let replayed = entries.len();
        let state = replay_entries(snapshot, entries);
        self.entries = total;
        self.since_snapshot = total - covered;
        debug!(covered, replayed, "recovered ledger state from journal");
        Ok(state)
    }

    /// Load the latest snapshot with the number of journal entries it covers.
    ///
    /// Returns `None` if no snapshot exists (genesis state).
    pub fn load_snapshot(&self) -> Result<Option<(LedgerState, u64)>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| Error::StorageError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| Error::StorageError(format!("Failed to read snapshot: {}", e)))?;

        // Format: [LedgerState bytes][entries: u64]
        if data.len() < 8 {
            return Err(Error::StorageError("Snapshot file too short".to_string()));
        }

        let (state_bytes, count_bytes) = data.split_at(data.len() - 8);
        let mut count = [0u8; 8];
        count.copy_from_slice(count_bytes);
        let covered = u64::from_le_bytes(count);

        let state: LedgerState = bincode::deserialize(state_bytes)
            .map_err(|e| Error::StorageError(format!("Failed to deserialize snapshot: {}", e)))?;

        Ok(Some((state, covered)))
    }

    /// Persist a snapshot atomically (write to temp file, fsync, rename, fsync dir)
    pub fn persist_snapshot(&mut self, state: &LedgerState, covered: u64) -> Result<()> {
        self.ensure_dir()?;

        let state_bytes = bincode::serialize(state)
            .map_err(|e| Error::StorageError(format!("Failed to serialize snapshot: {}", e)))?;

        let mut file = File::create(&self.snapshot_tmp_path).map_err(|e| {
            Error::StorageError(format!("Failed to create temp snapshot file: {}", e))
        })?;
        file.write_all(&state_bytes)
            .map_err(|e| Error::StorageError(format!("Failed to write snapshot: {}", e)))?;
        file.write_all(&covered.to_le_bytes())
            .map_err(|e| Error::StorageError(format!("Failed to write snapshot position: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::StorageError(format!("Failed to fsync temp snapshot: {}", e)))?;
        drop(file);

        fs::rename(&self.snapshot_tmp_path, &self.snapshot_path)
            .map_err(|e| Error::StorageError(format!("Failed to rename temp snapshot: {}", e)))?;

        if let Some(parent) = self.snapshot_path.parent() {
            let parent_file = File::open(parent).map_err(|e| {
                Error::StorageError(format!("Failed to open parent directory: {}", e))
            })?;
            parent_file.sync_all().map_err(|e| {
                Error::StorageError(format!("Failed to fsync parent directory: {}", e))
            })?;
        }

        self.since_snapshot = 0;
        debug!(covered, "wrote ledger snapshot");
        Ok(())
    }

    /// Load entries from position `from` (inclusive). Also returns the total entry count.
    ///
    /// A partially written final entry (crash mid-append) is cut off so later
    /// appends start on a clean boundary.
    pub fn load_entries_from(&self, from: u64) -> Result<(Vec<Vec<Record>>, u64)> {
        if !self.journal_path.exists() {
            return Ok((Vec::new(), 0));
        }

        let file = File::open(&self.journal_path)
            .map_err(|e| Error::StorageError(format!("Failed to open journal: {}", e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| Error::StorageError(format!("Failed to stat journal: {}", e)))?
            .len();
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut current = 0u64;
        let mut good_offset = 0u64;

        loop {
            let mut len_buf = [0u8; 8];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(Error::StorageError(format!("Failed to read journal: {}", e)));
                }
            }
            let len = u64::from_le_bytes(len_buf);
            // A corrupt length prefix reads as a torn tail
            let end = match good_offset.checked_add(8).and_then(|o| o.checked_add(len)) {
                Some(end) if end <= file_len => end,
                _ => break,
            };
            let mut buf = vec![0u8; len as usize];
            reader
                .read_exact(&mut buf)
                .map_err(|e| Error::StorageError(format!("Failed to read journal entry: {}", e)))?;

            if current >= from {
                let records: Vec<Record> = bincode::deserialize(&buf).map_err(|e| {
                    Error::StorageError(format!("Failed to deserialize journal entry: {}", e))
                })?;
                entries.push(records);
            }
            current += 1;
            good_offset = end;
        }

        if good_offset < file_len {
            warn!(
                good_offset,
                file_len, "truncating partially written journal entry"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.journal_path)
                .map_err(|e| Error::StorageError(format!("Failed to open journal: {}", e)))?;
            file.set_len(good_offset)
                .map_err(|e| Error::StorageError(format!("Failed to truncate journal: {}", e)))?;
        }

        Ok((entries, current))
    }
}

impl Journal for FileJournal {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        self.ensure_dir()?;

        let bytes = bincode::serialize(records)
            .map_err(|e| Error::StorageError(format!("Failed to serialize journal entry: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| Error::StorageError(format!("Failed to open journal for append: {}", e)))?;

        // Length prefix and payload in one write so a crash leaves at most one torn entry
        let mut frame = Vec::with_capacity(8 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        frame.extend_from_slice(&bytes);
        file.write_all(&frame)
            .map_err(|e| Error::StorageError(format!("Failed to write journal entry: {}", e)))?;

        file.sync_all()
            .map_err(|e| Error::StorageError(format!("Failed to fsync journal: {}", e)))?;

        self.entries += 1;
        self.since_snapshot += 1;
        Ok(())
    }

    fn after_commit(&mut self, state: &LedgerState) -> Result<()> {
        if self.snapshot_every > 0 && self.since_snapshot >= self.snapshot_every {
            let covered = self.entries;
            self.persist_snapshot(state, covered)?;
        }
        Ok(())
    }
}
