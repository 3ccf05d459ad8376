//! Discovery store for independently launched workers
//!
//! The coordinator writes one line per worker telling it which leaf of the
//! tree to attach to:
//!
//! ```text
//! <host> <port> <parent-rank> <worker-rank>
//! ```
//!
//! Workers read the file until their rank shows up. The coordinator may still
//! be writing it when workers start, so a missing file or a missing rank is
//! retried after a fixed idle interval; a malformed line is not.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{AttachPoint, Rank};

/// Default number of attempts before giving up on the store
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Default idle interval between attempts
pub const DEFAULT_IDLE: Duration = Duration::from_secs(10);

/// Errors reading or writing the discovery store
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Cannot access connections file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed line {line} in {path}: {reason}")]
    Parse { path: PathBuf, line: usize, reason: String },

    #[error("Worker {rank} not found in the connections file after {attempts} attempts")]
    NotFound { rank: u32, attempts: u32 },

    #[error("Connections file lists {found} workers, expected {expected} (after {attempts} attempts)")]
    CountMismatch {
        found: usize,
        expected: usize,
        attempts: u32,
    },

    #[error("Transport reports no leaf attach points")]
    NoLeaves,

    #[error("No scatter entry for worker {0}")]
    NoEntry(usize),
}

/// Where one worker attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub host: String,
    pub port: u16,
    pub parent_rank: Rank,
    pub worker_rank: u32,
}

impl DiscoveryRecord {
    /// The leaf this worker attaches to
    pub fn attach_point(&self) -> AttachPoint {
        AttachPoint {
            host: self.host.clone(),
            port: self.port,
            rank: self.parent_rank,
        }
    }

    /// Serialize as one store line (without the newline)
    pub fn to_line(&self) -> String {
        format!("{} {} {} {}", self.host, self.port, self.parent_rank, self.worker_rank)
    }

    /// Parse one store line; exactly four whitespace-separated fields
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        }
        let port = fields[1]
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}'", fields[1]))?;
        let parent_rank = fields[2]
            .parse::<Rank>()
            .map_err(|_| format!("invalid parent rank '{}'", fields[2]))?;
        let worker_rank = fields[3]
            .parse::<u32>()
            .map_err(|_| format!("invalid worker rank '{}'", fields[3]))?;
        Ok(Self {
            host: fields[0].to_string(),
            port,
            parent_rank,
            worker_rank,
        })
    }
}

/// Bounded polling: `max_retries` attempts, `idle` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub idle: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            idle: DEFAULT_IDLE,
        }
    }
}

/// Assign `num_workers` ranks to leaves in rank order, `ceil(n / leaves)` per leaf
pub fn partition(num_workers: u32, leaves: &[AttachPoint]) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
    debug!(num_workers, num_leaves = leaves.len(), "partition: called");
    if leaves.is_empty() {
        return Err(DiscoveryError::NoLeaves);
    }
    let per_leaf = num_workers.div_ceil(leaves.len() as u32).max(1);
    let records = (0..num_workers)
        .map(|rank| {
            let leaf = &leaves[((rank / per_leaf) as usize).min(leaves.len() - 1)];
            DiscoveryRecord {
                host: leaf.host.clone(),
                port: leaf.port,
                parent_rank: leaf.rank,
                worker_rank: rank,
            }
        })
        .collect();
    Ok(records)
}

/// Connection data flattened for scatter-style distribution
///
/// Entry `i` occupies `data[displs[i]..displs[i] + counts[i]]`, including a
/// trailing NUL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterBuffer {
    pub data: Vec<u8>,
    pub counts: Vec<usize>,
    pub displs: Vec<usize>,
}

impl ScatterBuffer {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn push(&mut self, line: &str) {
        self.displs.push(self.data.len());
        self.counts.push(line.len() + 1);
        self.data.extend_from_slice(line.as_bytes());
        self.data.push(0);
    }

    /// Decode the record handed to worker `index`
    pub fn record(&self, index: usize) -> Result<DiscoveryRecord, DiscoveryError> {
        let (start, count) = match (self.displs.get(index), self.counts.get(index)) {
            (Some(start), Some(count)) if *count > 0 => (*start, *count),
            _ => return Err(DiscoveryError::NoEntry(index)),
        };
        let bytes = self
            .data
            .get(start..start + count - 1)
            .ok_or(DiscoveryError::NoEntry(index))?;
        let line = String::from_utf8_lossy(bytes);
        DiscoveryRecord::parse_line(&line).map_err(|reason| DiscoveryError::Parse {
            path: PathBuf::from("<scatter>"),
            line: index + 1,
            reason,
        })
    }
}

/// File-backed rank to attach-point mapping
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl DiscoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Write every record, replacing the file in one step
    pub fn write(&self, records: &[DiscoveryRecord]) -> Result<(), DiscoveryError> {
        debug!(path = %self.path.display(), count = records.len(), "DiscoveryStore::write: called");
        let io_err = |source| DiscoveryError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        for record in records {
            info!(
                worker = record.worker_rank,
                host = %record.host,
                port = record.port,
                parent = record.parent_rank,
                "Worker will attach to leaf"
            );
            writeln!(file, "{}", record.to_line()).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Partition `num_workers` across `leaves` and write the result
    pub fn write_partition(
        &self,
        num_workers: u32,
        leaves: &[AttachPoint],
    ) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
        let records = partition(num_workers, leaves)?;
        self.write(&records)?;
        Ok(records)
    }

    /// One pass over the store; `Ok(None)` when the rank is absent
    pub fn scan(&self, rank: u32) -> Result<Option<DiscoveryRecord>, DiscoveryError> {
        let file = fs::File::open(&self.path).map_err(|source| DiscoveryError::Io {
            path: self.path.clone(),
            source,
        })?;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| DiscoveryError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = DiscoveryRecord::parse_line(&line).map_err(|reason| DiscoveryError::Parse {
                path: self.path.clone(),
                line: index + 1,
                reason,
            })?;
            if record.worker_rank == rank {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Find `rank`, retrying while the file is missing or incomplete
    pub async fn lookup(&self, rank: u32) -> Result<DiscoveryRecord, DiscoveryError> {
        debug!(rank, path = %self.path.display(), "DiscoveryStore::lookup: called");
        let mut attempts = 0;
        while attempts < self.retry.max_retries {
            attempts += 1;
            match self.scan(rank) {
                Ok(Some(record)) => {
                    debug!(rank, attempts, "DiscoveryStore::lookup: found");
                    return Ok(record);
                }
                Ok(None) => {
                    warn!(rank, path = %self.path.display(), "Rank not in connections file yet");
                }
                Err(DiscoveryError::Io { source, .. }) => {
                    warn!(rank, path = %self.path.display(), error = %source, "Cannot open connections file");
                }
                Err(e) => return Err(e),
            }
            if attempts < self.retry.max_retries {
                warn!(
                    "Did the coordinator finish writing the connections file? Retrying in {:?}...",
                    self.retry.idle
                );
                tokio::time::sleep(self.retry.idle).await;
            }
        }
        Err(DiscoveryError::NotFound { rank, attempts })
    }

    /// Read the whole store into a scatter buffer holding exactly `world_size` entries
    pub async fn serialize_for_scatter(&self, world_size: usize) -> Result<ScatterBuffer, DiscoveryError> {
        debug!(world_size, path = %self.path.display(), "DiscoveryStore::serialize_for_scatter: called");
        let mut attempts = 0;
        let mut found = 0;
        while attempts < self.retry.max_retries {
            attempts += 1;
            match fs::read_to_string(&self.path) {
                Ok(content) => {
                    let mut buffer = ScatterBuffer::default();
                    for line in content.lines().filter(|l| !l.trim().is_empty()) {
                        buffer.push(line);
                    }
                    if buffer.len() == world_size {
                        return Ok(buffer);
                    }
                    found = buffer.len();
                    warn!(found, expected = world_size, "Unexpected number of workers in connections file");
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Cannot open connections file");
                }
            }
            if attempts < self.retry.max_retries {
                tokio::time::sleep(self.retry.idle).await;
            }
        }
        Err(DiscoveryError::CountMismatch {
            found,
            expected: world_size,
            attempts,
        })
    }
}
