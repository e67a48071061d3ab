use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::channel::{ChannelError, ChannelKind, NotificationChannel};
use super::event::AlertEvent;

pub const DEFAULT_DASHBOARD_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("io error at {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardAlertRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub payload: AlertEvent,
}

impl DashboardAlertRecord {
    fn from_event(event: AlertEvent) -> Self {
        let event = event.stamped();
        let timestamp = event.timestamp.unwrap_or_else(Utc::now);
        Self {
            id: format!("{}_{}", event.data_source, timestamp.timestamp()),
            timestamp,
            acknowledged: false,
            acknowledged_at: None,
            payload: event,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    pub acknowledged: usize,
    pub unacknowledged: usize,
}

/// Most recent alerts kept for the operator dashboard, oldest evicted first.
/// Ids are `{data_source}_{unix_seconds}` and may collide; lookups take the
/// first match.
#[derive(Debug)]
pub struct DashboardAlertStore {
    capacity: usize,
    records: Mutex<VecDeque<DashboardAlertRecord>>,
    snapshot_path: Option<PathBuf>,
}

impl Default for DashboardAlertStore {
    fn default() -> Self {
        Self::new(DEFAULT_DASHBOARD_CAPACITY)
    }
}

impl DashboardAlertStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            snapshot_path: None,
        }
    }

    /// Store backed by a JSON snapshot, reloaded here and rewritten after
    /// every mutation.
    pub fn open(capacity: usize, snapshot_path: impl AsRef<Path>) -> Result<Self, DashboardError> {
        let path = snapshot_path.as_ref().to_path_buf();
        let mut store = Self::new(capacity);
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| DashboardError::Io {
                source,
                path: path.clone(),
            })?;
            let mut records: VecDeque<DashboardAlertRecord> = if content.trim().is_empty() {
                VecDeque::new()
            } else {
                serde_json::from_str(&content)?
            };
            while records.len() > store.capacity {
                records.pop_front();
            }
            store.records = Mutex::new(records);
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DashboardError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        store.snapshot_path = Some(path);
        Ok(store)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, event: AlertEvent) -> DashboardAlertRecord {
        let record = DashboardAlertRecord::from_event(event);
        let mut guard = self.lock();
        guard.push_back(record.clone());
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        self.persist(&guard);
        record
    }

    /// Newest first by timestamp; records sharing a timestamp keep newest
    /// insertion first.
    pub fn get_recent(&self, limit: usize) -> Vec<DashboardAlertRecord> {
        let mut records: Vec<DashboardAlertRecord> = self.lock().iter().rev().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut guard = self.lock();
        let Some(record) = guard.iter_mut().find(|record| record.id == id) else {
            return false;
        };
        record.acknowledged = true;
        record.acknowledged_at = Some(Utc::now());
        self.persist(&guard);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> DashboardStats {
        let guard = self.lock();
        let acknowledged = guard.iter().filter(|record| record.acknowledged).count();
        DashboardStats {
            total: guard.len(),
            acknowledged,
            unacknowledged: guard.len() - acknowledged,
        }
    }

    /// Rewrites the snapshot through a temp file and rename. Callers hold the
    /// records lock so writes land in mutation order.
    fn persist(&self, records: &VecDeque<DashboardAlertRecord>) {
        let Some(path) = self.snapshot_path.as_ref() else {
            return;
        };
        let json = match serde_json::to_string_pretty(records) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize dashboard snapshot");
                return;
            }
        };
        let temp_path = path.with_extension("tmp");
        let written = fs::write(&temp_path, json).and_then(|()| fs::rename(&temp_path, path));
        if let Err(err) = written {
            warn!(path = %path.display(), error = %err, "failed to write dashboard snapshot");
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DashboardAlertRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The always-present channel: records every alert in the dashboard store.
#[derive(Debug, Clone)]
pub struct DashboardChannel {
    store: Arc<DashboardAlertStore>,
}

impl DashboardChannel {
    pub fn new(store: Arc<DashboardAlertStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DashboardAlertStore> {
        &self.store
    }
}

#[async_trait]
impl NotificationChannel for DashboardChannel {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Dashboard
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        self.store.append(event.clone());
        Ok(())
    }
}
