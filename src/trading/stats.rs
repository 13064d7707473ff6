//! Lifecycle statistics
//! Counters fed by position events

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::trading::position::{PositionEvent, PositionEventKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub start_time: String,
    pub entries: u64,
    pub exits: u64,
    pub entry_cancels: u64,
    pub exit_cancels: u64,
    pub last_update: String,
}

impl LifecycleStats {
    /// Create new stats with current time
    pub fn new() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_update: now,
            ..Self::default()
        }
    }

    pub fn record(&mut self, event: &PositionEvent) {
        match event.kind {
            PositionEventKind::Entered => self.entries += 1,
            PositionEventKind::Exited => self.exits += 1,
            PositionEventKind::EntryCanceled => self.entry_cancels += 1,
            PositionEventKind::ExitCanceled => self.exit_cancels += 1,
        }
        self.last_update = event.time.to_rfc3339();
    }

    /// Positions entered and not yet exited
    pub fn open_positions(&self) -> u64 {
        self.entries.saturating_sub(self.exits)
    }

    /// Get summary
    pub fn summary(&self) -> String {
        format!(
            "Stats: entries={}, exits={}, entry cancels={}, exit cancels={}, open={}",
            self.entries,
            self.exits,
            self.entry_cancels,
            self.exit_cancels,
            self.open_positions()
        )
    }

    /// Save stats to file, owner-only on Unix
    pub fn save_to_file(&self, filepath: &Path) -> anyhow::Result<()> {
        if let Some(parent) = filepath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(filepath, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(filepath)?.permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(filepath, permissions)?;
        }

        Ok(())
    }
}

/// Count every event from `events` into `stats` until the position is dropped
pub fn track(
    mut events: broadcast::Receiver<PositionEvent>,
    stats: Arc<Mutex<LifecycleStats>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    stats.lock().unwrap_or_else(PoisonError::into_inner).record(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Stats tracker lagged, {} position events not counted", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
