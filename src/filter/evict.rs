//! Filter eviction
//!
//! Filters are ranked by modification time, newest first. The most recent
//! `keep_recent` survive; after that a filter survives only while it stays
//! within the generation or age window of the last survivor.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use super::errors::MaterializeResult;
use super::paths::{remove_quietly, FilterEntry, FilterPaths};
use crate::config::IndexConfig;

/// Which filters eviction keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub keep_recent: usize,
    pub generation_window: u64,
    pub age_window: Duration,
}

/// What one eviction pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    pub stale_temps: usize,
}

impl EvictionPolicy {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            keep_recent: config.evict_keep_recent,
            generation_window: config.evict_keep_generation_window,
            age_window: config.evict_keep_age(),
        }
    }

    /// Split entries into (kept, victims)
    pub fn select(&self, mut entries: Vec<FilterEntry>) -> (Vec<FilterEntry>, Vec<FilterEntry>) {
        entries.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.generation.cmp(&a.generation))
        });

        let mut kept: Vec<FilterEntry> = Vec::new();
        let mut victims = Vec::new();
        for entry in entries {
            let keep = kept.len() < self.keep_recent
                || kept.last().is_some_and(|last| self.near(last, &entry));
            if keep {
                kept.push(entry);
            } else {
                victims.push(entry);
            }
        }
        (kept, victims)
    }

    fn near(&self, kept: &FilterEntry, entry: &FilterEntry) -> bool {
        if kept.generation.abs_diff(entry.generation) <= self.generation_window {
            return true;
        }
        let age = kept
            .modified
            .duration_since(entry.modified)
            .unwrap_or(Duration::ZERO);
        age <= self.age_window
    }
}

/// Delete evicted filters and abandoned build files.
///
/// Build files count as abandoned after `temp_age`. Readers holding an
/// evicted filter open keep reading it until they close it.
pub fn evict(
    paths: &FilterPaths,
    policy: &EvictionPolicy,
    temp_age: Duration,
) -> MaterializeResult<EvictionReport> {
    let (kept, victims) = policy.select(paths.list()?);

    let mut report = EvictionReport {
        kept: kept.len(),
        ..EvictionReport::default()
    };
    for victim in victims {
        debug!(csid = %victim.csid, generation = victim.generation, "evicting state filter");
        remove_quietly(&victim.path);
        report.removed.push(victim.path);
    }
    for temp in paths.stale_temps(temp_age) {
        remove_quietly(&temp);
        report.stale_temps += 1;
    }

    info!(
        kept = report.kept,
        removed = report.removed.len(),
        stale_temps = report.stale_temps,
        "filter eviction finished"
    );
    Ok(report)
}
