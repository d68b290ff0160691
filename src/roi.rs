//! Versioned ownership of one region: identity, edit history, rollback.
use log::debug;

use crate::optimizer::Optimizer;
use crate::region::Region;

/// One entry of a region's edit history: a human-readable reason and the
/// full region state after that edit took effect
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub reason: String,
    pub region: Region,
}

/// Wraps one [`Region`] with an append-only snapshot log.
///
/// Every mutation goes through [`RegionManager::modify_region`], which
/// records the new state with a reason; [`RegionManager::rollback`] restores
/// any recorded state and discards everything after it. The manager's
/// numeric identity is the region's current left edge.
#[derive(Debug, Clone)]
pub struct RegionManager {
    region: Region,
    history: Vec<HistoryEntry>,
}

impl RegionManager {
    pub fn new(region: Region) -> Self {
        let history = vec![HistoryEntry {
            reason: "Created".to_string(),
            region: region.clone(),
        }];
        Self { region, history }
    }

    /// The externally-visible identity: the region's left edge bin
    pub fn id(&self) -> f64 {
        self.region.left()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn peak_count(&self) -> usize {
        self.region.peak_count()
    }

    pub fn contains(&self, peak_id: f64) -> bool {
        self.region.contains(peak_id)
    }

    /// Install a new region state, recording it in history with a reason
    pub fn modify_region(&mut self, region: Region, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("region {}: {reason}", self.id());
        self.history.push(HistoryEntry {
            reason,
            region: region.clone(),
        });
        self.region = region;
    }

    /// Restore the state recorded at history index `point`, discarding all
    /// later entries. Fails when `point` is out of range.
    pub fn rollback(&mut self, point: usize) -> bool {
        if point >= self.history.len() {
            return false;
        }
        self.region = self.history[point].region.clone();
        self.history.truncate(point + 1);
        true
    }

    /// Run one fit of the region through `optimizer`.
    ///
    /// The fitted state is adopted (and recorded in history) only when it
    /// passes the sanity checks; otherwise the previous state stays and
    /// false is returned. A fit with no free variables also returns false.
    pub fn refit(&mut self, optimizer: &dyn Optimizer) -> bool {
        let mut work = self.region.clone();
        work.update_indices();
        if work.variable_count() < 1 {
            return false;
        }

        let result = optimizer.minimize(&work);
        work.save_fit_uncerts(&result);
        if !work.sane() {
            debug!(
                "region {}: rejecting insane fit (value {}, {} iterations)",
                self.id(),
                result.value,
                result.iterations
            );
            return false;
        }

        self.modify_region(
            work,
            format!(
                "Refit: value={:.6} iterations={} converged={}",
                result.value, result.iterations, result.converged
            ),
        );
        true
    }
}
