use std::collections::BTreeMap;
use tracing::info;

use crate::record::AssetState;
use crate::status_store::StatusMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    counts: BTreeMap<AssetState, usize>,
    in_progress: Vec<(String, AssetState)>,
}

impl StatusSummary {
    pub fn from_map(map: &StatusMap) -> Self {
        let mut summary = Self::default();
        for (key, record) in map.iter() {
            *summary.counts.entry(record.state).or_default() += 1;
            if !record.is_terminal() {
                summary.in_progress.push((key.clone(), record.state));
            }
        }
        summary
    }

    pub fn count(&self, state: AssetState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn log(self: &Self, heading: &str) {
        info!("===== {} =====", heading);
        info!("Tracked assets: {}", self.total());
        for state in AssetState::ALL {
            let n = self.count(state);
            if n > 0 {
                info!("  {:<22} {}", state.label(), n);
            }
        }
        for (key, state) in self.in_progress.iter() {
            info!("  - {}: {}", key, state.label());
        }
    }
}
