//! Best-effort removal of watch markers left on still-outstanding messages.

use crate::providers::{Provider, ProviderError};

/// Per-id outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, ProviderError)>,
}

impl CleanupReport {
    pub fn attempted(&self) -> usize {
        self.removed.len() + self.failed.len()
    }
}

/// Remove `marker` from every message in `ids`. Failures are logged and recorded; every id is
/// attempted regardless of earlier failures. Never returns an error.
pub async fn remove_markers<I>(provider: &dyn Provider, ids: I, marker: &str) -> CleanupReport
where
    I: IntoIterator<Item = String>,
{
    let mut report = CleanupReport::default();
    for id in ids {
        match provider.remove_marker(&id, marker).await {
            Ok(()) => {
                log::debug!("removed watch marker from message {}", id);
                report.removed.push(id);
            }
            Err(e) => {
                log::warn!("error removing watch marker from message {}: {}", id, e);
                report.failed.push((id, e));
            }
        }
    }
    if report.attempted() > 0 {
        log::info!(
            "cleanup: {} marker(s) removed, {} failed",
            report.removed.len(),
            report.failed.len()
        );
    }
    report
}
