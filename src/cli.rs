use clap::Parser;

/// Mirror ClickTime time entries into the search index.
///
/// Without a project number every project from the config file is synced.
#[derive(Debug, Parser)]
#[command(name = "clicktime-sync", version, about, long_about = None)]
pub struct Cli {
    /// Job number of a single project to sync.
    pub project: Option<u64>,
}

impl Cli {
    pub fn projects(&self, configured: &[u64]) -> Vec<u64> {
        match self.project {
            Some(project) => vec![project],
            None => configured.to_vec(),
        }
    }
}
