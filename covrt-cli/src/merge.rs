//! `covrt merge`: combine coverage data files offline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use covrt::CoverageSnapshot;
use tracing::info;

/// Arguments for `covrt merge`.
#[derive(clap::Args)]
pub struct MergeArgs {
    /// Input coverage files, merged in order.
    #[arg(short = 'i', long = "input", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file; replaced, not merged into.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
}

impl MergeArgs {
    pub fn run(self) -> Result<()> {
        let mut merged = CoverageSnapshot::new();
        for input in &self.inputs {
            let snapshot = covrt::data::load(input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            merged.merge(&snapshot);
        }
        covrt::data::persist(&merged, &self.output, false)
            .with_context(|| format!("cannot write {}", self.output.display()))?;
        info!(
            inputs = self.inputs.len(),
            classes = merged.len(),
            "coverage data merged into [{}]",
            self.output.display()
        );
        Ok(())
    }
}
