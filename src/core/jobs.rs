//! Registry of detached jobs (`jobs.json`).

use crate::config::types::{BackgroundJob, Result};
use crate::core::reconcile::background_completions;
use crate::safety::layout::EnvLayout;
use crate::safety::lock::with_file_lock;
use crate::safety::writer::FsWriter;
use std::path::Path;

pub fn load(writer: &FsWriter, layout: &EnvLayout) -> Result<Vec<BackgroundJob>> {
    Ok(writer.read_json(&layout.jobs())?.unwrap_or_default())
}

/// Add `job` to the registry under the registry lock.
pub fn register(
    writer: &FsWriter,
    layout: &EnvLayout,
    lock_dir: &Path,
    job: &BackgroundJob,
) -> Result<()> {
    let lock = lock_dir.join(format!("{}.jobs.lock", layout.name()));
    with_file_lock(&lock, || {
        let mut jobs = load(writer, layout)?;
        jobs.push(job.clone());
        writer.install_json(&layout.jobs(), &jobs)
    })
}

/// Fill in exit codes from completion markers found in `log`.
pub fn with_completions(mut jobs: Vec<BackgroundJob>, log: &str) -> Vec<BackgroundJob> {
    let done = background_completions(log);
    for job in &mut jobs {
        if let Some(code) = done.get(&job.id) {
            job.exit_code = Some(*code);
        }
    }
    jobs
}
