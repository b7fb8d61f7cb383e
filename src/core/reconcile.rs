//! Log markers and failure inference for environments whose process died.

use std::collections::HashMap;

/// Written by the orchestrator when a launch does not complete.
pub const LAUNCH_FAILURE_MARKER: &str = "LAUNCH FAILURE:";
/// Written by the orchestrator before every launch; scans start after the last one.
pub const LAUNCH_HEADER: &str = "=== LAUNCH ";
pub const BACKGROUND_STARTED: &str = "BACKGROUND STARTED [";
pub const BACKGROUND_FINISHED: &str = "BACKGROUND FINISHED [";
const EXIT_CODE_PREFIX: &str = "exit code: ";

/// Why a dead environment is considered failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureEvidence {
    LaunchFailure,
    BackgroundExit { job: String, exit_code: i32 },
    Marker(String),
}

impl std::fmt::Display for FailureEvidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureEvidence::LaunchFailure => write!(f, "launch failure recorded"),
            FailureEvidence::BackgroundExit { job, exit_code } => {
                write!(f, "background job {} exited with {}", job, exit_code)
            }
            FailureEvidence::Marker(marker) => write!(f, "log contains '{}'", marker),
        }
    }
}

/// The part of the log written since the most recent launch.
pub fn current_run(log: &str) -> &str {
    match log.rfind(LAUNCH_HEADER) {
        Some(start) => &log[start..],
        None => log,
    }
}

/// Exit codes of finished background jobs, keyed by job id.
pub fn background_completions(log: &str) -> HashMap<String, i32> {
    log.lines()
        .filter_map(parse_completion)
        .collect()
}

fn parse_completion(line: &str) -> Option<(String, i32)> {
    let rest = &line[line.find(BACKGROUND_FINISHED)? + BACKGROUND_FINISHED.len()..];
    let (job, rest) = rest.split_once(']')?;
    let code = &rest[rest.find(EXIT_CODE_PREFIX)? + EXIT_CODE_PREFIX.len()..];
    let code = code.trim().parse().ok()?;
    Some((job.to_string(), code))
}

/// First piece of failure evidence in `log`, checked in order: launch
/// failure marker, non-zero background completion, configured substrings.
pub fn classify(log: &str, markers: &[String]) -> Option<FailureEvidence> {
    let run = current_run(log);

    if run.contains(LAUNCH_FAILURE_MARKER) {
        return Some(FailureEvidence::LaunchFailure);
    }

    if let Some((job, exit_code)) = run
        .lines()
        .filter_map(parse_completion)
        .find(|(_, code)| *code != 0)
    {
        return Some(FailureEvidence::BackgroundExit { job, exit_code });
    }

    markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .find(|marker| run.contains(marker.as_str()))
        .map(|marker| FailureEvidence::Marker(marker.clone()))
}
