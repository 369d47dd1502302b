//! Engine CLI argument construction and output parsing.

use chrono::{DateTime, FixedOffset};
use std::path::Path;

use crate::backend::BackendStatus;
use crate::config::ContainerSettings;
use crate::world::{MemorySize, WorldSpec};

pub(super) const LABEL_WORLD: &str = "hycore.world";
const LABEL_MEMORY: &str = "hycore.memory";
const LABEL_CPUS: &str = "hycore.cpus";
const LABEL_PORT: &str = "hycore.port";

/// Format string for `inspect`, parsed by [`parse_inspect`].
pub(super) const INSPECT_FORMAT: &str = "{{.State.Status}}|{{.State.ExitCode}}";

pub(super) fn container_name(prefix: &str, id: &str) -> String {
    format!("{prefix}-{id}")
}

pub(super) fn create_args(
    settings: &ContainerSettings,
    image: &str,
    worlds_path: &Path,
    spec: &WorldSpec,
) -> Vec<String> {
    let name = container_name(&settings.name_prefix, &spec.id);
    let data_dir = worlds_path.join(&spec.id);

    vec![
        "create".into(),
        "--name".into(),
        name,
        "--interactive".into(),
        format!("--memory={}", spec.memory),
        format!("--cpus={}", spec.cpus),
        format!("--restart={}", settings.restart_policy),
        "-p".into(),
        format!("{}:{}", spec.port, settings.container_port),
        "-e".into(),
        "EULA=TRUE".into(),
        "-e".into(),
        format!("MEMORY={}", spec.memory),
        "-v".into(),
        format!("{}:/data", data_dir.display()),
        "--label".into(),
        format!("{LABEL_WORLD}={}", spec.id),
        "--label".into(),
        format!("{LABEL_MEMORY}={}", spec.memory),
        "--label".into(),
        format!("{LABEL_CPUS}={}", spec.cpus),
        "--label".into(),
        format!("{LABEL_PORT}={}", spec.port),
        image.to_string(),
    ]
}

/// `ps` arguments listing every container carrying the world label.
pub(super) fn discover_args() -> Vec<String> {
    vec![
        "ps".into(),
        "-a".into(),
        "--filter".into(),
        format!("label={LABEL_WORLD}"),
        "--format".into(),
        format!(
            "{{{{.Label \"{LABEL_WORLD}\"}}}}|{{{{.Label \"{LABEL_MEMORY}\"}}}}|{{{{.Label \"{LABEL_CPUS}\"}}}}|{{{{.Label \"{LABEL_PORT}\"}}}}"
        ),
    ]
}

/// Parse one line of [`discover_args`] output back into a spec snapshot.
pub(super) fn parse_discovered(line: &str) -> Option<WorldSpec> {
    let mut parts = line.trim().split('|');
    let id = parts.next()?.trim();
    let memory: MemorySize = parts.next()?.trim().parse().ok()?;
    let cpus = parts.next()?.trim().parse().ok()?;
    let port = parts.next()?.trim().parse().ok()?;
    if id.is_empty() {
        return None;
    }
    Some(WorldSpec::new(id, memory, cpus, port))
}

/// Map `inspect` output (`status|exit_code`) to a backend status.
pub(super) fn parse_inspect(output: &str) -> BackendStatus {
    let mut parts = output.trim().split('|');
    let state = parts.next().unwrap_or_default().trim();
    let exit_code = parts.next().and_then(|c| c.trim().parse().ok());

    match state {
        "created" => BackendStatus::Created,
        "running" => BackendStatus::Running,
        "exited" => BackendStatus::Stopped { exit_code },
        "" => BackendStatus::NotFound,
        other => BackendStatus::Other(other.to_string()),
    }
}

/// Parse `wait` output, the container's exit code.
pub(super) fn parse_exit_code(output: &str) -> Option<i32> {
    output.trim().lines().last()?.trim().parse().ok()
}

/// Arguments for a timestamped tail of the container's output.
pub(super) fn tail_args(name: &str, lines: usize) -> Vec<String> {
    vec![
        "logs".into(),
        "--timestamps".into(),
        "--tail".into(),
        lines.to_string(),
        name.into(),
    ]
}

type Stamped<'a> = (Option<DateTime<FixedOffset>>, &'a str);

/// Split each `--timestamps` line into its timestamp and text. A line
/// without a readable timestamp sorts with the line before it.
fn stamped(output: &str) -> Vec<Stamped<'_>> {
    let mut last = None;
    output
        .lines()
        .map(|line| {
            if let Some((stamp, text)) = line.split_once(' ')
                && let Ok(at) = DateTime::parse_from_rfc3339(stamp)
            {
                last = Some(at);
                return (last, text);
            }
            (last, line)
        })
        .collect()
}

/// Interleave timestamped stdout and stderr of `logs --timestamps` in
/// chronological order, drop the timestamps and keep the last `lines`.
///
/// Stdout wins ties, and each stream keeps its own order.
pub(super) fn merge_timestamped(stdout: &str, stderr: &str, lines: usize) -> String {
    let out = stamped(stdout);
    let err = stamped(stderr);
    let mut merged = Vec::with_capacity(out.len() + err.len());
    let (mut i, mut j) = (0, 0);
    while i < out.len() && j < err.len() {
        if err[j].0 < out[i].0 {
            merged.push(err[j].1);
            j += 1;
        } else {
            merged.push(out[i].1);
            i += 1;
        }
    }
    merged.extend(out[i..].iter().map(|(_, text)| *text));
    merged.extend(err[j..].iter().map(|(_, text)| *text));

    let start = merged.len().saturating_sub(lines);
    let mut text = String::new();
    for line in &merged[start..] {
        text.push_str(line);
        text.push('\n');
    }
    text
}
