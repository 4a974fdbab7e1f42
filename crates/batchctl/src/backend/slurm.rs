//! Parsers for the textual output of the Slurm command-line tools.
use crate::Map;

/// Extracts the job id from `sbatch` output (`Submitted batch job <id>`).
pub fn parse_sbatch_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| line.to_lowercase().starts_with("submitted batch job"))
        .and_then(|line| line.split(' ').nth(3))
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
///
/// Only the first record is considered, `scontrol` prints one record per array task.
/// Values may themselves contain `=` (e.g. `TRES=cpu=4,mem=8G`).
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    let mut seen_items = false;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            if seen_items {
                break;
            }
            continue;
        }
        for item in line.split(' ') {
            if let Some((key, value)) = item.split_once('=') {
                if !key.is_empty() {
                    seen_items = true;
                    map.entry(key).or_insert(value);
                }
            }
        }
    }
    map
}

/// Parses the job id from `salloc: Granted job allocation <id>`.
pub fn parse_salloc_job_id(output: &str) -> Option<String> {
    find_salloc_id(output, "Granted job allocation")
}

/// Parses the job id from `salloc: Pending job allocation <id>`, printed while the
/// request waits in the queue.
pub fn parse_salloc_pending_id(output: &str) -> Option<String> {
    find_salloc_id(output, "Pending job allocation")
}

fn find_salloc_id(output: &str, marker: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(marker)?;
        let id = rest.split_whitespace().next()?;
        id.chars()
            .all(|c| c.is_ascii_digit())
            .then(|| id.to_string())
    })
}

/// Parses the compressed node list from `salloc: Nodes <list> are ready for job`.
pub fn parse_salloc_nodes(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("Nodes ")?;
        let (nodes, _) = rest.split_once(" are ready for job")?;
        let nodes = nodes.trim();
        (!nodes.is_empty()).then(|| nodes.to_string())
    })
}

/// Splits a delimited output line into exactly `count` fields.
///
/// The last field keeps any remaining delimiters, which is where node lists
/// (that contain commas themselves) are placed. Returns `None` if the line is short.
pub fn split_fields(line: &str, delimiter: char, count: usize) -> Option<Vec<&str>> {
    let fields: Vec<&str> = line.splitn(count, delimiter).map(|f| f.trim()).collect();
    (fields.len() == count).then_some(fields)
}

/// Slurm reports unknown (or already purged) jobs with this message.
pub fn is_invalid_job_id(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

/// Values that Slurm prints for fields without a value.
pub fn non_empty_value(value: &str) -> Option<&str> {
    match value.trim() {
        "" | "(null)" | "None" | "N/A" | "Unknown" | "n/a" => None,
        value => Some(value),
    }
}
