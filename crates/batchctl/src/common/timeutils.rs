use std::time::Duration;

use anyhow::bail;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{terminated, tuple};
use nom_supreme::ParserExt;

use crate::common::parser::{NomResult, consume_all, p_u32, p_u64};

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Format a duration as a Slurm time string, e.g. 01:05:02
pub fn format_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

fn p_time_limit(input: &str) -> NomResult<'_, (Option<u64>, u64, u32, u32)> {
    map(
        tuple((
            opt(terminated(p_u64, char('-'))),
            p_u64,
            char(':'),
            p_u32,
            char(':'),
            p_u32,
        ))
        .context("[D-]HH:MM:SS value"),
        |(days, hours, _, minutes, _, seconds)| (days, hours, minutes, seconds),
    )(input)
}

/// Parses a wall-clock limit in the format `HH:MM:SS` or `D-HH:MM:SS`.
/// A zero limit is rejected, Slurm would interpret it as "no limit".
pub fn parse_time_limit(input: &str) -> anyhow::Result<Duration> {
    let (days, hours, minutes, seconds) = consume_all(p_time_limit, input.trim())?;
    if minutes >= 60 || seconds >= 60 {
        bail!("Minutes and seconds of time limit `{input}` must be smaller than 60");
    }
    if days.is_some() && hours >= 24 {
        bail!("Hours of time limit `{input}` must be smaller than 24 when days are given");
    }
    let total = days
        .unwrap_or(0)
        .checked_mul(SECONDS_PER_DAY)
        .and_then(|secs| secs.checked_add(hours.checked_mul(3600)?))
        .and_then(|secs| secs.checked_add(minutes as u64 * 60 + seconds as u64))
        .ok_or_else(|| anyhow::anyhow!("Time limit `{input}` is too large"))?;
    if total == 0 {
        bail!("Time limit must be larger than zero");
    }
    Ok(Duration::from_secs(total))
}

/// Parses datetimes printed by `scontrol` and `sacct`.
/// Placeholders such as `Unknown` or `None` yield `None`.
pub fn parse_slurm_datetime(datetime: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(datetime.trim(), "%Y-%m-%dT%H:%M:%S").ok()
}
