use nom::character::complete::{one_of, satisfy};
use nom::combinator::{map, opt};
use nom::sequence::tuple;
use nom_supreme::ParserExt;

use crate::common::parser::{NomResult, consume_all, p_u64};

pub fn human_size(size: u64) -> String {
    if size < 2048 {
        format!("{size} B")
    } else if size < 2 * 1024 * 1024 {
        format!("{:.2} KiB", size as f64 / 1024.0)
    } else if size < 2 * 1024 * 1024 * 1024 {
        format!("{:.2} MiB", size as f64 / (1024 * 1024) as f64)
    } else {
        format!("{:.2} GiB", size as f64 / (1024 * 1024 * 1024) as f64)
    }
}

fn p_memory(input: &str) -> NomResult<'_, (u64, Option<char>)> {
    map(
        tuple((
            p_u64,
            opt(one_of("KkMmGgTt")),
            opt(satisfy(|c| c == 'B' || c == 'b')),
        ))
        .context("memory amount (e.g. 512M, 4G)"),
        |(amount, unit, _)| (amount, unit),
    )(input)
}

/// Parses a Slurm memory request (`<amount>[K|M|G|T][B]`) into megabytes.
pub fn parse_memory_mb(input: &str) -> anyhow::Result<u64> {
    let (amount, unit) = consume_all(p_memory, input.trim())?;
    // Slurm interprets a bare number as megabytes
    let megabytes = match unit.map(|u| u.to_ascii_uppercase()) {
        Some('K') => Some(amount.div_ceil(1024)),
        Some('G') => amount.checked_mul(1024),
        Some('T') => amount.checked_mul(1024 * 1024),
        _ => Some(amount),
    };
    match megabytes {
        Some(0) => anyhow::bail!("Memory amount `{input}` must be larger than zero"),
        Some(value) => Ok(value),
        None => anyhow::bail!("Memory amount `{input}` is too large"),
    }
}
