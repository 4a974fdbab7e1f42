//! Expansion of the compressed host list notation printed by Slurm,
//! e.g. `node[001-003,007],gpu01` -> `node001 node002 node003 node007 gpu01`.
use anyhow::anyhow;
use itertools::Itertools;
use nom::branch::alt;
use nom::bytes::complete::is_not;
use nom::character::complete::char;
use nom::combinator::{map, map_res, opt};
use nom::multi::{many1, separated_list1};
use nom::sequence::{delimited, pair, preceded};
use nom_supreme::ParserExt;

use crate::common::parser::{NomResult, consume_all, p_padded_u64};

/// Upper bound on the number of names produced from a single expression.
const MAX_EXPANDED_NODES: usize = 65536;

#[derive(Debug)]
struct NumberRange {
    start: u64,
    end: u64,
    width: usize,
}

#[derive(Debug)]
enum Segment<'a> {
    Literal(&'a str),
    Ranges(Vec<NumberRange>),
}

impl Segment<'_> {
    /// Number of values of the segment, `None` if it does not fit into `usize`.
    fn len(&self) -> Option<usize> {
        match self {
            Segment::Literal(_) => Some(1),
            Segment::Ranges(ranges) => ranges.iter().try_fold(0usize, |total, range| {
                let count = (range.end - range.start).checked_add(1)?;
                total.checked_add(usize::try_from(count).ok()?)
            }),
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            Segment::Literal(value) => vec![value.to_string()],
            Segment::Ranges(ranges) => ranges
                .iter()
                .flat_map(|range| {
                    let width = range.width;
                    (range.start..=range.end).map(move |index| format!("{index:0width$}"))
                })
                .collect(),
        }
    }
}

fn p_number_range(input: &str) -> NomResult<'_, NumberRange> {
    map_res(
        pair(p_padded_u64, opt(preceded(char('-'), p_padded_u64))),
        |((literal, start), end)| {
            let end = end.map(|(_, end)| end).unwrap_or(start);
            if start > end {
                return Err(anyhow!("Range {start}-{end} is decreasing"));
            }
            Ok(NumberRange {
                start,
                end,
                width: literal.len(),
            })
        },
    )(input)
}

fn p_segment(input: &str) -> NomResult<'_, Segment<'_>> {
    alt((
        map(
            delimited(
                char('['),
                separated_list1(char(','), p_number_range),
                char(']'),
            )
            .context("bracketed range"),
            Segment::Ranges,
        ),
        map(is_not(",[]"), Segment::Literal),
    ))(input)
}

fn p_host_list(input: &str) -> NomResult<'_, Vec<Vec<Segment<'_>>>> {
    separated_list1(char(','), many1(p_segment))(input)
}

fn is_empty_marker(expression: &str) -> bool {
    matches!(expression, "" | "(null)" | "None" | "n/a")
}

fn expand_host(segments: &[Segment]) -> Vec<String> {
    segments
        .iter()
        .map(|segment| segment.values())
        .multi_cartesian_product()
        .map(|parts| parts.concat())
        .collect()
}

/// Expands a compressed node list expression into an ordered list of node names.
///
/// Malformed expressions (and expressions that would produce an unreasonable
/// amount of names) yield an empty list, never a partial one.
pub fn expand(expression: &str) -> Vec<String> {
    let expression = expression.trim();
    if is_empty_marker(expression) {
        return Vec::new();
    }
    let hosts = match consume_all(p_host_list, expression) {
        Ok(hosts) => hosts,
        Err(error) => {
            log::debug!("Cannot expand node list `{expression}`: {error}");
            return Vec::new();
        }
    };

    let mut total: usize = 0;
    for host in &hosts {
        let count = host
            .iter()
            .try_fold(1usize, |acc, segment| acc.checked_mul(segment.len()?));
        total = match count.and_then(|count| total.checked_add(count)) {
            Some(total) if total <= MAX_EXPANDED_NODES => total,
            _ => {
                log::debug!("Node list `{expression}` expands to too many names");
                return Vec::new();
            }
        };
    }

    let mut names = Vec::with_capacity(total);
    for host in &hosts {
        names.extend(expand_host(host));
    }
    names
}
