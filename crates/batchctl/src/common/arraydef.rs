use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{preceded, tuple};
use nom_supreme::ParserExt;
use serde::{Deserialize, Serialize};

use crate::common::parser::{NomResult, consume_all, p_u32};

/// Index range of an array job, written as `<start>-<end>[:<step>]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRange {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl ArrayRange {
    pub fn new(start: u32, end: u32, step: u32) -> crate::Result<Self> {
        if start > end {
            return Err(crate::Error::validation(format!(
                "Array range start ({start}) must not be greater than its end ({end})"
            )));
        }
        if step == 0 {
            return Err(crate::Error::validation("Array range step must be positive"));
        }
        Ok(ArrayRange { start, end, step })
    }

    /// Number of tasks that the range produces.
    pub fn task_count(&self) -> u64 {
        u64::from((self.end - self.start) / self.step) + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        (self.start..=self.end).step_by(self.step as usize)
    }
}

impl fmt::Display for ArrayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)?;
        if self.step != 1 {
            write!(f, ":{}", self.step)?;
        }
        Ok(())
    }
}

fn p_array_range(input: &str) -> NomResult<'_, (u32, u32, Option<u32>)> {
    map(
        tuple((
            p_u32.context("range start"),
            char('-'),
            p_u32.context("range end"),
            opt(preceded(char(':'), p_u32.context("range step"))),
        )),
        |(start, _, end, step)| (start, end, step),
    )(input)
}

impl FromStr for ArrayRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end, step) = consume_all(p_array_range, s.trim())?;
        ArrayRange::new(start, end, step.unwrap_or(1)).map_err(|error| anyhow!("{error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ArrayRange, p_array_range};
    use crate::tests::utils::check_parse_error;

    #[test]
    fn parse_simple_range() {
        let range: ArrayRange = "1-10".parse().unwrap();
        assert_eq!(range, ArrayRange::new(1, 10, 1).unwrap());
        assert_eq!(range.task_count(), 10);
        assert_eq!(range.to_string(), "1-10");
    }

    #[test]
    fn parse_range_with_step() {
        let range: ArrayRange = "0-15:4".parse().unwrap();
        assert_eq!(range.task_count(), 4);
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![0, 4, 8, 12]);
        assert_eq!(range.to_string(), "0-15:4");
    }

    #[test]
    fn parse_single_element_range() {
        let range: ArrayRange = "3-3".parse().unwrap();
        assert_eq!(range.task_count(), 1);
    }

    #[test]
    fn task_count_of_full_range() {
        let range: ArrayRange = "0-4294967295".parse().unwrap();
        assert_eq!(range.task_count(), 4294967296);
        let range: ArrayRange = "0-4294967295:2".parse().unwrap();
        assert_eq!(range.task_count(), 2147483648);
        let range: ArrayRange = "4294967295-4294967295".parse().unwrap();
        assert_eq!(range.task_count(), 1);
    }

    #[test]
    fn parse_error_names_missing_part() {
        check_parse_error(p_array_range, "1-x", "range end");
    }

    #[test]
    fn parse_decreasing_range_message() {
        let error = "10-1".parse::<ArrayRange>().unwrap_err();
        assert!(error.to_string().contains("must not be greater"));
    }

    #[test]
    fn parse_invalid_ranges() {
        for input in ["", "5", "10-1", "1-10:0", "-1-5", "a-b", "1-5:", "1 - 5", "1-5,7"] {
            assert!(input.parse::<ArrayRange>().is_err(), "{input} should be rejected");
        }
    }
}
