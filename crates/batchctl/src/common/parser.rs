use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map_res, recognize};
use nom::error::{VerboseError, convert_error};
use nom::{Finish, IResult};

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, VerboseError<&'a str>>;

pub fn p_u32(input: &str) -> NomResult<'_, u32> {
    map_res(digit1, |number: &str| number.parse::<u32>())(input)
}

pub fn p_u64(input: &str) -> NomResult<'_, u64> {
    map_res(digit1, |number: &str| number.parse::<u64>())(input)
}

/// Parses a decimal number and also returns its literal text, so that zero padding
/// can be reproduced later.
pub fn p_padded_u64(input: &str) -> NomResult<'_, (&str, u64)> {
    map_res(recognize(digit1), |number: &str| {
        number.parse::<u64>().map(|value| (number, value))
    })(input)
}

/// Runs `parser` and requires it to consume the whole input.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    all_consuming(parser)(input)
        .finish()
        .map(|(_, output)| output)
        .map_err(|error| anyhow::anyhow!("Parse error\n{}", convert_error(input, error)))
}
