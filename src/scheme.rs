//! S-expression reader.
//!
//! Text is first parsed with nom into an owned [`Datum`] tree, which is only allocated
//! into the [`Heap`] once the whole expression was read, so a failed parse leaves the
//! heap untouched.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{cut, opt, recognize, value},
    error::ErrorKind,
    multi::many0,
    sequence::pair,
};

use crate::ast::{FALSE, NumberType, SYMBOL_SPECIAL_CHARS, TRUE, is_valid_symbol};
use crate::builtinops::QUOTE;
use crate::heap::{Heap, ValueId};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Reader options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Treat `;` up to the end of the line as whitespace
    pub handle_comments: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            handle_comments: true,
        }
    }
}

/// Parsed expression, not yet allocated
#[derive(Debug, Clone, PartialEq)]
enum Datum {
    Number(NumberType),
    Symbol(String),
    /// Elements plus an optional dotted tail; no elements and no tail is nil
    List(Vec<Datum>, Option<Box<Datum>>),
}

impl Datum {
    fn allocate(&self, heap: &mut Heap) -> Option<ValueId> {
        match self {
            Datum::Number(n) => Some(heap.number(*n)),
            Datum::Symbol(name) => Some(heap.symbol(name.as_str())),
            Datum::List(items, tail) => {
                let items: Vec<Option<ValueId>> =
                    items.iter().map(|item| item.allocate(heap)).collect();
                let tail = tail.as_ref().and_then(|tail| tail.allocate(heap));
                heap.list_from(&items, tail)
            }
        }
    }
}

fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)
}

/// An atom must not run straight into symbol characters (`1abc`, `#tx`)
fn atom_end<'a>(rest: &'a str, start: &'a str, kind: ErrorKind) -> IResult<&'a str, ()> {
    if rest.starts_with(|c: char| is_symbol_char(c) || c == '#') {
        Err(nom::Err::Error(nom::error::Error::new(start, kind)))
    } else {
        Ok((rest, ()))
    }
}

fn line_comment(input: &str) -> IResult<&str, ()> {
    value((), pair(char(';'), take_while(|c: char| c != '\n'))).parse(input)
}

/// Skip whitespace, and comments when enabled
fn skip_atmosphere(input: &str, config: ParseConfig) -> IResult<&str, ()> {
    if config.handle_comments {
        value((), many0(alt((value((), multispace1), line_comment)))).parse(input)
    } else {
        value((), multispace0).parse(input)
    }
}

/// Parse a decimal integer with an optional sign
fn parse_number(input: &str) -> IResult<&str, Datum> {
    let (rest, number_str) =
        recognize(pair(opt(alt((char('-'), char('+')))), digit1)).parse(input)?;
    atom_end(rest, input, ErrorKind::Digit)?;

    match number_str.parse::<NumberType>() {
        Ok(n) => Ok((rest, Datum::Number(n))),
        // Out of range; the symbol parser rejects it as well since it starts with a digit
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        ))),
    }
}

/// Parse a boolean (#t or #f), read as the corresponding symbol
fn parse_bool(input: &str) -> IResult<&str, Datum> {
    let (rest, literal) = alt((tag(TRUE), tag(FALSE))).parse(input)?;
    atom_end(rest, input, ErrorKind::Tag)?;
    Ok((rest, Datum::Symbol(literal.to_owned())))
}

/// Parse a symbol (identifier)
fn parse_symbol(input: &str) -> IResult<&str, Datum> {
    let (remaining, candidate) = take_while1(is_symbol_char).parse(input)?;

    if is_valid_symbol(candidate) {
        Ok((remaining, Datum::Symbol(candidate.into())))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )))
    }
}

/// Parse quoted expression ('expr -> (quote expr))
fn parse_quote(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Datum> {
    let (input, _) = char('\'').parse(input)?;
    let (input, expr) = cut(|input| parse_sexpr(input, config, depth + 1)).parse(input)?;
    Ok((
        input,
        Datum::List(vec![Datum::Symbol(QUOTE.into()), expr], None),
    ))
}

/// Parse a list, with an optional dotted tail after at least one element
fn parse_list(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Datum> {
    let (mut input, _) = char('(').parse(input)?;
    let mut items = Vec::new();

    // Past the opening parenthesis every failure is final
    loop {
        let (rest, _) = skip_atmosphere(input, config)?;
        if let Ok((rest, _)) = char::<&str, nom::error::Error<&str>>(')').parse(rest) {
            return Ok((rest, Datum::List(items, None)));
        }

        if !items.is_empty()
            && let Ok((rest, _)) = char::<&str, nom::error::Error<&str>>('.').parse(rest)
        {
            let (rest, tail) = cut(|input| parse_sexpr(input, config, depth + 1)).parse(rest)?;
            let (rest, _) = skip_atmosphere(rest, config)?;
            let (rest, _) = cut(char(')')).parse(rest)?;
            return Ok((rest, Datum::List(items, Some(Box::new(tail)))));
        }

        let (rest, item) = cut(|input| parse_sexpr(input, config, depth + 1)).parse(rest)?;
        items.push(item);
        input = rest;
    }
}

/// Parse an S-expression, skipping leading whitespace and comments
fn parse_sexpr(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Datum> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    let (input, _) = skip_atmosphere(input, config)?;
    alt((
        |input| parse_quote(input, config, depth),
        |input| parse_list(input, config, depth),
        parse_number,
        parse_bool,
        parse_symbol,
    ))
    .parse(input)
}

/// Convert nom parsing errors to structured parse errors
fn to_parse_error(input: &str, error: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = input.len().saturating_sub(e.input.len());
            match e.code {
                ErrorKind::TooLarge => ParseError::with_context(
                    ParseErrorKind::TooDeeplyNested,
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                    input,
                    offset,
                ),
                _ if e.input.is_empty() => {
                    ParseError::from_message(ParseErrorKind::Incomplete, "Unexpected end of input")
                }
                ErrorKind::Char => ParseError::with_context(
                    ParseErrorKind::InvalidSyntax,
                    format!("Expected character at position {offset}"),
                    input,
                    offset,
                ),
                _ => {
                    let near: String = e.input.chars().take(10).collect();
                    ParseError::with_context(
                        ParseErrorKind::InvalidSyntax,
                        format!("Invalid syntax near '{near}'"),
                        input,
                        offset,
                    )
                }
            }
        }
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::Incomplete, "Incomplete input")
        }
    }
}

fn read_datum(input: &str, config: ParseConfig) -> Result<Datum, ParseError> {
    let (rest, datum) = parse_sexpr(input, config, 0).map_err(|e| to_parse_error(input, e))?;
    let rest = match skip_atmosphere(rest, config) {
        Ok((rest, _)) => rest,
        Err(_) => rest,
    };

    if rest.is_empty() {
        Ok(datum)
    } else {
        Err(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("Unexpected remaining input: '{rest}'"),
            input,
            input.len() - rest.len(),
        ))
    }
}

/// Parse one complete S-expression and allocate it in `heap`. Nil (`()`) yields `None`.
pub fn parse_scheme(input: &str, heap: &mut Heap) -> Result<Option<ValueId>, Error> {
    parse_scheme_with_config(input, heap, ParseConfig::default())
}

pub fn parse_scheme_with_config(
    input: &str,
    heap: &mut Heap,
    config: ParseConfig,
) -> Result<Option<ValueId>, Error> {
    let datum = read_datum(input, config).map_err(Error::ParseError)?;
    Ok(datum.allocate(heap))
}
