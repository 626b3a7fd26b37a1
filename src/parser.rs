//! implements a parser for the beanstalk TCP protocol command lines.
use std::fmt;

use crate::types::protocol::{ClientError, Command};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl From<ParsingError> for ClientError {
    fn from(value: ParsingError) -> Self {
        match value {
            ParsingError::BadFormat => ClientError::BadFormat,
            ParsingError::UnknownCommand => ClientError::UnknownCommand,
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// True once the whole input has been consumed.
    fn done(&self) -> bool {
        self.from.is_empty()
    }

    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.done() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u32;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u32)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use Command::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"reserve" => Reserve,

            // <cmd> [<id>] -- peek and stats take an optional job id
            b"peek" => {
                if ps.done() {
                    Peek
                } else {
                    PeekJob {
                        id: ps.expect_next_u64()?,
                    }
                }
            },
            b"stats" => {
                if ps.done() {
                    Stats
                } else {
                    StatsJob {
                        id: ps.expect_next_u64()?,
                    }
                }
            },

            // <cmd> <n>
            b"delete" => Delete {
                id: ps.expect_next_u64()?,
            },
            b"kick" => Kick {
                bound: ps.expect_next_u64()?,
            },

            // <cmd> <id> <pri>
            b"bury" => Bury {
                id: ps.expect_next_u64()?,
                pri: ps.expect_next_u32()?,
            },

            // <cmd> <id> <pri> <delay>
            b"release" => Release {
                id: ps.expect_next_u64()?,
                pri: ps.expect_next_u32()?,
                delay: ps.expect_next_u32()?,
            },

            // <cmd> <pri> <delay> <ttr> <n_bytes>
            b"put" => Put {
                pri: ps.expect_next_u32()?,
                delay: ps.expect_next_u32()?,
                ttr: ps.expect_next_u32()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
