//! Implements a parser for the beanstalkd TCP protocol.
use std::fmt;

use crate::types::protocol::BeanstalkCommand;
use crate::types::serialisable::BeanstalkSerialisable;
use crate::types::tube_name::TubeName;

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

impl std::error::Error for ParsingError {}

impl BeanstalkSerialisable for ParsingError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
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

    /// Consumes from the input, expecting a space then a tube name.
    fn expect_next_name(&mut self) -> Result<TubeName, ParsingError> {
        self.expect_space()?;

        TubeName::new(self.expect_next_token()?)
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
impl TryFrom<&[u8]> for BeanstalkCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkCommand::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"list-tube-used" => ListTubeUsed,
            b"list-tubes-watched" => ListTubesWatched,
            b"list-tubes" => ListTubes,
            b"peek-buried" => PeekBuried,
            b"peek-delayed" => PeekDelayed,
            b"peek-ready" => PeekReady,
            b"quit" => Quit,
            b"reserve" => Reserve,
            b"stats" => StatsServer,

            // <cmd> <id>
            b"delete" => Delete {
                id: ps.expect_next_u32()?,
            },
            b"kick" => Kick {
                bound: ps.expect_next_u32()?,
            },
            b"kick-job" => KickJob {
                id: ps.expect_next_u32()?,
            },
            b"peek" => Peek {
                id: ps.expect_next_u32()?,
            },
            b"reserve-job" => ReserveJob {
                id: ps.expect_next_u32()?,
            },
            b"stats-job" => StatsJob {
                id: ps.expect_next_u32()?,
            },
            b"touch" => Touch {
                id: ps.expect_next_u32()?,
            },

            // <cmd> <timeout>
            b"reserve-with-timeout" => ReserveWithTimeout {
                timeout: ps.expect_next_u32()?,
            },

            // <cmd> <tube>
            b"use" => Use {
                tube: ps.expect_next_name()?,
            },
            b"watch" => Watch {
                tube: ps.expect_next_name()?,
            },
            b"ignore" => Ignore {
                tube: ps.expect_next_name()?,
            },
            b"stats-tube" => StatsTube {
                tube: ps.expect_next_name()?,
            },

            // <cmd> <id> <pri>
            b"bury" => Bury {
                id: ps.expect_next_u32()?,
                pri: ps.expect_next_u32()?,
            },

            // <cmd> <tube> <delay>
            b"pause-tube" => PauseTube {
                tube: ps.expect_next_name()?,
                delay: ps.expect_next_u32()?,
            },

            // <cmd> <id> <pri> <delay>
            b"release" => Release {
                id: ps.expect_next_u32()?,
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
