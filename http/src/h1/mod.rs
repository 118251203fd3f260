//! HTTP/1.x protocol implementation.

mod chunk;
mod parser;

pub mod encode;

pub use self::parser::{Abort, Callbacks, CbResult, Config, Head, Kind, ParseError, Parser};
