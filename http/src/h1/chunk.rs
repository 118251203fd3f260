//! Chunked transfer coding decoder.
//!
//! A per-byte state machine over the caller's input. Data bytes are
//! reported as ranges into the input slice so the parser can hand them to
//! its body callback without copying; framing bytes are consumed silently,
//! trailers are skipped.

use super::parser::Abort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkError {
    /// Chunk size line carries a non-hex digit.
    InvalidSize,
    /// Chunk size does not fit in 64 bits.
    Overflow,
    /// CRLF discipline violated around chunk data or trailers.
    InvalidFraming,
    /// A body callback asked to abort.
    Aborted,
}

pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
    size: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::Size,
            size: 0,
        }
    }

    /// Consume from `buf[*pos..]`, reporting data ranges through `emit`.
    /// Returns `Ok(true)` once the terminating chunk and trailers have been
    /// consumed.
    pub fn advance<F>(&mut self, buf: &[u8], pos: &mut usize, emit: &mut F) -> Result<bool, ChunkError>
    where
        F: FnMut(usize, usize) -> Result<(), Abort>,
    {
        if self.state == ChunkedState::End {
            return Ok(true);
        }
        while *pos < buf.len() {
            if self.state == ChunkedState::Data {
                let avail = buf.len() - *pos;
                let take = self.size.min(avail as u64) as usize;
                if take > 0 {
                    emit(*pos, *pos + take).map_err(|Abort| ChunkError::Aborted)?;
                    *pos += take;
                    self.size -= take as u64;
                }
                if self.size > 0 {
                    return Ok(false);
                }
                self.state = ChunkedState::DataCr;
                continue;
            }

            let byte = buf[*pos];
            *pos += 1;
            self.state = match self.state {
                ChunkedState::Size => match byte {
                    b'0'..=b'9' => self.push_digit(u64::from(byte - b'0'))?,
                    b'a'..=b'f' => self.push_digit(u64::from(byte - b'a' + 10))?,
                    b'A'..=b'F' => self.push_digit(u64::from(byte - b'A' + 10))?,
                    b'\t' | b' ' => ChunkedState::SizeLws,
                    b';' => ChunkedState::Extension,
                    b'\r' => ChunkedState::SizeLf,
                    _ => return Err(ChunkError::InvalidSize),
                },
                ChunkedState::SizeLws => match byte {
                    // Whitespace may pad the size, but no more digits.
                    b'\t' | b' ' => ChunkedState::SizeLws,
                    b';' => ChunkedState::Extension,
                    b'\r' => ChunkedState::SizeLf,
                    _ => return Err(ChunkError::InvalidSize),
                },
                ChunkedState::Extension => match byte {
                    b'\r' => ChunkedState::SizeLf,
                    b'\n' => return Err(ChunkError::InvalidFraming),
                    // No extension is recognized; skip it.
                    _ => ChunkedState::Extension,
                },
                ChunkedState::SizeLf => match byte {
                    b'\n' if self.size > 0 => ChunkedState::Data,
                    b'\n' => ChunkedState::EndCr,
                    _ => return Err(ChunkError::InvalidFraming),
                },
                ChunkedState::DataCr => match byte {
                    b'\r' => ChunkedState::DataLf,
                    _ => return Err(ChunkError::InvalidFraming),
                },
                ChunkedState::DataLf => match byte {
                    b'\n' => ChunkedState::Size,
                    _ => return Err(ChunkError::InvalidFraming),
                },
                ChunkedState::Trailer => match byte {
                    b'\r' => ChunkedState::TrailerLf,
                    _ => ChunkedState::Trailer,
                },
                ChunkedState::TrailerLf => match byte {
                    b'\n' => ChunkedState::EndCr,
                    _ => return Err(ChunkError::InvalidFraming),
                },
                ChunkedState::EndCr => match byte {
                    b'\r' => ChunkedState::EndLf,
                    // A trailer line begins instead of the final CRLF.
                    _ => ChunkedState::Trailer,
                },
                ChunkedState::EndLf => match byte {
                    b'\n' => {
                        self.state = ChunkedState::End;
                        return Ok(true);
                    }
                    _ => return Err(ChunkError::InvalidFraming),
                },
                ChunkedState::Data | ChunkedState::End => unreachable!("handled above"),
            };
        }
        Ok(self.state == ChunkedState::End)
    }

    fn push_digit(&mut self, digit: u64) -> Result<ChunkedState, ChunkError> {
        self.size = self
            .size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or(ChunkError::Overflow)?;
        Ok(ChunkedState::Size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(input: &str) -> Result<(Vec<u8>, bool), ChunkError> {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut pos = 0;
        let buf = input.as_bytes();
        let done = decoder.advance(buf, &mut pos, &mut |start, end| {
            out.extend_from_slice(&buf[start..end]);
            Ok(())
        })?;
        Ok((out, done))
    }

    #[test]
    fn single_chunk() {
        let (out, done) = decode("10\r\n1234567890abcdef\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"1234567890abcdef");
        assert!(done);
    }

    #[test]
    fn empty_body_is_just_the_terminator() {
        let (out, done) = decode("0\r\n\r\n").unwrap();
        assert!(out.is_empty());
        assert!(done);
    }

    #[test]
    fn extensions_do_not_change_the_size() {
        let (out, done) = decode("3;name=value\r\nabc\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"abc");
        assert!(done);
    }

    #[test]
    fn trailers_are_skipped() {
        let (out, done) = decode("1\r\nx\r\n0\r\nexpires: never\r\n\r\n").unwrap();
        assert_eq!(out, b"x");
        assert!(done);
    }

    #[test]
    fn size_overflow_is_rejected() {
        assert_eq!(decode("f0000000000000003\r\n").unwrap_err(), ChunkError::Overflow);
    }

    #[test]
    fn bad_size_digit_is_rejected() {
        assert_eq!(decode("zz\r\n").unwrap_err(), ChunkError::InvalidSize);
    }

    #[test]
    fn missing_data_crlf_is_rejected() {
        assert_eq!(decode("1\r\nxY\r\n").unwrap_err(), ChunkError::InvalidFraming);
    }

    #[test]
    fn split_feeding_matches_whole_feeding() {
        let input = b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut done = false;
        for chunk in input.chunks(1) {
            let mut pos = 0;
            done = decoder
                .advance(chunk, &mut pos, &mut |start, end| {
                    out.extend_from_slice(&chunk[start..end]);
                    Ok(())
                })
                .unwrap();
            assert_eq!(pos, chunk.len());
        }
        assert!(done);
        assert_eq!(out, b"Hello World");
    }
}
