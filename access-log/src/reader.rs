use std::io::{self, BufRead};

use thiserror::Error;

use crate::record::{parse_json, CommonLog, MalformedRecordError};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("failed to read input at line {line}: {source}")]
    Io {
        line: usize,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),
}

impl ReadError {
    /// Malformed lines only affect one record, I/O failures end the input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::Io { .. })
    }
}

/// Lazily decodes a line-delimited JSON source. Blank lines are skipped. Line numbers are 1-based.
pub struct JsonLinesReader<R> {
    lines: io::Lines<R>,
    line: usize,
}

impl<R: BufRead> JsonLinesReader<R> {
    pub fn new(reader: R) -> Self {
        Self { lines: reader.lines(), line: 0 }
    }

    /// Number of lines consumed so far.
    pub fn lines_read(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for JsonLinesReader<R> {
    type Item = Result<CommonLog, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = self.lines.next()?;
            self.line += 1;
            let raw = match raw {
                Ok(raw) => raw,
                Err(source) => return Some(Err(ReadError::Io { line: self.line, source })),
            };
            if raw.trim().is_empty() {
                continue;
            }
            return Some(parse_json(&raw, self.line).map_err(ReadError::from));
        }
    }
}
