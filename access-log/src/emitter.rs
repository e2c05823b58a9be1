use std::io::{self, Write};

use thiserror::Error;

use crate::summary::PerUserSummary;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("failed to serialise summary for user \"{user_id}\": {source}")]
    Serialise {
        user_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

/// Sink for finished per-user summaries.
///
/// Called once per key after aggregation has completed, then `finish` once.
pub trait ResultEmitter {
    fn emit(&mut self, summary: &PerUserSummary) -> Result<(), EmitError>;

    fn finish(&mut self) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesEmitter<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResultEmitter for JsonLinesEmitter<W> {
    fn emit(&mut self, summary: &PerUserSummary) -> Result<(), EmitError> {
        serde_json::to_writer(&mut self.writer, &summary.to_map()).map_err(|source| {
            EmitError::Serialise { user_id: summary.user_id.clone(), source }
        })?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EmitError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every summary in memory.
#[derive(Default, Debug)]
pub struct CollectingEmitter {
    pub summaries: Vec<PerUserSummary>,
    pub finished: bool,
}

impl ResultEmitter for CollectingEmitter {
    fn emit(&mut self, summary: &PerUserSummary) -> Result<(), EmitError> {
        self.summaries.push(summary.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EmitError> {
        self.finished = true;
        Ok(())
    }
}
