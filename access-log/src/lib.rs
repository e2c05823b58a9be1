mod emitter;
mod reader;
mod record;
mod summary;

pub use emitter::{CollectingEmitter, EmitError, JsonLinesEmitter, ResultEmitter};
pub use reader::{JsonLinesReader, ReadError};
pub use record::{parse_json, CommonLog, MalformedRecordError};
pub use summary::PerUserSummary;
