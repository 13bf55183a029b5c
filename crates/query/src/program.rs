//! Dataflow programs as the controller's unit of work.
//!
//! A program compiles ahead of submission and starts lazily: `start`
//! returns the table stream without doing the read work, which then runs
//! on whichever worker drains the stream. The shipped program format is a
//! JSON-encoded read spec with an optional output bucket; richer frontends
//! compile to the same [`Program`] trait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use rill_common::{Allocator, BucketId, OrgId, Result, RillError};
use rill_storage::{BoxTableStream, ReadSpec, StorageReader};

/// Everything a program needs to run.
#[derive(Clone)]
pub struct ProgramContext {
    /// Organization the query runs as.
    pub org: OrgId,
    /// The query's memory account; threaded into every table allocation.
    pub alloc: Allocator,
    /// Cancellation signal honored at every suspension point.
    pub cancel: CancellationToken,
    /// The storage read surface.
    pub reader: StorageReader,
}

/// A compiled dataflow program.
pub trait Program: Send + Sync + 'static {
    /// The program source, used for fingerprinting.
    fn source(&self) -> &str;

    /// Begin execution, returning the lazy result stream.
    fn start(&self, ctx: &ProgramContext) -> Result<BoxTableStream>;
}

/// Destination for programs that write their results back as points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgramOutput {
    /// Destination organization.
    pub org: OrgId,
    /// Destination bucket.
    pub bucket: BucketId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReadProgramSpec {
    #[serde(flatten)]
    read: ReadSpec,
    #[serde(default)]
    to: Option<ProgramOutput>,
}

/// A program that executes one read spec against the storage reader.
#[derive(Debug, Clone)]
pub struct ReadProgram {
    source: String,
    spec: ReadProgramSpec,
}

impl ReadProgram {
    /// Build from a read spec; the source becomes its JSON encoding.
    pub fn new(read: ReadSpec, to: Option<ProgramOutput>) -> Self {
        let spec = ReadProgramSpec { read, to };
        let source = serde_json::to_string(&spec).expect("read spec serializes");
        Self { source, spec }
    }

    /// Parse a JSON program source.
    pub fn parse(source: &str) -> Result<Self> {
        let spec: ReadProgramSpec = serde_json::from_str(source)
            .map_err(|e| RillError::InvalidArgument(format!("malformed program source: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            spec,
        })
    }

    /// Destination bucket, for programs that end in a write.
    pub fn output(&self) -> Option<ProgramOutput> {
        self.spec.to
    }
}

impl Program for ReadProgram {
    fn source(&self) -> &str {
        &self.source
    }

    fn start(&self, ctx: &ProgramContext) -> Result<BoxTableStream> {
        ctx.reader.read(&self.spec.read, &ctx.alloc)
    }
}

/// Compiles task program sources into runnable programs.
pub trait ProgramResolver: Send + Sync + 'static {
    /// Compile `source` for execution.
    fn compile(&self, source: &str) -> Result<Arc<dyn Program>>;

    /// Destination of the program's results, when it ends in a write.
    fn output(&self, source: &str) -> Result<Option<ProgramOutput>>;
}

/// The JSON read-spec program format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProgramResolver;

impl ProgramResolver for JsonProgramResolver {
    fn compile(&self, source: &str) -> Result<Arc<dyn Program>> {
        Ok(Arc::new(ReadProgram::parse(source)?))
    }

    fn output(&self, source: &str) -> Result<Option<ProgramOutput>> {
        Ok(ReadProgram::parse(source)?.output())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_storage::{ReadFilterSpec, TimeBounds};

    #[test]
    fn read_program_round_trips_through_source() {
        let program = ReadProgram::new(
            ReadSpec::Filter(ReadFilterSpec {
                org: OrgId(1),
                bucket: BucketId(2),
                bounds: TimeBounds::new(0, 10).unwrap(),
                predicate: None,
            }),
            Some(ProgramOutput {
                org: OrgId(1),
                bucket: BucketId(3),
            }),
        );
        let parsed = ReadProgram::parse(program.source()).unwrap();
        assert_eq!(parsed.output().unwrap().bucket, BucketId(3));
    }

    #[test]
    fn malformed_source_is_invalid_argument() {
        let err = ReadProgram::parse("not json").unwrap_err();
        assert_eq!(err.kind(), rill_common::ErrorKind::InvalidArgument);
    }
}
