//! Chunked, filtered reader over the edge stream.
//!
//! The stream is a delimited text file with a header row naming `src`
//! (or `clId1`), `dst` (or `clId2`), `txId` and `feat_1..feat_F` (or
//! `feat#1..feat#F`). Header names and data fields may be wrapped in double
//! quotes; a quoted field must not contain a comma. Rows are consumed in file
//! order, `chunk_size` at a time.
//! Every data row, parseable or not, takes one ordinal so that chunk boundaries
//! and row identities are stable across runs.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::types::{
    EdgeRecord, EntityId, EntityIndex, RowOutcome, SkipCounts, SkipReason, StreamRow,
};

const READ_BUFFER_BYTES: usize = 1 << 20;

/// Column positions resolved from the stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    src: usize,
    dst: usize,
    tx_id: usize,
    features: Vec<usize>,
    columns: usize,
}

impl StreamSchema {
    pub fn from_header(header: &str, feature_width: usize) -> Result<Self> {
        let names: Vec<&str> = header
            .trim_end_matches(['\r', '\n'])
            .split(',')
            .map(|name| name.trim().trim_matches('"'))
            .collect();
        let find = |column: &str, aliases: &[&str]| {
            names
                .iter()
                .position(|name| aliases.contains(name))
                .ok_or_else(|| PipelineError::InvalidStreamHeader {
                    reason: format!("missing {column} column (accepted: {aliases:?})"),
                })
        };
        let src = find("source", &["src", "clId1"])?;
        let dst = find("destination", &["dst", "clId2"])?;
        let tx_id = find("transaction", &["txId", "tx_id"])?;

        let mut numbered: Vec<(u32, usize)> = names
            .iter()
            .enumerate()
            .filter_map(|(column, name)| feature_number(name).map(|number| (number, column)))
            .collect();
        numbered.sort_unstable();
        if numbered.len() != feature_width {
            return Err(PipelineError::InvalidStreamHeader {
                reason: format!(
                    "expected {feature_width} feature columns, found {}",
                    numbered.len()
                ),
            });
        }
        for (expected, (number, _)) in (1u32..).zip(&numbered) {
            if *number != expected {
                return Err(PipelineError::InvalidStreamHeader {
                    reason: format!("feature columns not numbered 1..={feature_width}: missing {expected}"),
                });
            }
        }

        Ok(Self {
            src,
            dst,
            tx_id,
            features: numbered.into_iter().map(|(_, column)| column).collect(),
            columns: names.len(),
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn feature_width(&self) -> usize {
        self.features.len()
    }

    /// Parse one raw line. Features are only parsed when an endpoint is a target,
    /// so feature-level defects in irrelevant rows are not reported.
    pub fn parse_row(
        &self,
        line: &[u8],
        bounds: &mut Vec<(usize, usize)>,
        targets: &EntityIndex,
    ) -> RowOutcome {
        let line = trim_line_end(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return RowOutcome::Skipped(SkipReason::Blank);
        }
        let Ok(text) = std::str::from_utf8(line) else {
            return RowOutcome::Skipped(SkipReason::InvalidUtf8);
        };

        bounds.clear();
        let mut start = 0;
        for comma in memchr::memchr_iter(b',', line) {
            bounds.push((start, comma));
            start = comma + 1;
        }
        bounds.push((start, line.len()));
        if bounds.len() != self.columns {
            return RowOutcome::Skipped(SkipReason::FieldCount {
                expected: self.columns,
                found: bounds.len(),
            });
        }

        let field = |column: usize| {
            let (from, to) = bounds[column];
            text[from..to].trim().trim_matches('"')
        };
        let (Ok(src), Ok(dst)) = (field(self.src).parse::<u64>(), field(self.dst).parse::<u64>())
        else {
            return RowOutcome::Skipped(SkipReason::InvalidEntityId);
        };
        let Ok(tx_id) = field(self.tx_id).parse::<u64>() else {
            return RowOutcome::Skipped(SkipReason::InvalidTxId);
        };
        let (src, dst) = (EntityId(src), EntityId(dst));
        if !targets.contains(src) && !targets.contains(dst) {
            return RowOutcome::Irrelevant;
        }

        let mut features = Vec::with_capacity(self.features.len());
        for &column in &self.features {
            match field(column).parse::<f32>() {
                Ok(value) if value.is_finite() => features.push(value),
                Ok(_) => return RowOutcome::Skipped(SkipReason::NonFiniteFeature { column }),
                Err(_) => return RowOutcome::Skipped(SkipReason::InvalidFeature { column }),
            }
        }
        RowOutcome::Parsed(EdgeRecord {
            src,
            dst,
            tx_id,
            features,
        })
    }
}

fn feature_number(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix("feat_")
        .or_else(|| name.strip_prefix("feat#"))?;
    digits.parse().ok().filter(|number| *number > 0)
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Up to `chunk_size` consecutive stream rows, with the qualifying ones parsed.
#[derive(Debug, Clone, Default)]
pub struct EdgeChunk {
    /// 1-based chunk number.
    pub index: u64,
    pub first_ordinal: u64,
    pub rows_read: u64,
    pub rows_irrelevant: u64,
    /// Rows touching at least one target entity, in stream order.
    pub records: Vec<StreamRow>,
    pub skipped: SkipCounts,
    /// Byte offset just past the chunk's last row.
    pub end_offset: u64,
}

/// Lazily yields [`EdgeChunk`]s. Restart granularity is one whole chunk.
#[derive(Debug)]
pub struct StreamScanner {
    path: PathBuf,
    reader: BufReader<fs_err::File>,
    schema: StreamSchema,
    targets: Arc<EntityIndex>,
    chunk_size: usize,
    data_start: u64,
    offset: u64,
    next_index: u64,
    next_ordinal: u64,
    line: Vec<u8>,
    bounds: Vec<(usize, usize)>,
    exhausted: bool,
}

impl StreamScanner {
    /// Open the stream and resolve its header. Failure here is fatal for the run.
    pub fn open(
        path: &Path,
        chunk_size: usize,
        feature_width: usize,
        targets: Arc<EntityIndex>,
    ) -> Result<Self> {
        let file = fs_err::File::open(path)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        let mut header = Vec::new();
        let read = reader.read_until(b'\n', &mut header)?;
        if read == 0 {
            return Err(PipelineError::InvalidStreamHeader {
                reason: format!("{} is empty", path.display()),
            });
        }
        let header_text =
            std::str::from_utf8(&header).map_err(|_| PipelineError::InvalidStreamHeader {
                reason: "header is not valid UTF-8".into(),
            })?;
        let schema = StreamSchema::from_header(header_text, feature_width)?;
        tracing::debug!(
            target: "edgeseq::scan",
            path = %path.display(),
            columns = schema.columns(),
            features = schema.feature_width(),
            "edge stream opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            schema,
            targets,
            chunk_size,
            data_start: read as u64,
            offset: read as u64,
            next_index: 1,
            next_ordinal: 0,
            line: Vec::new(),
            bounds: Vec::new(),
            exhausted: false,
        })
    }

    /// Continue from a checkpointed position instead of the first data row.
    pub fn resume_at(&mut self, offset: u64, next_index: u64, next_ordinal: u64) -> Result<()> {
        let len = self.reader.get_ref().metadata()?.len();
        if offset < self.data_start || offset > len {
            return Err(PipelineError::CheckpointMismatch {
                reason: format!(
                    "stream offset {offset} outside data region {}..={len} of {}",
                    self.data_start,
                    self.path.display()
                ),
            });
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        self.next_index = next_index;
        self.next_ordinal = next_ordinal;
        self.exhausted = false;
        Ok(())
    }

    pub fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_chunk(&mut self) -> Result<Option<EdgeChunk>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut chunk = EdgeChunk {
            index: self.next_index,
            first_ordinal: self.next_ordinal,
            ..EdgeChunk::default()
        };
        while chunk.rows_read < self.chunk_size as u64 {
            self.line.clear();
            let read = self.reader.read_until(b'\n', &mut self.line)?;
            if read == 0 {
                self.exhausted = true;
                break;
            }
            self.offset += read as u64;
            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            chunk.rows_read += 1;

            match self
                .schema
                .parse_row(&self.line, &mut self.bounds, &self.targets)
            {
                RowOutcome::Parsed(record) => chunk.records.push(StreamRow { ordinal, record }),
                RowOutcome::Irrelevant => chunk.rows_irrelevant += 1,
                RowOutcome::Skipped(reason) => {
                    tracing::debug!(target: "edgeseq::scan", ordinal, %reason, "row skipped");
                    chunk.skipped.record(reason);
                }
            }
        }
        if chunk.rows_read == 0 {
            return Ok(None);
        }
        chunk.end_offset = self.offset;
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

impl Iterator for StreamScanner {
    type Item = Result<EdgeChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
