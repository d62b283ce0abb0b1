//! # Scan Streaming
//!
//! Packs filtered rows into cell-chunk frames. Each chunk carries one cell;
//! the row key, family name and qualifier appear only when they differ from
//! the previous chunk, and the last chunk of every row carries the
//! commit-row marker.

use crate::data::Row;
use nimbus_core::Result;
use serde::{Deserialize, Serialize};

/// Send a new frame once the accumulated chunk count exceeds this.
pub const MAX_CHUNKS_PER_FRAME: usize = 1024;

/// One cell of a streamed read, with sparse row/family/qualifier updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<Vec<u8>>,
    pub timestamp_micros: i64,
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub commit_row: bool,
}

/// One frame of a streaming read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRowsResponse {
    pub chunks: Vec<CellChunk>,
}

/// One frame of a sample-row-keys stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRowKeysResponse {
    pub row_key: Vec<u8>,
    pub offset_bytes: i64,
}

/// Receives response frames from a streaming operation. The transport
/// adapter implements this against its wire; tests collect frames in a
/// [`VecSink`].
pub trait FrameSink<T> {
    fn send(&mut self, frame: T) -> Result<()>;
}

/// A sink that collects frames in memory.
#[derive(Debug, Default)]
pub struct VecSink<T> {
    pub frames: Vec<T>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<T> FrameSink<T> for VecSink<T> {
    fn send(&mut self, frame: T) -> Result<()> {
        self.frames.push(frame);
        Ok(())
    }
}

/// Accumulates cell chunks across rows until a frame is sent.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    pub chunks: Vec<CellChunk>,
}

impl ChunkBuilder {
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    /// Emit the row's cells in row → family → column order. The caller has
    /// already scrubbed the row. Returns whether the row counts toward the
    /// row limit.
    pub fn add(&mut self, row: &Row) -> bool {
        let first_new = self.chunks.len();
        let mut new_row = true;
        for fam in &row.families {
            let mut new_fam = true;
            for col in &fam.columns {
                let mut new_col = true;
                for cell in &col.cells {
                    let mut chunk = CellChunk {
                        timestamp_micros: cell.timestamp_micros,
                        value: cell.value.clone(),
                        labels: cell.labels.clone(),
                        ..Default::default()
                    };
                    if new_row {
                        chunk.row_key = Some(row.key.clone());
                        new_row = false;
                    }
                    if new_fam {
                        chunk.family_name = Some(fam.name.clone());
                        new_fam = false;
                    }
                    if new_col {
                        chunk.qualifier = Some(col.qualifier.clone());
                        new_col = false;
                    }
                    self.chunks.push(chunk);
                }
            }
        }
        // A chunk with only commit-row set would imply a new empty cell, so
        // the marker rides on the row's last real chunk.
        if self.chunks.len() > first_new {
            self.chunks.last_mut().unwrap().commit_row = true;
        }
        true
    }

    pub fn should_flush(&self) -> bool {
        self.chunks.len() > MAX_CHUNKS_PER_FRAME
    }

    /// Drain the accumulated chunks into a frame.
    pub fn take_frame(&mut self) -> ReadRowsResponse {
        ReadRowsResponse { chunks: std::mem::take(&mut self.chunks) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Cell;

    fn sample_row() -> Row {
        let mut row = Row::new(b"row1".to_vec());
        {
            let fam = row.ensure_family("cf1");
            let col = fam.ensure_column(b"a");
            col.append_or_replace_cell(Cell::new(1000, b"v1".to_vec()));
            col.append_or_replace_cell(Cell::new(2000, b"v2".to_vec()));
            fam.ensure_column(b"b").append_or_replace_cell(Cell::new(1000, b"v3".to_vec()));
        }
        row.ensure_family("cf2")
            .ensure_column(b"a")
            .append_or_replace_cell(Cell::new(1000, b"v4".to_vec()));
        row
    }

    #[test]
    fn test_sparse_fields() {
        let mut cb = ChunkBuilder::default();
        cb.add(&sample_row());
        let chunks = &cb.chunks;
        assert_eq!(chunks.len(), 4);

        // Row key only on the first chunk of the row.
        assert_eq!(chunks[0].row_key.as_deref(), Some(b"row1".as_slice()));
        assert!(chunks[1].row_key.is_none());

        // Family only when it changes.
        assert_eq!(chunks[0].family_name.as_deref(), Some("cf1"));
        assert!(chunks[1].family_name.is_none());
        assert_eq!(chunks[3].family_name.as_deref(), Some("cf2"));

        // Qualifier only when it changes; cells of one column share it.
        assert_eq!(chunks[0].qualifier.as_deref(), Some(b"a".as_slice()));
        assert!(chunks[1].qualifier.is_none());
        assert_eq!(chunks[2].qualifier.as_deref(), Some(b"b".as_slice()));

        // Descending timestamps within the column.
        assert_eq!(chunks[0].timestamp_micros, 2000);
        assert_eq!(chunks[1].timestamp_micros, 1000);
    }

    #[test]
    fn test_commit_row_on_last_chunk_only() {
        let mut cb = ChunkBuilder::default();
        cb.add(&sample_row());
        let commits: Vec<bool> = cb.chunks.iter().map(|c| c.commit_row).collect();
        assert_eq!(commits, vec![false, false, false, true]);
    }

    #[test]
    fn test_multiple_rows_in_one_frame() {
        let mut cb = ChunkBuilder::default();
        cb.add(&sample_row());
        let mut second = sample_row();
        second.key = b"row2".to_vec();
        cb.add(&second);

        assert_eq!(cb.chunks.len(), 8);
        assert_eq!(cb.chunks[4].row_key.as_deref(), Some(b"row2".as_slice()));
        assert!(cb.chunks[3].commit_row);
        assert!(cb.chunks[7].commit_row);

        let frame = cb.take_frame();
        assert_eq!(frame.chunks.len(), 8);
        assert!(cb.chunks.is_empty());
    }
}
