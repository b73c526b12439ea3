//! # Temp Spill Files
//!
//! Per-group dosage rows spilled to disk between haplotype groups. Files are
//! created with the configured prefix and unlinked immediately after opening
//! so they are reclaimed on any exit path; rows are bgzf-compressed f32
//! vectors in output-record order, read back in lockstep during the merge.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use noodles::bgzf as bgzf_io;

use crate::error::{RemacError, Result};
use crate::io::msav::{read_f32, read_u32, write_f32, write_u32};

/// Writer half of one spill file.
pub struct TempDosageWriter {
    writer: bgzf_io::Writer<File>,
    rows: u64,
}

impl TempDosageWriter {
    /// Create an anonymous spill file next to `temp_prefix`.
    ///
    /// The path prefix contributes its directory and basename (mkstemp
    /// style); the file is unlinked as soon as it is open.
    pub fn create(temp_prefix: &Path, group_idx: usize) -> Result<Self> {
        let dir = temp_prefix.parent().filter(|p| !p.as_os_str().is_empty());
        let stem = temp_prefix
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("m4_");
        let named = tempfile::Builder::new()
            .prefix(&format!("{}{}_", stem, group_idx))
            .tempfile_in(dir.unwrap_or_else(|| Path::new("/tmp")))
            .map_err(RemacError::TempIo)?;
        // Drop the directory entry; the handle keeps the data alive.
        let file = named.into_file();
        Ok(Self {
            writer: bgzf_io::Writer::new(file),
            rows: 0,
        })
    }

    pub fn write_row(&mut self, values: &[f32]) -> Result<()> {
        write_u32(&mut self.writer, values.len() as u32).map_err(RemacError::TempIo)?;
        for &v in values {
            write_f32(&mut self.writer, v).map_err(RemacError::TempIo)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Finish compression and rewind for the merge.
    pub fn into_reader(self) -> Result<TempDosageReader> {
        let mut file = self.writer.finish().map_err(RemacError::TempIo)?;
        file.seek(SeekFrom::Start(0)).map_err(RemacError::TempIo)?;
        Ok(TempDosageReader {
            reader: bgzf_io::Reader::new(file),
            rows: self.rows,
        })
    }
}

/// Reader half, produced by `TempDosageWriter::into_reader`.
pub struct TempDosageReader {
    reader: bgzf_io::Reader<File>,
    rows: u64,
}

impl TempDosageReader {
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append the next row's values to `out`; false at end of file.
    pub fn read_row_into(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        let n = match read_u32(&mut self.reader) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(RemacError::TempIo(e)),
        };
        out.reserve(n as usize);
        for _ in 0..n {
            out.push(read_f32(&mut self.reader).map_err(RemacError::TempIo)?);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::{eov_f32, is_eov_f32};

    #[test]
    fn test_round_trip_rows() {
        let prefix = std::env::temp_dir().join("m4_");
        let mut w = TempDosageWriter::create(&prefix, 0).unwrap();
        w.write_row(&[0.0, 0.25, 1.0]).unwrap();
        w.write_row(&[0.5, eov_f32()]).unwrap();

        let mut r = w.into_reader().unwrap();
        assert_eq!(r.rows(), 2);

        let mut row = Vec::new();
        assert!(r.read_row_into(&mut row).unwrap());
        assert_eq!(row, vec![0.0, 0.25, 1.0]);

        row.clear();
        assert!(r.read_row_into(&mut row).unwrap());
        assert_eq!(row.len(), 2);
        assert_eq!(row[0], 0.5);
        assert!(is_eov_f32(row[1]));

        row.clear();
        assert!(!r.read_row_into(&mut row).unwrap());
    }
}
