//! The row-source stream: a bit-packed log of `(source_num, skip_flag)`
//! per row the k-way merge consumed, in emission order.
//!
//! Written to a scratch file during the merge, replayed afterwards by the
//! column gatherer and the vector-index remapper, and finally persisted
//! verbatim into the new part for decoupled-index searches.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Highest source count one byte can address; the low 7 bits carry the
/// source number, the high bit is the skip flag.
pub const MAX_PARTS: usize = 0x7F;

const SKIP_FLAG_MASK: u8 = 0x80;
const SOURCE_NUM_MASK: u8 = 0x7F;

/// One record of the stream: "the next row read from source `source_num`
/// was emitted (skip = false) or discarded (skip = true)".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowSourcePart(u8);

impl RowSourcePart {
    pub fn new(source_num: usize) -> Self {
        debug_assert!(source_num <= MAX_PARTS);
        Self(source_num as u8 & SOURCE_NUM_MASK)
    }

    pub fn with_skip_flag(source_num: usize, skip: bool) -> Self {
        let mut part = Self::new(source_num);
        part.set_skip_flag(skip);
        part
    }

    pub fn source_num(self) -> usize {
        (self.0 & SOURCE_NUM_MASK) as usize
    }

    pub fn skip_flag(self) -> bool {
        self.0 & SKIP_FLAG_MASK != 0
    }

    pub fn set_skip_flag(&mut self, skip: bool) {
        if skip {
            self.0 |= SKIP_FLAG_MASK;
        } else {
            self.0 &= !SKIP_FLAG_MASK;
        }
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }
}

/// Buffered append-only writer of the stream.
pub(crate) struct RowSourcesWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    count: u64,
    hasher: crc32fast::Hasher,
}

impl RowSourcesWriter {
    pub(crate) fn create(path: &Path, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::with_capacity(buffer_size.max(64), File::create(path)?),
            path: path.to_path_buf(),
            count: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    pub(crate) fn write(&mut self, record: RowSourcePart) -> Result<()> {
        let byte = [record.as_byte()];
        self.writer.write_all(&byte)?;
        self.hasher.update(&byte);
        self.count += 1;
        Ok(())
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Flush, fsync and close the stream, handing back a replayable handle.
    pub(crate) fn finalize(mut self) -> Result<RowSourcesFile> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(RowSourcesFile {
            path: self.path,
            count: self.count,
            crc: self.hasher.finalize(),
        })
    }
}

/// A finalized stream on disk; can be replayed any number of times.
#[derive(Clone, Debug)]
pub(crate) struct RowSourcesFile {
    pub path: PathBuf,
    pub count: u64,
    crc: u32,
}

impl RowSourcesFile {
    pub(crate) fn open_reader(&self) -> Result<RowSourcesReader> {
        Ok(RowSourcesReader {
            reader: BufReader::new(File::open(&self.path)?),
            remaining: self.count,
            hasher: crc32fast::Hasher::new(),
            expected_crc: self.crc,
        })
    }
}

/// Sequential replay of a finalized stream. The CRC accumulated during the
/// merge is verified once the last record is consumed.
pub(crate) struct RowSourcesReader {
    reader: BufReader<File>,
    remaining: u64,
    hasher: crc32fast::Hasher,
    expected_crc: u32,
}

impl RowSourcesReader {
    pub(crate) fn next(&mut self) -> Result<Option<RowSourcePart>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte).map_err(|_| {
            Error::corrupted("row sources stream is shorter than its record count")
        })?;
        self.hasher.update(&byte);
        self.remaining -= 1;
        if self.remaining == 0 {
            let crc = std::mem::take(&mut self.hasher).finalize();
            if crc != self.expected_crc {
                return Err(Error::corrupted("row sources stream crc mismatch"));
            }
        }
        Ok(Some(RowSourcePart::from_byte(byte[0])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_packing() {
        let mut record = RowSourcePart::new(0x55);
        assert_eq!(record.source_num(), 0x55);
        assert!(!record.skip_flag());
        record.set_skip_flag(true);
        assert!(record.skip_flag());
        assert_eq!(record.source_num(), 0x55);
        record.set_skip_flag(false);
        assert_eq!(record.as_byte(), 0x55);
        assert_eq!(
            RowSourcePart::with_skip_flag(3, true).as_byte(),
            0x83
        );
    }

    #[test]
    fn write_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows_sources");
        let mut writer = RowSourcesWriter::create(&path, 4096).unwrap();
        let records = [
            RowSourcePart::with_skip_flag(0, false),
            RowSourcePart::with_skip_flag(1, true),
            RowSourcePart::with_skip_flag(2, false),
        ];
        for record in records {
            writer.write(record).unwrap();
        }
        assert_eq!(writer.count(), 3);
        let file = writer.finalize().unwrap();

        for _ in 0..2 {
            let mut reader = file.open_reader().unwrap();
            let mut replayed = Vec::new();
            while let Some(record) = reader.next().unwrap() {
                replayed.push(record);
            }
            assert_eq!(replayed, records);
        }
    }

    #[test]
    fn truncation_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows_sources");
        let mut writer = RowSourcesWriter::create(&path, 4096).unwrap();
        for i in 0..10 {
            writer.write(RowSourcePart::new(i)).unwrap();
        }
        let file = writer.finalize().unwrap();
        std::fs::write(&path, [0u8; 4]).unwrap();

        let mut reader = file.open_reader().unwrap();
        let outcome = std::iter::from_fn(|| reader.next().transpose())
            .collect::<Result<Vec<_>>>();
        assert!(outcome.is_err());
    }
}
