//! Per-file content checksums.
//!
//! Every data file of a part is recorded as `(name, size, 128-bit hash)`;
//! vector-index segments get their own checksum files with the same format.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};

pub const CHECKSUMS_FILE_NAME: &str = "checksums.txt";
const FORMAT_HEADER: &str = "checksums format version: 1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileChecksum {
    pub size: u64,
    pub hash: u128,
}

/// Ordered map of file name to checksum.
#[derive(Clone, Debug, Default)]
pub struct Checksums {
    pub files: BTreeMap<String, FileChecksum>,
}

impl Checksums {
    pub fn add_file(&mut self, name: impl Into<String>, size: u64, hash: u128) {
        self.files.insert(name.into(), FileChecksum { size, hash });
    }

    /// Merge another checksum set into this one.
    pub fn add(&mut self, other: Checksums) {
        self.files.extend(other.files);
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|c| c.size).sum()
    }

    pub fn file_size(&self, name: &str) -> Option<u64> {
        self.files.get(name).map(|c| c.size)
    }

    pub fn write_to(&self, dir: &Path, file_name: &str) -> Result<()> {
        let mut out = File::create(dir.join(file_name))?;
        writeln!(out, "{}", FORMAT_HEADER)?;
        for (name, sum) in &self.files {
            writeln!(out, "{}\t{}\t{:032x}", name, sum.size, sum.hash)?;
        }
        out.sync_all()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Checksums> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        match lines.next() {
            Some(Ok(header)) if header == FORMAT_HEADER => {}
            _ => {
                return Err(Error::corrupted(format!(
                    "bad checksums header in {}",
                    path.display()
                )))
            }
        }
        let mut checksums = Checksums::default();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let (name, size, hash) = match (fields.next(), fields.next(), fields.next()) {
                (Some(n), Some(s), Some(h)) => (n, s, h),
                _ => {
                    return Err(Error::corrupted(format!(
                        "malformed checksums line in {}",
                        path.display()
                    )))
                }
            };
            let size = size
                .parse::<u64>()
                .map_err(|_| Error::corrupted("bad size in checksums file"))?;
            let hash = u128::from_str_radix(hash, 16)
                .map_err(|_| Error::corrupted("bad hash in checksums file"))?;
            checksums.add_file(name, size, hash);
        }
        Ok(checksums)
    }
}

/// Hashes everything that passes through it while reading.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Xxh3,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn digest(&self) -> u128 {
        self.hasher.digest128()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Hash a whole file, returning `(size, hash)`.
pub fn hash_file(path: &Path) -> Result<(u64, u128)> {
    let mut reader = HashingReader::new(BufReader::new(File::open(path)?));
    std::io::copy(&mut reader, &mut std::io::sink())?;
    Ok((reader.count(), reader.digest()))
}
