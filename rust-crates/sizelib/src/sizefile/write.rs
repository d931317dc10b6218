// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Implements a writer for the `.size` file format.

use super::*;
use crate::models::{Container, SizeInfo};
use sha2::{Digest, Sha256};
use std::io::{self, Write as _};
use std::path::Path;

/// Size of the persistent write buffer.
const WRITE_BUF_CAPACITY: usize = 64 * 1024;

/// Writer for the `.size` file format.
///
/// Everything passed through the writer is hashed for the trailing checksum.
#[derive(Debug)]
pub struct Writer<O: io::Write> {
    out: O,
    hasher: Sha256,
    write_buf: Vec<u8>,
}

impl<O: io::Write> Writer<O> {
    /// Create a new writer that outputs into `out`.
    pub fn new(out: O) -> Self {
        Writer {
            out,
            hasher: Sha256::new(),
            write_buf: Vec::with_capacity(WRITE_BUF_CAPACITY),
        }
    }

    /// Write a complete size info.
    pub fn write(&mut self, info: &SizeInfo) -> Result {
        self.write_header(info)?;
        self.write_containers(&info.containers)?;
        self.write_symbols(info)?;

        put_leb128(&mut self.write_buf, info.clusters.len() as u64);
        for cluster in &info.clusters {
            put_leb128(&mut self.write_buf, u64::from(cluster.start));
            put_leb128(&mut self.write_buf, u64::from(cluster.count));
            self.write_buf.push(cluster.kind.id());
        }
        self.flush_buf()
    }

    /// Append the checksum and flush.
    ///
    /// Returns the output stream once all buffers are flushed.
    pub fn finalize(mut self) -> Result<O> {
        self.flush_buf()?;
        let digest = self.hasher.finalize();
        self.out.write_all(&digest)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_header(&mut self, info: &SizeInfo) -> Result {
        let mut header = format!("{COMMON_HEADER}\n{VERSION_PREFIX}{VERSION}\n");
        header += &format!(
            "{BUILD_CONFIG_KEY}={}\n",
            serde_json::to_string(&info.build_config)?
        );

        for (key, value) in &info.metadata {
            if key.is_empty() || key.contains(['=', '\n']) || key == BUILD_CONFIG_KEY {
                return Err(Error::InvalidKey(key.clone()));
            }
            header += &format!("{key}={}\n", serde_json::to_string(value)?);
        }

        header.push('\n');
        self.write_buf.extend_from_slice(header.as_bytes());
        self.flush_buf()
    }

    fn write_containers(&mut self, containers: &[Container]) -> Result {
        let buf = &mut self.write_buf;
        put_leb128(buf, containers.len() as u64);
        for container in containers {
            put_str(buf, &container.name);
            put_str(buf, container.kind.as_str());

            put_leb128(buf, container.metadata.len() as u64);
            for (key, value) in &container.metadata {
                put_str(buf, key);
                put_str(buf, value);
            }

            put_leb128(buf, container.section_sizes.len() as u64);
            for (section, size) in &container.section_sizes {
                buf.push(section.id());
                put_leb128(buf, *size);
            }
        }
        self.flush_buf()
    }

    fn write_symbols(&mut self, info: &SizeInfo) -> Result {
        // The pool has to precede the columns, so all strings are indexed
        // before anything is written.
        let mut pool = strpool::Builder::default();
        let refs: Vec<[strpool::Idx; 6]> = info
            .symbols
            .iter()
            .map(|sym| {
                [
                    &sym.full_name,
                    &sym.template_name,
                    &sym.name,
                    &sym.object_path,
                    &sym.source_path,
                    &sym.component,
                ]
                .map(|s| pool.index_for_str(s))
            })
            .collect();

        log::debug!(
            "string pool: {} strings, ~{} bytes",
            pool.len(),
            pool.size_estimate()
        );

        let table = pool.into_table();
        put_leb128(&mut self.write_buf, table.len() as u64);
        for s in &table {
            put_str(&mut self.write_buf, s);
            if self.write_buf.len() >= WRITE_BUF_CAPACITY {
                self.flush_buf()?;
            }
        }

        let segments = info.segments();
        put_leb128(&mut self.write_buf, segments.len() as u64);
        for seg in segments {
            let syms = &info.symbols[seg.range.clone()];
            let buf = &mut self.write_buf;
            put_leb128(buf, u64::from(seg.container));
            buf.push(seg.section.id());
            put_leb128(buf, syms.len() as u64);

            let mut prev = 0u64;
            for sym in syms {
                put_leb128(buf, zigzag_encode(sym.address.wrapping_sub(prev) as i64));
                prev = sym.address;
            }

            let mut prev = 0u64;
            for sym in syms {
                put_leb128(buf, zigzag_encode(sym.size_without_padding.wrapping_sub(prev) as i64));
                prev = sym.size_without_padding;
            }

            for sym in syms {
                put_leb128(buf, sym.padding);
            }

            for column in 0..6 {
                for sym_refs in &refs[seg.range.clone()] {
                    put_leb128(buf, u64::from(sym_refs[column]));
                }
            }

            for sym in syms {
                put_leb128(buf, u64::from(sym.flags.0));
            }

            self.flush_buf()?;
        }

        Ok(())
    }

    fn flush_buf(&mut self) -> Result {
        self.hasher.update(&self.write_buf);
        self.out.write_all(&self.write_buf)?;
        self.write_buf.clear();

        // Make sure the write buffer doesn't stay huge after a big segment.
        self.write_buf.shrink_to(WRITE_BUF_CAPACITY);

        Ok(())
    }
}

/// Serializes `info` into `out`.
pub fn write(info: &SizeInfo, out: impl io::Write) -> Result {
    let mut writer = Writer::new(out);
    writer.write(info)?;
    writer.finalize()?;
    Ok(())
}

/// Serializes `info` into the file at `path`.
///
/// The file is written to a temporary location next to `path` and only
/// moved into place once complete.
pub fn write_path(info: &SizeInfo, path: &Path) -> Result {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let temp = tempfile::NamedTempFile::new_in(dir)?;
    let mut out = io::BufWriter::new(temp);
    write(info, &mut out)?;

    let temp = out.into_inner().map_err(|e| Error::IO(e.into_error()))?;
    temp.persist(path).map_err(|e| Error::IO(e.error))?;

    log::info!("wrote {} symbols to {}", info.symbols.len(), path.display());
    Ok(())
}

/// Write an ULEB-128 encoded variable-length integer.
fn put_leb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Write a length-prefixed string.
fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_leb128(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128() {
        let encode = |v| {
            let mut buf = Vec::new();
            put_leb128(&mut buf, v);
            buf
        };
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(127), [0x7f]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(123456789), [0x95, 0x9a, 0xef, 0x3a]);
        assert_eq!(
            encode(u64::MAX),
            [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]
        );
    }

    #[test]
    fn invalid_metadata_key() {
        let mut info = SizeInfo::default();
        info.metadata.insert("a=b".into(), "c".into());
        let err = write(&info, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(k) if k == "a=b"));
    }

    #[test]
    fn deterministic() {
        let info = super::super::tests::make_test_info();
        let mut a = Vec::new();
        let mut b = Vec::new();
        write(&info, &mut a).unwrap();
        write(&info, &mut b).unwrap();
        assert_eq!(a, b);
    }
}
