//! # MSAV Container
//!
//! The modern blocked reference container: a bgzf stream holding a small
//! header (contigs, samples, ploidies) followed by serialized
//! unique-haplotype blocks. Each block is written as one boundary record
//! carrying the unique map, then its per-column variant records (`AC`, `AN`,
//! `ERR`, `RECOM`, `CM`, genotypes). The writer flushes the bgzf stream at
//! every block boundary so physical compression blocks coincide with
//! haplotype blocks.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use noodles::bgzf as bgzf_io;

use crate::data::block::{UniqueHaplotypeBlock, UNIQUE_MAP_EOV};
use crate::data::variant::{ReferenceSiteInfo, ReferenceVariant};
use crate::error::{RemacError, Result};

const MAGIC: &[u8; 4] = b"MSAV";
const FORMAT_VERSION: u8 = 1;

const REC_END: u8 = 0;
const REC_BLOCK: u8 = 1;

/// Map sentinel on the wire.
const WIRE_EOV: u32 = u32::MAX;

/// Container-level metadata.
#[derive(Clone, Debug, Default)]
pub struct MsavHeader {
    /// Contig names with their largest end position.
    pub contigs: Vec<(String, u64)>,
    pub sample_ids: Vec<String>,
    /// Per-sample haplotype count (expanded slots, in sample order).
    pub ploidies: Vec<u8>,
}

impl MsavHeader {
    /// Total expanded haplotype slots.
    pub fn n_haplotypes(&self) -> usize {
        self.ploidies.iter().map(|&p| p as usize).sum()
    }

    /// Expanded slot range of one sample.
    pub fn sample_slots(&self, sample_idx: usize) -> std::ops::Range<usize> {
        let start: usize = self.ploidies[..sample_idx]
            .iter()
            .map(|&p| p as usize)
            .sum();
        start..start + self.ploidies[sample_idx] as usize
    }
}

/// Streaming reader over an msav file.
#[derive(Debug)]
pub struct MsavReader<R: Read> {
    reader: R,
    header: MsavHeader,
}

impl MsavReader<bgzf_io::Reader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| RemacError::input_missing(path, e.to_string()))?;
        Self::from_reader(bgzf_io::Reader::new(file))
    }
}

impl<R: Read> MsavReader<R> {
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| RemacError::malformed("not an msav file (truncated magic)"))?;
        if &magic != MAGIC {
            return Err(RemacError::malformed(
                "not an msav file (bad magic); legacy m3vcf files must be converted with --update-m3vcf first",
            ));
        }
        let version = read_u8(&mut reader)?;
        if version != FORMAT_VERSION {
            return Err(RemacError::malformed(format!(
                "unsupported msav version {}",
                version
            )));
        }

        let n_contigs = read_u32(&mut reader)? as usize;
        let mut contigs = Vec::with_capacity(n_contigs);
        for _ in 0..n_contigs {
            let name = read_string(&mut reader)?;
            let len = read_u64(&mut reader)?;
            contigs.push((name, len));
        }

        let n_samples = read_u32(&mut reader)? as usize;
        let mut sample_ids = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            sample_ids.push(read_string(&mut reader)?);
        }
        let mut ploidies = vec![0u8; n_samples];
        reader.read_exact(&mut ploidies)?;

        Ok(Self {
            reader,
            header: MsavHeader {
                contigs,
                sample_ids,
                ploidies,
            },
        })
    }

    pub fn header(&self) -> &MsavHeader {
        &self.header
    }

    /// Read the next haplotype block, or `None` at end of data.
    pub fn read_block(&mut self) -> Result<Option<UniqueHaplotypeBlock>> {
        let rec = match read_u8(&mut self.reader) {
            Ok(r) => r,
            Err(_) => return Ok(None), // clean EOF without end marker
        };
        match rec {
            REC_END => Ok(None),
            REC_BLOCK => self.read_block_body().map(Some),
            other => Err(RemacError::malformed(format!(
                "unknown msav record type {}",
                other
            ))),
        }
    }

    fn read_block_body(&mut self) -> Result<UniqueHaplotypeBlock> {
        let chrom = read_string(&mut self.reader)?;
        let n_variants = read_u32(&mut self.reader)? as usize;
        let n_reps = read_u32(&mut self.reader)? as usize;
        let n_haps = read_u32(&mut self.reader)? as usize;

        let mut unique_map = Vec::with_capacity(n_haps);
        for _ in 0..n_haps {
            let v = read_u32(&mut self.reader)?;
            unique_map.push(if v == WIRE_EOV {
                UNIQUE_MAP_EOV
            } else {
                v as i64
            });
        }

        let mut variants = Vec::with_capacity(n_variants);
        for _ in 0..n_variants {
            let pos = read_u32(&mut self.reader)?;
            let id = read_string(&mut self.reader)?;
            let ref_allele = read_string(&mut self.reader)?;
            let alt_allele = read_string(&mut self.reader)?;
            let err = f32::from_le_bytes(read_array(&mut self.reader)?);
            let recom = f32::from_le_bytes(read_array(&mut self.reader)?);
            let cm = f64::from_le_bytes(read_array(&mut self.reader)?);
            let mut gt = vec![0u8; n_reps];
            self.reader.read_exact(&mut gt)?;
            let gt: Vec<i8> = gt.into_iter().map(|b| b as i8).collect();
            let site =
                ReferenceSiteInfo::new(chrom.clone(), pos, id, ref_allele, alt_allele, err, recom, cm);
            variants.push(ReferenceVariant::new(site, 0, gt));
        }

        UniqueHaplotypeBlock::from_parts(unique_map, variants)
    }
}

/// Writer producing an msav stream.
pub struct MsavWriter<W: Write> {
    writer: W,
    finished: bool,
}

impl MsavWriter<bgzf_io::Writer<File>> {
    pub fn create(path: &Path, header: &MsavHeader) -> Result<Self> {
        let file = File::create(path).map_err(RemacError::OutputIo)?;
        Self::from_writer(bgzf_io::Writer::new(file), header)
    }
}

impl<W: Write> MsavWriter<W> {
    pub fn from_writer(mut writer: W, header: &MsavHeader) -> Result<Self> {
        writer.write_all(MAGIC)?;
        write_u8(&mut writer, FORMAT_VERSION)?;
        write_u32(&mut writer, header.contigs.len() as u32)?;
        for (name, len) in &header.contigs {
            write_string(&mut writer, name)?;
            write_u64(&mut writer, *len)?;
        }
        write_u32(&mut writer, header.sample_ids.len() as u32)?;
        for id in &header.sample_ids {
            write_string(&mut writer, id)?;
        }
        writer.write_all(&header.ploidies)?;
        Ok(Self {
            writer,
            finished: false,
        })
    }

    /// Serialize one haplotype block; empty blocks are skipped.
    pub fn write_block(&mut self, block: &UniqueHaplotypeBlock) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        write_u8(&mut self.writer, REC_BLOCK)?;
        write_string(&mut self.writer, &block.variants()[0].site.chrom)?;
        write_u32(&mut self.writer, block.variant_size() as u32)?;
        write_u32(&mut self.writer, block.unique_haplotype_size() as u32)?;
        write_u32(&mut self.writer, block.expanded_haplotype_size() as u32)?;
        for &u in block.unique_map() {
            let v = if u == UNIQUE_MAP_EOV {
                WIRE_EOV
            } else {
                u as u32
            };
            write_u32(&mut self.writer, v)?;
        }
        for v in block.variants() {
            write_u32(&mut self.writer, v.site.pos)?;
            write_string(&mut self.writer, &v.site.id)?;
            write_string(&mut self.writer, &v.site.ref_allele)?;
            write_string(&mut self.writer, &v.site.alt_allele)?;
            self.writer.write_all(&v.site.err.to_le_bytes())?;
            self.writer.write_all(&v.site.recom.to_le_bytes())?;
            self.writer.write_all(&v.site.cm.to_le_bytes())?;
            let gt: Vec<u8> = v.gt.iter().map(|&g| g as u8).collect();
            self.writer.write_all(&gt)?;
        }
        // Align the physical compression boundary with the block boundary.
        self.writer.flush()?;
        Ok(true)
    }

    /// Write the end marker and flush.
    pub fn finish(&mut self) -> Result<()> {
        if !self.finished {
            write_u8(&mut self.writer, REC_END)?;
            self.writer.flush()?;
            self.finished = true;
        }
        Ok(())
    }
}

impl<W: Write> Drop for MsavWriter<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

// Little-endian primitives shared by the container readers and writers.

pub(crate) fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub(crate) fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

pub(crate) fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

pub(crate) fn read_array<const N: usize>(r: &mut impl Read) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn read_string(r: &mut impl Read) -> std::io::Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid utf-8"))
}

pub(crate) fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

pub(crate) fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_f32(w: &mut impl Write, v: f32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn read_f32(r: &mut impl Read) -> std::io::Result<f32> {
    Ok(f32::from_le_bytes(read_array(r)?))
}

pub(crate) fn write_string(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::GT_EOV;
    use std::io::Cursor;

    fn sample_block() -> UniqueHaplotypeBlock {
        let mut block = UniqueHaplotypeBlock::new();
        let mk = |pos: u32| {
            ReferenceSiteInfo::new("chr7", pos, format!("rs{}", pos), "A", "T", 0.013, 0.002, 1.25)
        };
        assert!(block.compress_variant(&mk(100), &[0, 1, 0, 1, GT_EOV]));
        assert!(block.compress_variant(&mk(200), &[0, 1, 1, 1, GT_EOV]));
        assert!(block.compress_variant(&mk(300), &[1, 0, 1, 0, GT_EOV]));
        block
    }

    fn header() -> MsavHeader {
        MsavHeader {
            contigs: vec![("chr7".to_string(), 159_345_973)],
            sample_ids: vec!["S1".into(), "S2".into(), "S3".into()],
            ploidies: vec![2, 2, 1],
        }
    }

    #[test]
    fn test_round_trip_bit_exact() {
        let block = sample_block();
        let header = header();

        let mut buf = Vec::new();
        {
            let mut w = MsavWriter::from_writer(&mut buf, &header).unwrap();
            assert!(w.write_block(&block).unwrap());
            w.finish().unwrap();
        }

        let mut r = MsavReader::from_reader(Cursor::new(buf)).unwrap();
        assert_eq!(r.header().sample_ids, header.sample_ids);
        assert_eq!(r.header().ploidies, header.ploidies);
        assert_eq!(r.header().n_haplotypes(), 5);
        assert_eq!(r.header().contigs, header.contigs);

        let got = r.read_block().unwrap().unwrap();
        assert_eq!(got.unique_map(), block.unique_map());
        assert_eq!(got.cardinalities(), block.cardinalities());
        assert_eq!(got.variant_size(), block.variant_size());
        for (a, b) in got.variants().iter().zip(block.variants()) {
            assert_eq!(a.site.pos, b.site.pos);
            assert_eq!(a.site.id, b.site.id);
            assert_eq!(a.site.ref_allele, b.site.ref_allele);
            assert_eq!(a.site.alt_allele, b.site.alt_allele);
            assert_eq!(a.site.err.to_bits(), b.site.err.to_bits());
            assert_eq!(a.site.recom.to_bits(), b.site.recom.to_bits());
            assert_eq!(a.site.cm.to_bits(), b.site.cm.to_bits());
            assert_eq!(a.gt, b.gt);
            assert_eq!(a.ac, b.ac);
        }

        assert!(r.read_block().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_mentions_conversion() {
        let err = MsavReader::from_reader(Cursor::new(b"##fileformat=VCF".to_vec())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--update-m3vcf"), "got: {}", msg);
    }

    #[test]
    fn test_sample_slots() {
        let h = header();
        assert_eq!(h.sample_slots(0), 0..2);
        assert_eq!(h.sample_slots(2), 4..5);
    }
}
