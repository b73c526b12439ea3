//! # Legacy M3VCF Conversion
//!
//! `--update-m3vcf`: parse a legacy m3vcf (v1 or v2) reference panel and
//! rewrite it as the msav container, optionally annotating centimorgan
//! positions from a genetic map.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tracing::info;

use crate::config::Config;
use crate::data::block::UniqueHaplotypeBlock;
use crate::data::genetic_map::GeneticMapFile;
use crate::error::{RemacError, Result};
use crate::io::msav::{MsavHeader, MsavWriter};

pub fn run(config: &Config) -> Result<()> {
    convert_old_m3vcf(
        config.ref_path.as_ref().unwrap(),
        &config.out_path,
        config.map_path.as_deref(),
    )
}

/// Convert a legacy m3vcf file into the msav container.
pub fn convert_old_m3vcf(
    input_path: &Path,
    output_path: &Path,
    map_file_path: Option<&Path>,
) -> Result<()> {
    // Pre-pass: contig extents, so the output header carries real stats.
    let contigs = scan_contigs(input_path)?;

    let mut reader = open_gz_text(input_path)?;
    let mut line_no = 0usize;
    let sample_ids = read_m3vcf_header(&mut reader, &mut line_no, input_path)?;

    // The first block header reveals the version: v2 packs pipe-separated
    // haplotype pairs into each sample column.
    let mut pending: Option<(usize, String)> = None;
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        line_no += 1;
        if !line.trim().is_empty() {
            pending = Some((line_no, line.trim_end().to_string()));
            break;
        }
        line.clear();
    }
    let Some((first_no, first_line)) = pending else {
        return Err(RemacError::malformed("m3vcf file contains no blocks"));
    };
    let version: u8 = if first_line
        .split('\t')
        .skip(9)
        .any(|col| col.contains('|'))
    {
        2
    } else {
        1
    };
    info!(version, samples = sample_ids.len(), "reading legacy m3vcf");

    let mut lines = NumberedLines {
        reader,
        line_no: first_no,
        pending: Some((first_no, first_line)),
    };

    let mut map_file = match (map_file_path, contigs.first()) {
        (Some(p), Some((chrom, _))) => Some(GeneticMapFile::new(p, chrom)?),
        _ => None,
    };

    let mut writer: Option<MsavWriter<_>> = None;
    let mut n_haplotypes = 0usize;
    let mut n_blocks = 0usize;
    let mut n_variants = 0usize;

    while let Some(mut block) =
        UniqueHaplotypeBlock::deserialize_m3vcf(&mut lines, version, n_haplotypes)?
    {
        if n_haplotypes == 0 {
            n_haplotypes = block.expanded_haplotype_size();
            if sample_ids.is_empty() || n_haplotypes % sample_ids.len() != 0 {
                return Err(RemacError::malformed(
                    "m3vcf haplotype count is not a multiple of the sample count",
                ));
            }
            let ploidy = (n_haplotypes / sample_ids.len()) as u8;
            let header = MsavHeader {
                contigs: contigs.clone(),
                sample_ids: sample_ids.clone(),
                ploidies: vec![ploidy; sample_ids.len()],
            };
            writer = Some(MsavWriter::create(output_path, &header)?);
        }

        if let Some(map) = map_file.as_mut() {
            block.fill_cm(map);
        }

        writer.as_mut().unwrap().write_block(&block)?;
        n_blocks += 1;
        n_variants += block.variant_size();
    }

    let mut writer =
        writer.ok_or_else(|| RemacError::malformed("m3vcf file contains no blocks"))?;
    writer.finish()?;

    info!(
        blocks = n_blocks,
        variants = n_variants,
        "converted legacy reference panel"
    );
    Ok(())
}

struct NumberedLines {
    reader: Box<dyn BufRead + Send>,
    line_no: usize,
    pending: Option<(usize, String)>,
}

impl Iterator for NumberedLines {
    type Item = std::io::Result<(usize, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(p) = self.pending.take() {
            return Some(Ok(p));
        }
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(Ok((self.line_no, line.trim_end().to_string())));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn scan_contigs(path: &Path) -> Result<Vec<(String, u64)>> {
    let mut reader = open_gz_text(path)?;
    let mut contigs: Vec<(String, u64)> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split('\t');
        let chrom = fields.next().unwrap_or("");
        let Some(pos) = fields.next().and_then(|p| p.parse::<u64>().ok()) else {
            continue;
        };
        match contigs.iter_mut().find(|(name, _)| name == chrom) {
            Some((_, max)) => *max = (*max).max(pos),
            None => contigs.push((chrom.to_string(), pos)),
        }
    }
    if contigs.is_empty() {
        return Err(RemacError::malformed("m3vcf file contains no records"));
    }
    Ok(contigs)
}

fn read_m3vcf_header(
    reader: &mut Box<dyn BufRead + Send>,
    line_no: &mut usize,
    path: &Path,
) -> Result<Vec<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(RemacError::input_missing(
                path,
                "no #CHROM header line found",
            ));
        }
        *line_no += 1;
        if line.starts_with("#CHROM") {
            return Ok(line
                .trim_end()
                .split('\t')
                .skip(9)
                .map(|s| s.to_string())
                .collect());
        }
        if !line.starts_with('#') {
            return Err(RemacError::malformed_at(
                *line_no,
                "first sample line not found before records",
            ));
        }
    }
}

fn open_gz_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| RemacError::input_missing(path, e.to_string()))?;
    let gzipped = path
        .extension()
        .map(|e| e == "gz" || e == "bgz")
        .unwrap_or(false);
    Ok(if gzipped {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::msav::MsavReader;

    const M3VCF_V1: &str = "##fileformat=M3VCF\n\
        ##version=1.0\n\
        #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tH1\tH2\tH3\tH4\n\
        20\t100\t<BLOCK>\t.\t.\t.\t.\tVARIANTS=2;REPS=2\tGT\t0\t1\t0\t1\n\
        20\t100\trs1\tA\tT\t.\t.\tERR=0.01;RECOM=0.001\t01\n\
        20\t200\trs2\tC\tG\t.\t.\tERR=0.01;RECOM=0\t10\n";

    #[test]
    fn test_convert_v1() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("old.m3vcf");
        let output = dir.path().join("new.msav");
        std::fs::write(&input, M3VCF_V1).unwrap();

        convert_old_m3vcf(&input, &output, None).unwrap();

        let mut reader = MsavReader::open(&output).unwrap();
        assert_eq!(reader.header().contigs, vec![("20".to_string(), 200)]);
        assert_eq!(reader.header().n_haplotypes(), 4);

        let block = reader.read_block().unwrap().unwrap();
        assert_eq!(block.variant_size(), 2);
        assert_eq!(block.unique_map(), &[0, 1, 0, 1]);
        assert_eq!(block.variants()[0].gt, vec![0, 1]);
        assert_eq!(block.variants()[1].gt, vec![1, 0]);
        assert!(reader.read_block().unwrap().is_none());
    }

    #[test]
    fn test_convert_rejects_missing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("old.m3vcf");
        let output = dir.path().join("new.msav");
        std::fs::write(
            &input,
            "##fileformat=M3VCF\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tH1\n",
        )
        .unwrap();
        assert!(convert_old_m3vcf(&input, &output, None).is_err());
    }
}
