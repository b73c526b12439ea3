//! # Reference Panel Compression
//!
//! `--compress-reference`: stream a phased VCF reference panel into
//! unique-haplotype blocks and write the msav container. Blocks are flushed
//! under the compression-ratio heuristic; consecutive blocks overlap by one
//! variant so junction probabilities can be carried across boundaries.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use noodles::bgzf as bgzf_io;
use tracing::info;

use crate::config::Config;
use crate::data::block::UniqueHaplotypeBlock;
use crate::data::variant::ReferenceSiteInfo;
use crate::error::{RemacError, Result};
use crate::io::msav::{MsavHeader, MsavWriter};

pub fn run(config: &Config) -> Result<()> {
    let input = config.ref_path.as_ref().unwrap();
    compress_reference_panel(
        input,
        &config.out_path,
        config.min_block_size,
        config.max_block_size,
        config.slope_unit,
    )
}

/// Compress a phased VCF/VCF.gz reference panel into msav blocks.
pub fn compress_reference_panel(
    input_path: &Path,
    output_path: &Path,
    min_block_size: usize,
    max_block_size: usize,
    slope_unit: usize,
) -> Result<()> {
    // Stats pre-pass: contig extents for the header, so downstream region
    // resolution never has to guess.
    let (contigs, sample_ids) = scan_panel(input_path)?;
    if sample_ids.is_empty() {
        return Err(RemacError::malformed("reference panel lists no samples"));
    }

    let mut reader = open_text(input_path)?;
    skip_header(&mut reader)?;

    let mut header = MsavHeader {
        contigs,
        sample_ids,
        ploidies: Vec::new(),
    };

    let mut block = UniqueHaplotypeBlock::new();
    let mut last_cr = f32::MAX;
    let mut last_site: Option<(ReferenceSiteInfo, Vec<i8>)> = None;
    let mut writer: Option<MsavWriter<bgzf_io::Writer<File>>> = None;
    let mut n_variants = 0usize;
    let mut n_blocks = 0usize;

    let mut line = String::new();
    let mut line_no = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_no += 1;
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() < 10 {
            return Err(RemacError::malformed_at(line_no, "record has no samples"));
        }
        let pos: u32 = fields[1]
            .parse()
            .map_err(|_| RemacError::malformed_at(line_no, "non-numeric POS"))?;
        let gt_idx = fields[8]
            .split(':')
            .position(|f| f == "GT")
            .ok_or_else(|| RemacError::malformed_at(line_no, "no GT field in FORMAT"))?;

        // Expanded alleles; the panel must be fully phased and complete.
        let mut raw: Vec<i16> = Vec::new();
        let mut ploidies: Vec<u8> = Vec::new();
        for sample_field in &fields[9..] {
            let gt = sample_field.split(':').nth(gt_idx).unwrap_or(".");
            if gt.contains('/') {
                return Err(RemacError::malformed_at(
                    line_no,
                    "reference panel genotypes must be phased",
                ));
            }
            let mut count = 0u8;
            for a in gt.split('|') {
                let allele: i16 = a.parse().map_err(|_| {
                    RemacError::malformed_at(line_no, "missing or non-numeric reference allele")
                })?;
                raw.push(allele);
                count += 1;
            }
            ploidies.push(count);
        }
        if header.ploidies.is_empty() {
            header.ploidies = ploidies;
        }

        let alt_alleles: Vec<&str> = fields[4].split(',').collect();
        for (alt_idx, alt) in alt_alleles.iter().enumerate() {
            if *alt == "." || alt.is_empty() {
                continue;
            }
            let wanted = (alt_idx + 1) as i16;
            let alleles: Vec<i8> = raw.iter().map(|&a| i8::from(a == wanted)).collect();
            let site = ReferenceSiteInfo::new(
                fields[0].to_string(),
                pos,
                if fields[2] == "." { String::new() } else { fields[2].to_string() },
                fields[3].to_string(),
                alt.to_string(),
                f32::NAN,
                f32::NAN,
                f64::NAN,
            );

            if writer.is_none() {
                writer = Some(MsavWriter::create(output_path, &header)?);
            }
            let writer = writer.as_mut().unwrap();

            // Flush policy mirrors the reduced-haplotypes heuristic.
            let v = block.variant_size();
            let mut flush = v >= max_block_size;
            if !flush && v >= min_block_size && v % slope_unit == 0 {
                let h = block.expanded_haplotype_size();
                let u = block.unique_haplotype_size();
                let cr = (h + u * v) as f32 / (h * v) as f32;
                if cr >= last_cr {
                    flush = true;
                } else {
                    last_cr = cr;
                }
            }
            if flush {
                writer.write_block(&block)?;
                n_blocks += 1;
                block = UniqueHaplotypeBlock::new();
                last_cr = f32::MAX;
                // Overlap: seed the new block with the boundary variant.
                if let Some((site, alleles)) = &last_site {
                    if !block.compress_variant(site, alleles) {
                        return Err(RemacError::malformed_at(
                            line_no,
                            "failed to carry boundary variant into new block",
                        ));
                    }
                }
            }

            if !block.compress_variant(&site, &alleles) {
                return Err(RemacError::malformed_at(
                    line_no,
                    "haplotype count or ploidy changed mid-panel",
                ));
            }
            last_site = Some((site, alleles));
            n_variants += 1;
        }
    }

    let mut writer = writer.ok_or_else(|| RemacError::malformed("reference panel is empty"))?;
    if !block.is_empty() {
        writer.write_block(&block)?;
        n_blocks += 1;
    }
    writer.finish()?;

    info!(
        variants = n_variants,
        blocks = n_blocks,
        "compressed reference panel"
    );
    Ok(())
}

/// First pass over the panel: contig extents and sample IDs.
fn scan_panel(path: &Path) -> Result<(Vec<(String, u64)>, Vec<String>)> {
    let mut reader = open_text(path)?;
    let mut contigs: Vec<(String, u64)> = Vec::new();
    let mut sample_ids = Vec::new();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.starts_with("#CHROM") {
            sample_ids = trimmed.split('\t').skip(9).map(|s| s.to_string()).collect();
            continue;
        }
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split('\t');
        let chrom = fields.next().unwrap_or("");
        let pos: u64 = fields.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        match contigs.iter_mut().find(|(name, _)| name == chrom) {
            Some((_, max)) => *max = (*max).max(pos),
            None => contigs.push((chrom.to_string(), pos)),
        }
    }

    Ok((contigs, sample_ids))
}

fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| RemacError::input_missing(path, e.to_string()))?;
    let gzipped = path
        .extension()
        .map(|e| e == "gz" || e == "bgz")
        .unwrap_or(false);
    Ok(if gzipped {
        Box::new(BufReader::new(bgzf_io::Reader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

fn skip_header(reader: &mut Box<dyn BufRead + Send>) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.starts_with("#CHROM") {
            return Ok(());
        }
        if !line.starts_with('#') {
            return Err(RemacError::malformed("record line before #CHROM header"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::msav::MsavReader;
    use crate::io::reference::stat_ref_panel;

    fn phased_panel(n_sites: usize) -> String {
        let mut text = String::from(
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tR1\tR2\n",
        );
        for i in 0..n_sites {
            // Haps 0 and 3 carry ALT at even sites, 1 and 2 at odd sites.
            let (a, b) = if i % 2 == 0 { ("1|0", "0|1") } else { ("0|1", "1|0") };
            text.push_str(&format!(
                "20\t{}\trs{}\tA\tT\t.\tPASS\t.\tGT\t{}\t{}\n",
                100 + i * 10,
                i,
                a,
                b
            ));
        }
        text
    }

    #[test]
    fn test_compress_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.vcf");
        let output = dir.path().join("panel.msav");
        std::fs::write(&input, phased_panel(40)).unwrap();

        compress_reference_panel(&input, &output, 4, 16, 4).unwrap();

        let mut reader = MsavReader::open(&output).unwrap();
        assert_eq!(reader.header().sample_ids, vec!["R1", "R2"]);
        assert_eq!(reader.header().ploidies, vec![2, 2]);
        assert_eq!(reader.header().contigs, vec![("20".to_string(), 490)]);

        let mut total = 0usize;
        let mut last_pos = None;
        while let Some(block) = reader.read_block().unwrap() {
            assert!(block.variant_size() <= 16 + 1);
            // Consecutive blocks overlap by one boundary variant.
            if let Some(p) = last_pos {
                assert_eq!(block.variants()[0].site.pos, p);
                total -= 1;
            }
            total += block.variant_size();
            last_pos = Some(block.variants().last().unwrap().site.pos);
            // Decompression must agree with the input pattern.
            for (i, v) in block.variants().iter().enumerate() {
                let expanded: Vec<i8> = (0..4).map(|h| block.allele(i, h)).collect();
                let idx = (v.site.pos as usize - 100) / 10;
                let expected = if idx % 2 == 0 {
                    vec![1, 0, 0, 1]
                } else {
                    vec![0, 1, 1, 0]
                };
                assert_eq!(expanded, expected, "at pos {}", v.site.pos);
            }
        }
        assert_eq!(total, 40);

        let mut chrom = String::new();
        let mut end = u64::MAX;
        stat_ref_panel(&output, &mut chrom, &mut end).unwrap();
        assert_eq!(chrom, "20");
        assert_eq!(end, 490);
    }

    #[test]
    fn test_unphased_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.vcf");
        let output = dir.path().join("panel.msav");
        std::fs::write(
            &input,
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tR1\n\
             20\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0/1\n",
        )
        .unwrap();
        assert!(compress_reference_panel(&input, &output, 4, 16, 4).is_err());
    }
}
