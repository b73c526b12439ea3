//! # Target Panel Loading
//!
//! Parse the study cohort's VCF into `TargetVariant` records: one record per
//! ALT allele, genotypes recoded to presence/absence, ploidy enforced across
//! variants, and samples padded to a rectangular haplotype layout.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use noodles::bgzf as bgzf_io;
use tracing::warn;

use crate::data::variant::{TargetVariant, GT_EOV, GT_MISSING};
use crate::error::{RemacError, Result};
use crate::io::Region;

/// Open a target file and return its sample IDs.
pub fn stat_tar_panel(path: &Path) -> Result<Vec<String>> {
    let mut reader = open_text(path)?;
    let (_, samples) = read_header(&mut reader, path)?;
    Ok(samples)
}

/// Load target haplotypes intersecting `region`.
///
/// Fills `target_sites` (one entry per ALT allele, position-ordered as in
/// the file) and `sample_ids`. The genotype vectors are rectangular: each
/// sample occupies `max_ploidy` slots, padded with end-of-vector sentinels.
pub fn load_target_haplotypes(
    path: &Path,
    region: &Region,
    target_sites: &mut Vec<TargetVariant>,
    sample_ids: &mut Vec<String>,
) -> Result<()> {
    let mut reader = open_text(path)?;
    let (mut line_no, samples) = read_header(&mut reader, path)?;
    *sample_ids = samples;
    let n_samples = sample_ids.len();

    if region.chrom == "X" || region.chrom == "chrX" {
        warn!("imputing chromosome X: PAR and non-PAR regions must be imputed separately");
    }

    // Per-sample ploidy, fixed by the first variant.
    let mut ploidies: Vec<u8> = Vec::new();
    let mut max_ploidy = 0usize;

    let mut line = String::new();
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
        if fields.len() < 9 + n_samples {
            return Err(RemacError::malformed_at(
                line_no,
                format!(
                    "expected {} columns, found {}",
                    9 + n_samples,
                    fields.len()
                ),
            ));
        }

        let chrom = fields[0];
        if chrom != region.chrom {
            continue;
        }
        let pos: u32 = fields[1]
            .parse()
            .map_err(|_| RemacError::malformed_at(line_no, "non-numeric POS"))?;
        if !region.contains(pos as u64) {
            continue;
        }

        let id = fields[2];
        let ref_allele = fields[3];
        let alt_alleles: Vec<&str> = fields[4].split(',').collect();

        let gt_idx = fields[8]
            .split(':')
            .position(|f| f == "GT")
            .ok_or_else(|| RemacError::malformed_at(line_no, "no GT field in FORMAT"))?;

        // Raw allele indices, one row of max_ploidy slots per sample.
        let mut raw: Vec<i16> = Vec::with_capacity(n_samples * max_ploidy.max(2));
        if ploidies.is_empty() {
            // The first variant fixes each sample's ploidy.
            for sample_field in &fields[9..9 + n_samples] {
                let gt = sample_field.split(':').nth(gt_idx).unwrap_or(".");
                ploidies.push(gt.split(['|', '/']).count() as u8);
            }
            max_ploidy = ploidies.iter().map(|&p| p as usize).max().unwrap_or(2);
        }

        for (s, sample_field) in fields[9..9 + n_samples].iter().enumerate() {
            let gt = sample_field.split(':').nth(gt_idx).unwrap_or(".");
            let alleles: Vec<&str> = gt.split(['|', '/']).collect();
            if alleles.len() != ploidies[s] as usize {
                return Err(RemacError::PloidyInconsistent {
                    sample: sample_ids[s].clone(),
                });
            }
            for a in &alleles {
                raw.push(if *a == "." {
                    -1
                } else {
                    a.parse::<i16>()
                        .map_err(|_| RemacError::malformed_at(line_no, "non-numeric allele"))?
                });
            }
            for _ in alleles.len()..max_ploidy {
                raw.push(-2); // end-of-vector padding
            }
        }

        // One target variant per ALT allele, recoded to presence/absence.
        for (alt_idx, alt) in alt_alleles.iter().enumerate() {
            if *alt == "." || alt.is_empty() {
                continue;
            }
            let wanted = (alt_idx + 1) as i16;
            let gt: Vec<i8> = raw
                .iter()
                .map(|&a| match a {
                    -2 => GT_EOV,
                    -1 => GT_MISSING,
                    a if a == wanted => 1,
                    _ => 0,
                })
                .collect();
            target_sites.push(TargetVariant {
                chrom: chrom.to_string(),
                pos,
                id: if id == "." { String::new() } else { id.to_string() },
                ref_allele: ref_allele.to_string(),
                alt_allele: alt.to_string(),
                in_target: true,
                in_reference: false,
                af: f32::NAN,
                err: f32::NAN,
                recom: f32::NAN,
                gt,
            });
        }
    }

    Ok(())
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

/// Consume header lines up to and including `#CHROM`, returning the line
/// count and sample IDs.
fn read_header(
    reader: &mut Box<dyn BufRead + Send>,
    path: &Path,
) -> Result<(usize, Vec<String>)> {
    let mut line = String::new();
    let mut line_no = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(RemacError::input_missing(
                path,
                "no #CHROM header line found",
            ));
        }
        line_no += 1;
        if line.starts_with("#CHROM") {
            let samples: Vec<String> = line
                .trim_end()
                .split('\t')
                .skip(9)
                .map(|s| s.to_string())
                .collect();
            return Ok((line_no, samples));
        }
        if !line.starts_with('#') {
            return Err(RemacError::malformed_at(
                line_no,
                "record line before #CHROM header",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_vcf(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".vcf").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    const HEADER: &str = "##fileformat=VCFv4.2\n\
        #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n";

    #[test]
    fn test_load_biallelic() {
        let f = write_temp_vcf(&format!(
            "{}20\t100\trs1\tA\tT\t.\tPASS\t.\tGT\t0|1\t1|1\n\
             20\t200\t.\tC\tG\t.\tPASS\t.\tGT\t0|0\t.|.\n",
            HEADER
        ));
        let mut sites = Vec::new();
        let mut samples = Vec::new();
        load_target_haplotypes(
            f.path(),
            &Region::chromosome("20"),
            &mut sites,
            &mut samples,
        )
        .unwrap();
        assert_eq!(samples, vec!["S1", "S2"]);
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].gt, vec![0, 1, 1, 1]);
        assert_eq!(sites[1].gt, vec![0, 0, GT_MISSING, GT_MISSING]);
        assert!(sites[0].in_target && !sites[0].in_reference);
        assert_eq!(sites[1].id, "");
    }

    #[test]
    fn test_multiallelic_split() {
        let f = write_temp_vcf(&format!(
            "{}20\t100\trs1\tA\tT,G\t.\tPASS\t.\tGT\t1|2\t0|1\n",
            HEADER
        ));
        let mut sites = Vec::new();
        let mut samples = Vec::new();
        load_target_haplotypes(
            f.path(),
            &Region::chromosome("20"),
            &mut sites,
            &mut samples,
        )
        .unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].alt_allele, "T");
        assert_eq!(sites[0].gt, vec![1, 0, 0, 1]);
        assert_eq!(sites[1].alt_allele, "G");
        assert_eq!(sites[1].gt, vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_region_filter() {
        let f = write_temp_vcf(&format!(
            "{}20\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0|1\t0|0\n\
             20\t500\t.\tC\tG\t.\tPASS\t.\tGT\t0|0\t0|1\n",
            HEADER
        ));
        let mut sites = Vec::new();
        let mut samples = Vec::new();
        load_target_haplotypes(
            f.path(),
            &Region::new("20", 400, 600),
            &mut sites,
            &mut samples,
        )
        .unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].pos, 500);
    }

    #[test]
    fn test_ploidy_inconsistency_rejected() {
        let f = write_temp_vcf(&format!(
            "{}20\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0|1\t1\n\
             20\t200\t.\tC\tG\t.\tPASS\t.\tGT\t0|1\t1|0\n",
            HEADER
        ));
        let mut sites = Vec::new();
        let mut samples = Vec::new();
        let err = load_target_haplotypes(
            f.path(),
            &Region::chromosome("20"),
            &mut sites,
            &mut samples,
        )
        .unwrap_err();
        assert!(matches!(err, RemacError::PloidyInconsistent { .. }));
    }

    #[test]
    fn test_haploid_padding() {
        let f = write_temp_vcf(&format!(
            "{}20\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0|1\t1\n",
            HEADER
        ));
        let mut sites = Vec::new();
        let mut samples = Vec::new();
        load_target_haplotypes(
            f.path(),
            &Region::chromosome("20"),
            &mut sites,
            &mut samples,
        )
        .unwrap();
        assert_eq!(sites[0].gt, vec![0, 1, 1, GT_EOV]);
    }

    #[test]
    fn test_stat_tar_panel() {
        let f = write_temp_vcf(HEADER);
        assert_eq!(stat_tar_panel(f.path()).unwrap(), vec!["S1", "S2"]);
    }
}
