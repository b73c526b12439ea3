//! # Reference Panel Loading
//!
//! Stream msav blocks over a region, subset samples, align target variants
//! to reference sites, derive HMM switch probabilities, and build the two
//! reduced-haplotype views the HMM consumes: the typed-only re-compression
//! and the full reference clipped to the impute region.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::info;

use crate::data::block::UNIQUE_MAP_EOV;
use crate::data::genetic_map::{cm_to_switch_prob, GeneticMapFile};
use crate::data::reduced::ReducedHaplotypes;
use crate::data::variant::TargetVariant;
use crate::error::{RemacError, Result};
use crate::io::msav::MsavReader;
use crate::io::Region;

/// Block size bounds for the typed-only re-compression.
const TYPED_MIN_BLOCK: usize = 16;
const TYPED_MAX_BLOCK: usize = 512;

/// Inspect a reference panel's header: resolve the chromosome and tighten
/// the query end position to the contig length.
///
/// A multi-contig panel with no chromosome constraint is ambiguous and
/// requires `--region`.
pub fn stat_ref_panel(path: &Path, chrom: &mut String, end_pos: &mut u64) -> Result<()> {
    if is_legacy_m3vcf(path) {
        return Err(RemacError::input_missing(
            path,
            "legacy M3VCF reference panels must be converted with --update-m3vcf first",
        ));
    }

    let reader = MsavReader::open(path)?;
    let contigs = &reader.header().contigs;
    if contigs.is_empty() {
        return Err(RemacError::malformed("reference panel lists no contigs"));
    }

    if chrom.is_empty() {
        if contigs.len() > 1 {
            return Err(RemacError::RegionAmbiguous);
        }
        *chrom = contigs[0].0.clone();
        *end_pos = (*end_pos).min(contigs[0].1);
    } else {
        let contig = contigs
            .iter()
            .find(|(name, _)| name == chrom)
            .ok_or_else(|| {
                RemacError::input_missing(
                    path,
                    format!("reference panel does not contain chromosome {}", chrom),
                )
            })?;
        *end_pos = (*end_pos).min(contig.1);
    }
    Ok(())
}

pub fn is_legacy_m3vcf(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".m3vcf") || name.ends_with(".m3vcf.gz")
}

/// Load reference haplotypes with switch probabilities derived from
/// centimorgan differences between typed anchors (the canonical mode).
#[allow(clippy::too_many_arguments)]
pub fn load_reference_haplotypes(
    path: &Path,
    extended_reg: &Region,
    impute_reg: &Region,
    subset_ids: &HashSet<String>,
    target_sites: &mut Vec<TargetVariant>,
    typed_only: &mut ReducedHaplotypes,
    full: &mut ReducedHaplotypes,
    map_file: Option<&mut GeneticMapFile>,
    min_recom: f32,
    default_match_error: f32,
) -> Result<()> {
    load_reference_impl(
        path,
        extended_reg,
        impute_reg,
        subset_ids,
        target_sites,
        typed_only,
        full,
        map_file,
        min_recom,
        default_match_error,
        false,
    )
}

/// Legacy loading mode: switch probabilities between typed anchors are the
/// sums of the per-site values stored in the reference, rather than cM
/// differences. Retained for byte-exact reproduction of older outputs.
#[allow(clippy::too_many_arguments)]
pub fn load_reference_haplotypes_old_recom(
    path: &Path,
    extended_reg: &Region,
    impute_reg: &Region,
    subset_ids: &HashSet<String>,
    target_sites: &mut Vec<TargetVariant>,
    typed_only: &mut ReducedHaplotypes,
    full: &mut ReducedHaplotypes,
    map_file: Option<&mut GeneticMapFile>,
    min_recom: f32,
    default_match_error: f32,
) -> Result<()> {
    load_reference_impl(
        path,
        extended_reg,
        impute_reg,
        subset_ids,
        target_sites,
        typed_only,
        full,
        map_file,
        min_recom,
        default_match_error,
        true,
    )
}

struct Anchor {
    /// Index into `target_sites`.
    tar_idx: usize,
    /// Centimorgan position of the matched reference variant.
    cm: f64,
    /// Cumulative per-site switch probability up to (excluding) the matched
    /// reference variant.
    recom_cum: f64,
}

#[allow(clippy::too_many_arguments)]
fn load_reference_impl(
    path: &Path,
    extended_reg: &Region,
    impute_reg: &Region,
    subset_ids: &HashSet<String>,
    target_sites: &mut Vec<TargetVariant>,
    typed_only: &mut ReducedHaplotypes,
    full: &mut ReducedHaplotypes,
    mut map_file: Option<&mut GeneticMapFile>,
    min_recom: f32,
    default_match_error: f32,
    legacy_recom: bool,
) -> Result<()> {
    let mut reader = MsavReader::open(path)?;

    // Resolve the sample subset to expanded haplotype slots.
    let keep_slots: Option<Vec<usize>> = if subset_ids.is_empty() {
        None
    } else {
        let header = reader.header();
        let mut slots = Vec::new();
        for (s, id) in header.sample_ids.iter().enumerate() {
            if subset_ids.contains(id) {
                slots.extend(header.sample_slots(s));
            }
        }
        if slots.is_empty() {
            return Err(RemacError::SampleSubsetEmpty);
        }
        Some(slots)
    };

    *typed_only = ReducedHaplotypes::new(TYPED_MIN_BLOCK, TYPED_MAX_BLOCK, 10);

    let mut anchors: Vec<Anchor> = Vec::new();
    let mut recom_cum = 0.0f64;
    // Centimorgan accumulator for panels that store per-site switch
    // probabilities but no map positions.
    let mut running_cm = 0.0f64;
    // First target index whose position could still match the stream.
    let mut t_start = 0usize;
    let mut expanded: Vec<i8> = Vec::new();

    while let Some(block) = reader.read_block()? {
        if block.is_empty() {
            continue;
        }
        if block.variants()[0].site.chrom != extended_reg.chrom {
            continue;
        }
        let first_pos = block.variants()[0].site.pos as u64;
        if first_pos > extended_reg.to {
            break;
        }
        let last_pos = block.variants().last().unwrap().site.pos as u64;
        if last_pos < extended_reg.from {
            // Positions before the window still accumulate switch mass.
            for v in block.variants() {
                if v.site.recom.is_finite() {
                    recom_cum += v.site.recom as f64;
                }
            }
            continue;
        }

        let mut block = match &keep_slots {
            Some(slots) => block.subset_haplotypes(slots),
            None => block,
        };
        block.trim(
            extended_reg.from.min(u32::MAX as u64) as u32,
            extended_reg.to.min(u32::MAX as u64) as u32,
        );
        if block.is_empty() {
            continue;
        }

        match map_file.as_deref_mut() {
            Some(map) => block.fill_cm(map),
            // No map: reconstruct missing map positions by accumulating the
            // panel's own per-site switch probabilities.
            None => block.fill_cm_from_recom(&mut running_cm),
        }

        let n_templates: usize = block.cardinalities().iter().sum();

        // (pos, ref, alt) -> (local variant index, switch mass before it)
        let mut site_index: HashMap<(u32, &str, &str), (usize, f64)> = HashMap::new();
        let mut local_cum = 0.0f64;
        for (i, v) in block.variants().iter().enumerate() {
            site_index
                .entry((v.site.pos, v.site.ref_allele.as_str(), v.site.alt_allele.as_str()))
                .or_insert((i, local_cum));
            if v.site.recom.is_finite() {
                local_cum += v.site.recom as f64;
            }
        }

        let block_first = block.variants()[0].site.pos;
        let block_last = block.variants().last().unwrap().site.pos;
        while t_start < target_sites.len() && target_sites[t_start].pos < block_first {
            t_start += 1;
        }
        for t in t_start..target_sites.len() {
            let tar = &target_sites[t];
            if tar.pos > block_last {
                break;
            }
            if tar.in_reference {
                continue; // already matched at a block boundary duplicate
            }
            let Some(&(i, cum_before)) = site_index.get(&(
                tar.pos,
                tar.ref_allele.as_str(),
                tar.alt_allele.as_str(),
            )) else {
                continue;
            };

            let v = &block.variants()[i];
            let af = if n_templates > 0 {
                v.ac as f32 / n_templates as f32
            } else {
                f32::NAN
            };
            let err = if v.site.err.is_nan() {
                default_match_error
            } else {
                v.site.err
            };
            let cm = v.site.cm;

            expanded.clear();
            expanded.extend((0..block.expanded_haplotype_size()).map(|h| block.allele(i, h)));
            let mut site = v.site.clone();
            site.err = err;
            site.recom = f32::NAN; // filled once the next anchor is known
            if !typed_only.compress_variant(&site, &expanded, false) {
                return Err(RemacError::malformed(format!(
                    "reference haplotype count changed at {}:{}",
                    site.chrom, site.pos
                )));
            }

            let tar = &mut target_sites[t];
            tar.in_reference = true;
            tar.af = af;
            tar.err = err;
            anchors.push(Anchor {
                tar_idx: t,
                cm,
                recom_cum: recom_cum + cum_before,
            });
        }

        recom_cum += local_cum;

        // The full view keeps the panel's own block structure, clipped to
        // the impute region.
        block.trim(
            impute_reg.from.min(u32::MAX as u64) as u32,
            impute_reg.to.min(u32::MAX as u64) as u32,
        );
        if !block.is_empty() {
            full.append_block(&block);
        }
    }

    // Switch probabilities between consecutive typed anchors.
    for k in 0..anchors.len() {
        let recom = if k + 1 == anchors.len() {
            0.0 // backward traversal boundary
        } else {
            let a = &anchors[k];
            let b = &anchors[k + 1];
            let r = if legacy_recom {
                b.recom_cum - a.recom_cum
            } else if a.cm.is_finite() && b.cm.is_finite() {
                cm_to_switch_prob(b.cm - a.cm)
            } else {
                // No usable genetic distance; fall back to the summed
                // per-site values.
                b.recom_cum - a.recom_cum
            };
            (r as f32).clamp(min_recom, 0.5)
        };
        target_sites[anchors[k].tar_idx].recom = recom;
    }

    // Mirror the anchor parameters into the typed-only blocks.
    {
        let mut k = 0usize;
        for block in typed_only.blocks_mut() {
            for v in block.variants_mut() {
                v.site.recom = target_sites[anchors[k].tar_idx].recom;
                k += 1;
            }
        }
        debug_assert_eq!(k, anchors.len());
    }

    info!(
        typed = typed_only.variant_size(),
        full = full.variant_size(),
        compression_ratio = full.compression_ratio(),
        "loaded reference haplotypes"
    );

    Ok(())
}

/// Stable partition of target sites by reference membership; returns the
/// sites absent from the reference panel.
pub fn separate_target_only_variants(
    target_sites: &mut Vec<TargetVariant>,
) -> Vec<TargetVariant> {
    let all = std::mem::take(target_sites);
    let (in_ref, target_only): (Vec<_>, Vec<_>) = all.into_iter().partition(|v| v.in_reference);
    *target_sites = in_ref;
    target_only
}

/// Invert each typed block's unique map: `maps[block][column]` lists the
/// expanded haplotypes represented by that column.
pub fn generate_reverse_maps(typed_only: &ReducedHaplotypes) -> Vec<Vec<Vec<usize>>> {
    typed_only
        .blocks()
        .iter()
        .map(|block| {
            let mut map = vec![Vec::new(); block.unique_haplotype_size()];
            for (h, &u) in block.unique_map().iter().enumerate() {
                if u != UNIQUE_MAP_EOV {
                    map[u as usize].push(h);
                }
            }
            map
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::block::UniqueHaplotypeBlock;
    use crate::data::variant::ReferenceSiteInfo;
    use crate::io::msav::{MsavHeader, MsavWriter};
    use std::io::Write;

    fn site(pos: u32, alt: &str, recom: f32, cm: f64) -> ReferenceSiteInfo {
        ReferenceSiteInfo::new("20", pos, ".", "A", alt, 0.01, recom, cm)
    }

    /// Four haplotypes (two diploid samples), hap 0 carries every ALT.
    fn write_panel(positions: &[(u32, &str)]) -> tempfile::NamedTempFile {
        let header = MsavHeader {
            contigs: vec![("20".to_string(), 1_000_000)],
            sample_ids: vec!["R1".into(), "R2".into()],
            ploidies: vec![2, 2],
        };
        let mut block = UniqueHaplotypeBlock::new();
        for (i, &(pos, alt)) in positions.iter().enumerate() {
            let cm = pos as f64 * 1e-3;
            let recom = if i + 1 == positions.len() { 0.0 } else { 1e-3 };
            assert!(block.compress_variant(&site(pos, alt, recom, cm), &[1, 0, 0, 0]));
        }

        let file = tempfile::Builder::new().suffix(".msav").tempfile().unwrap();
        let out = std::fs::File::create(file.path()).unwrap();
        let mut w = MsavWriter::from_writer(
            noodles::bgzf::Writer::new(out),
            &header,
        )
        .unwrap();
        w.write_block(&block).unwrap();
        w.finish().unwrap();
        file
    }

    fn target(pos: u32, alt: &str) -> TargetVariant {
        TargetVariant {
            chrom: "20".into(),
            pos,
            id: String::new(),
            ref_allele: "A".into(),
            alt_allele: alt.into(),
            in_target: true,
            in_reference: false,
            af: f32::NAN,
            err: f32::NAN,
            recom: f32::NAN,
            gt: vec![1, 0],
        }
    }

    #[test]
    fn test_stat_ref_panel_resolves_chrom() {
        let f = write_panel(&[(100, "T"), (200, "T")]);
        let mut chrom = String::new();
        let mut end = u64::MAX;
        stat_ref_panel(f.path(), &mut chrom, &mut end).unwrap();
        assert_eq!(chrom, "20");
        assert_eq!(end, 1_000_000);
    }

    #[test]
    fn test_stat_ref_panel_rejects_legacy() {
        let mut f = tempfile::Builder::new()
            .suffix(".m3vcf.gz")
            .tempfile()
            .unwrap();
        f.write_all(b"whatever").unwrap();
        let mut chrom = String::new();
        let mut end = u64::MAX;
        let err = stat_ref_panel(f.path(), &mut chrom, &mut end).unwrap_err();
        assert!(err.to_string().contains("--update-m3vcf"));
    }

    #[test]
    fn test_load_aligns_target_and_reference() {
        let f = write_panel(&[(100, "T"), (200, "T"), (300, "T"), (400, "T")]);
        let mut targets = vec![target(200, "T"), target(250, "G"), target(400, "T")];
        let mut typed = ReducedHaplotypes::default();
        let mut full = ReducedHaplotypes::default();

        load_reference_haplotypes(
            f.path(),
            &Region::new("20", 1, 1_000_000),
            &Region::new("20", 1, 1_000_000),
            &HashSet::new(),
            &mut targets,
            &mut typed,
            &mut full,
            None,
            1e-5,
            0.01,
        )
        .unwrap();

        assert!(targets[0].in_reference);
        assert!(!targets[1].in_reference);
        assert!(targets[2].in_reference);
        assert_eq!(typed.variant_size(), 2);
        assert_eq!(full.variant_size(), 4);
        assert!((targets[0].af - 0.25).abs() < 1e-6);

        // recom from cm difference: cm spacing is 0.2 over 200bp
        let expect = cm_to_switch_prob(0.2) as f32;
        assert!((targets[0].recom - expect).abs() < 1e-6);
        assert_eq!(targets[2].recom, 0.0);

        let target_only = separate_target_only_variants(&mut targets);
        assert_eq!(target_only.len(), 1);
        assert_eq!(target_only[0].pos, 250);
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_full_view_clipped_to_impute_region() {
        let f = write_panel(&[(100, "T"), (200, "T"), (300, "T"), (400, "T")]);
        let mut targets = vec![target(200, "T"), target(300, "T")];
        let mut typed = ReducedHaplotypes::default();
        let mut full = ReducedHaplotypes::default();

        load_reference_haplotypes(
            f.path(),
            &Region::new("20", 1, 1_000_000),
            &Region::new("20", 150, 350),
            &HashSet::new(),
            &mut targets,
            &mut typed,
            &mut full,
            None,
            1e-5,
            0.01,
        )
        .unwrap();

        assert_eq!(typed.variant_size(), 2); // typed spans the extended region
        assert_eq!(full.variant_size(), 2); // 200 and 300 only
    }

    #[test]
    fn test_sample_subsetting() {
        let f = write_panel(&[(100, "T"), (200, "T")]);
        let mut targets = vec![target(100, "T")];
        let mut typed = ReducedHaplotypes::default();
        let mut full = ReducedHaplotypes::default();

        let subset: HashSet<String> = ["R2".to_string()].into_iter().collect();
        load_reference_haplotypes(
            f.path(),
            &Region::new("20", 1, 1_000_000),
            &Region::new("20", 1, 1_000_000),
            &subset,
            &mut targets,
            &mut typed,
            &mut full,
            None,
            1e-5,
            0.01,
        )
        .unwrap();

        // Sample R2 holds haplotypes 2 and 3, neither carrying ALT.
        assert_eq!(typed.blocks()[0].expanded_haplotype_size(), 2);
        assert!((targets[0].af - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_subset_fails() {
        let f = write_panel(&[(100, "T")]);
        let mut targets = vec![target(100, "T")];
        let mut typed = ReducedHaplotypes::default();
        let mut full = ReducedHaplotypes::default();
        let subset: HashSet<String> = ["NOPE".to_string()].into_iter().collect();
        let err = load_reference_haplotypes(
            f.path(),
            &Region::new("20", 1, 1_000_000),
            &Region::new("20", 1, 1_000_000),
            &subset,
            &mut targets,
            &mut typed,
            &mut full,
            None,
            1e-5,
            0.01,
        )
        .unwrap_err();
        assert!(matches!(err, RemacError::SampleSubsetEmpty));
    }

    #[test]
    fn test_reverse_maps_invert_unique_map() {
        let mut typed = ReducedHaplotypes::default();
        assert!(typed.compress_variant(&site(100, "T", 0.0, f64::NAN), &[1, 0, 0, 1], false));
        let maps = generate_reverse_maps(&typed);
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0][0], vec![0, 3]);
        assert_eq!(maps[0][1], vec![1, 2]);
    }
}
