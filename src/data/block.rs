//! # Unique-Haplotype Block
//!
//! Dictionary-style column compression of the reference panel: haplotypes
//! identical across the variants of a window collapse into a single unique
//! column. `unique_map` sends each expanded haplotype slot to its column,
//! `cardinalities` counts occupancy, and every variant stores one allele per
//! column.

use crate::data::genetic_map::{switch_prob_to_cm, GeneticMapFile};
use crate::data::variant::{ReferenceSiteInfo, ReferenceVariant, GT_EOV};
use crate::error::{RemacError, Result};

/// End-of-vector sentinel inside `unique_map` (variable-ploidy padding slot)
pub const UNIQUE_MAP_EOV: i64 = -1;

/// Marker for a column whose allele has not been established yet while
/// absorbing a variant.
const UNSET_ALLELE: i8 = -1;

/// A block of variants sharing one unique-column compression.
#[derive(Clone, Debug, Default)]
pub struct UniqueHaplotypeBlock {
    /// For each expanded haplotype slot, the unique column representing it,
    /// or `UNIQUE_MAP_EOV` for padding slots.
    unique_map: Vec<i64>,
    /// Number of expanded haplotypes mapping to each unique column.
    cardinalities: Vec<usize>,
    /// Variants compressed into this block, in position order.
    variants: Vec<ReferenceVariant>,
}

impl UniqueHaplotypeBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a block from a deserialized unique map and variant list.
    ///
    /// Recomputes cardinalities and every variant's allele count; fails when
    /// a genotype vector does not match the column count.
    pub fn from_parts(unique_map: Vec<i64>, mut variants: Vec<ReferenceVariant>) -> Result<Self> {
        if unique_map.iter().all(|&u| u == UNIQUE_MAP_EOV) {
            return Err(RemacError::malformed("unique map contains no haplotypes"));
        }
        let n_columns = match variants.first() {
            Some(v) => v.gt.len(),
            None => {
                1 + unique_map
                    .iter()
                    .filter(|&&u| u != UNIQUE_MAP_EOV)
                    .max()
                    .map(|&u| u as usize)
                    .unwrap_or(0)
            }
        };

        let mut cardinalities = vec![0usize; n_columns];
        for &u in &unique_map {
            if u != UNIQUE_MAP_EOV {
                if u < 0 || u as usize >= n_columns {
                    return Err(RemacError::malformed("unique map index out of range"));
                }
                cardinalities[u as usize] += 1;
            }
        }

        for v in &mut variants {
            if v.gt.len() != n_columns {
                return Err(RemacError::malformed(format!(
                    "genotype vector length {} does not match {} unique columns",
                    v.gt.len(),
                    n_columns
                )));
            }
            v.ac = allele_count(&v.gt, &cardinalities);
        }

        Ok(Self {
            unique_map,
            cardinalities,
            variants,
        })
    }

    pub fn variants(&self) -> &[ReferenceVariant] {
        &self.variants
    }

    pub fn variants_mut(&mut self) -> &mut [ReferenceVariant] {
        &mut self.variants
    }

    pub fn unique_map(&self) -> &[i64] {
        &self.unique_map
    }

    pub fn cardinalities(&self) -> &[usize] {
        &self.cardinalities
    }

    /// Number of expanded haplotype slots (including padding).
    pub fn expanded_haplotype_size(&self) -> usize {
        self.unique_map.len()
    }

    /// Number of unique columns, or 0 for an empty block.
    pub fn unique_haplotype_size(&self) -> usize {
        if self.variants.is_empty() {
            0
        } else {
            self.variants[0].gt.len()
        }
    }

    pub fn variant_size(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Expanded allele of haplotype `h` at in-block variant `i`.
    #[inline]
    pub fn allele(&self, i: usize, h: usize) -> i8 {
        match self.unique_map[h] {
            UNIQUE_MAP_EOV => GT_EOV,
            u => self.variants[i].gt[u as usize],
        }
    }

    /// Absorb one variant into the block.
    ///
    /// The first variant establishes the column set: each distinct observed
    /// allele seeds a column. Later variants either match their column's
    /// stored allele, fall into a column already split off for this variant,
    /// or force a split: a new column is appended, earlier variants are
    /// back-filled from the split source, and map and cardinalities are
    /// updated. End-of-vector alleles must occupy the same slots as in prior
    /// variants.
    ///
    /// Returns false on empty input, size mismatch, or ploidy inconsistency.
    pub fn compress_variant(&mut self, site_info: &ReferenceSiteInfo, alleles: &[i8]) -> bool {
        if alleles.is_empty() {
            return false;
        }

        if self.variants.is_empty() {
            return self.compress_first(site_info, alleles);
        }

        if alleles.len() != self.unique_map.len() {
            return false;
        }

        let base_columns = self.cardinalities.len();
        let mut gt = vec![UNSET_ALLELE; base_columns];
        // Columns appended while absorbing this variant: (source column, allele)
        let mut splits: Vec<(usize, i8)> = Vec::new();

        for (h, &obs) in alleles.iter().enumerate() {
            let mapped = self.unique_map[h];
            if (obs == GT_EOV) != (mapped == UNIQUE_MAP_EOV) {
                return false; // ploidy changed for this slot
            }
            if obs == GT_EOV {
                continue;
            }

            let u = mapped as usize;
            if gt[u] == UNSET_ALLELE {
                gt[u] = obs;
                continue;
            }
            if gt[u] == obs {
                continue;
            }

            // Mismatch against the column's established allele. Reuse a
            // column already split from u for this allele, or split now.
            if let Some(k) = splits.iter().position(|&(src, a)| src == u && a == obs) {
                let c = base_columns + k;
                self.unique_map[h] = c as i64;
                self.cardinalities[u] -= 1;
                self.cardinalities[c] += 1;
            } else {
                let c = self.cardinalities.len();
                for v in &mut self.variants {
                    let back_fill = v.gt[u];
                    v.gt.push(back_fill);
                }
                gt.push(obs);
                splits.push((u, obs));
                self.unique_map[h] = c as i64;
                self.cardinalities[u] -= 1;
                self.cardinalities.push(1);
            }
        }

        // A column's first-seen member establishes its allele, so unset
        // columns can only remain if the block carries columns with no
        // members at this variant (possible after trim+reuse); keep the
        // reference allele for those.
        for a in gt.iter_mut() {
            if *a == UNSET_ALLELE {
                *a = 0;
            }
        }

        let ac = allele_count(&gt, &self.cardinalities);
        self.variants
            .push(ReferenceVariant::new(site_info.clone(), ac, gt));

        debug_assert_eq!(
            self.cardinalities.iter().sum::<usize>(),
            self.unique_map
                .iter()
                .filter(|&&u| u != UNIQUE_MAP_EOV)
                .count()
        );

        true
    }

    fn compress_first(&mut self, site_info: &ReferenceSiteInfo, alleles: &[i8]) -> bool {
        self.unique_map = Vec::with_capacity(alleles.len());
        self.cardinalities.clear();
        let mut gt: Vec<i8> = Vec::new();

        for &obs in alleles {
            if obs == GT_EOV {
                self.unique_map.push(UNIQUE_MAP_EOV);
                continue;
            }
            match gt.iter().position(|&a| a == obs) {
                Some(u) => {
                    self.unique_map.push(u as i64);
                    self.cardinalities[u] += 1;
                }
                None => {
                    self.unique_map.push(gt.len() as i64);
                    gt.push(obs);
                    self.cardinalities.push(1);
                }
            }
        }

        let ac = allele_count(&gt, &self.cardinalities);
        self.variants
            .push(ReferenceVariant::new(site_info.clone(), ac, gt));
        true
    }

    /// Drop variants outside the inclusive position window. Clears the whole
    /// block when nothing remains.
    pub fn trim(&mut self, min_pos: u32, max_pos: u32) {
        self.variants
            .retain(|v| v.site.pos >= min_pos && v.site.pos <= max_pos);
        if self.variants.is_empty() {
            self.clear();
        }
    }

    /// Remove the most recently added variant.
    pub fn pop_variant(&mut self) {
        self.variants.pop();
    }

    pub fn clear(&mut self) {
        self.variants.clear();
        self.unique_map.clear();
        self.cardinalities.clear();
    }

    /// Strip end-of-vector sentinels from the unique map.
    pub fn remove_eov(&mut self) {
        self.unique_map.retain(|&u| u != UNIQUE_MAP_EOV);
    }

    /// Interpolate every variant's centimorgan position from a genetic map.
    pub fn fill_cm(&mut self, map_file: &mut GeneticMapFile) {
        for v in &mut self.variants {
            v.site.cm = map_file.interpolate_centimorgan(v.site.pos as u64);
        }
    }

    /// Fill missing centimorgan values by accumulating per-site switch
    /// probabilities, starting from (and advancing) `start_cm`.
    pub fn fill_cm_from_recom(&mut self, start_cm: &mut f64) {
        for v in &mut self.variants {
            if v.site.cm.is_nan() {
                v.site.cm = *start_cm;
            }
            if v.site.recom.is_finite() {
                *start_cm += switch_prob_to_cm(v.site.recom as f64);
            }
        }
    }

    /// Restrict the expanded dimension to the given haplotype slots.
    ///
    /// Columns that lose all members are dropped and the map, cardinalities,
    /// genotype vectors, and allele counts are rebuilt over the survivors.
    pub fn subset_haplotypes(&self, keep: &[usize]) -> UniqueHaplotypeBlock {
        let n_old_columns = self.cardinalities.len();
        let mut column_remap = vec![usize::MAX; n_old_columns];
        let mut new_map = Vec::with_capacity(keep.len());
        let mut new_cardinalities: Vec<usize> = Vec::new();

        for &h in keep {
            match self.unique_map[h] {
                UNIQUE_MAP_EOV => new_map.push(UNIQUE_MAP_EOV),
                u => {
                    let u = u as usize;
                    if column_remap[u] == usize::MAX {
                        column_remap[u] = new_cardinalities.len();
                        new_cardinalities.push(0);
                    }
                    new_cardinalities[column_remap[u]] += 1;
                    new_map.push(column_remap[u] as i64);
                }
            }
        }

        let variants = self
            .variants
            .iter()
            .map(|v| {
                let mut gt = vec![0i8; new_cardinalities.len()];
                for (old_c, &new_c) in column_remap.iter().enumerate() {
                    if new_c != usize::MAX {
                        gt[new_c] = v.gt[old_c];
                    }
                }
                let ac = allele_count(&gt, &new_cardinalities);
                ReferenceVariant::new(v.site.clone(), ac, gt)
            })
            .collect();

        UniqueHaplotypeBlock {
            unique_map: new_map,
            cardinalities: new_cardinalities,
            variants,
        }
    }

    /// Parse one legacy m3vcf (v1/v2) block from a line iterator.
    ///
    /// `lines` yields `(line_number, line)` pairs positioned at a block
    /// header; returns `Ok(None)` at end of input. `n_haplotypes` of 0
    /// accepts any map width (used for the first block of a file, whose
    /// width defines the rest). The header's INFO field
    /// must carry `VARIANTS=<n>` and `REPS=<u>`; the genotype columns hold
    /// the unique map (v1: one index per column, v2: pipe-separated indices
    /// per sample column). The `n` variant lines that follow carry `ERR=` and
    /// `RECOM=` in INFO and per-column genotypes (v1: a 0/1 string, v2: a
    /// comma-separated list of columns carrying the ALT allele).
    pub fn deserialize_m3vcf(
        lines: &mut impl Iterator<Item = std::io::Result<(usize, String)>>,
        m3vcf_version: u8,
        n_haplotypes: usize,
    ) -> Result<Option<UniqueHaplotypeBlock>> {
        let (header_line_no, header) = match lines.next() {
            Some(l) => l?,
            None => return Ok(None),
        };
        if header.trim().is_empty() {
            return Ok(None);
        }

        let cols: Vec<&str> = header.trim_end().split('\t').collect();
        if cols.len() < 9 {
            return Err(RemacError::malformed_at(
                header_line_no,
                "m3vcf block header has fewer than 9 columns",
            ));
        }

        let info = cols[7];
        let n_variants = parse_info_field(info, "VARIANTS")
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| {
                RemacError::malformed_at(header_line_no, "m3vcf block header lacks VARIANTS=")
            })?;
        let n_reps = parse_info_field(info, "REPS")
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| {
                RemacError::malformed_at(header_line_no, "m3vcf block header lacks REPS=")
            })?;

        let mut unique_map: Vec<i64> = Vec::with_capacity(n_haplotypes);
        for col in &cols[9..] {
            if m3vcf_version >= 2 {
                for part in col.split('|') {
                    let u: i64 = part.parse().map_err(|_| {
                        RemacError::malformed_at(header_line_no, "non-numeric unique map index")
                    })?;
                    unique_map.push(u);
                }
            } else {
                let u: i64 = col.parse().map_err(|_| {
                    RemacError::malformed_at(header_line_no, "non-numeric unique map index")
                })?;
                unique_map.push(u);
            }
        }
        if n_haplotypes > 0 && unique_map.len() != n_haplotypes {
            return Err(RemacError::malformed_at(
                header_line_no,
                format!(
                    "m3vcf block maps {} haplotypes, expected {}",
                    unique_map.len(),
                    n_haplotypes
                ),
            ));
        }

        let mut variants = Vec::with_capacity(n_variants);
        for _ in 0..n_variants {
            let (line_no, line) = match lines.next() {
                Some(l) => l?,
                None => {
                    return Err(RemacError::malformed(
                        "truncated m3vcf block: fewer variant lines than VARIANTS=",
                    ))
                }
            };
            let vcols: Vec<&str> = line.trim_end().split('\t').collect();
            if vcols.len() < 9 {
                return Err(RemacError::malformed_at(
                    line_no,
                    "m3vcf variant line has fewer than 9 columns",
                ));
            }
            let pos: u32 = vcols[1].parse().map_err(|_| {
                RemacError::malformed_at(line_no, "non-numeric position in m3vcf variant line")
            })?;
            let err = parse_info_field(vcols[7], "ERR")
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(f32::NAN);
            let recom = parse_info_field(vcols[7], "RECOM")
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(f32::NAN);

            let gt = if m3vcf_version >= 2 {
                let mut gt = vec![0i8; n_reps];
                let field = vcols[8].trim();
                if !field.is_empty() && field != "." {
                    for tok in field.split(',') {
                        let c: usize = tok.parse().map_err(|_| {
                            RemacError::malformed_at(line_no, "non-numeric column index in alt list")
                        })?;
                        if c >= n_reps {
                            return Err(RemacError::malformed_at(
                                line_no,
                                "alt-list column index exceeds REPS",
                            ));
                        }
                        gt[c] = 1;
                    }
                }
                gt
            } else {
                let field = vcols[8].trim();
                if field.len() != n_reps {
                    return Err(RemacError::malformed_at(
                        line_no,
                        format!("genotype column length {} != REPS {}", field.len(), n_reps),
                    ));
                }
                field
                    .bytes()
                    .map(|b| match b {
                        b'0' => Ok(0i8),
                        b'1' => Ok(1i8),
                        _ => Err(RemacError::malformed_at(
                            line_no,
                            "genotype column contains characters other than 0/1",
                        )),
                    })
                    .collect::<Result<Vec<i8>>>()?
            };

            let site = ReferenceSiteInfo::new(
                cols[0].to_string(),
                pos,
                vcols[2].to_string(),
                vcols[3].to_string(),
                vcols[4].to_string(),
                err,
                recom,
                f64::NAN,
            );
            variants.push(ReferenceVariant::new(site, 0, gt));
        }

        Self::from_parts(unique_map, variants).map(Some)
    }
}

/// ALT allele count over expanded haplotypes: sum of each alt-carrying
/// column's cardinality.
fn allele_count(gt: &[i8], cardinalities: &[usize]) -> usize {
    gt.iter()
        .zip(cardinalities)
        .filter(|(&a, _)| a > 0)
        .map(|(_, &c)| c)
        .sum()
}

/// Extract `KEY=value` from a semicolon-delimited INFO field.
pub fn parse_info_field<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    info.split(';').find_map(|kv| {
        let mut it = kv.splitn(2, '=');
        if it.next()? == key {
            it.next()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(pos: u32) -> ReferenceSiteInfo {
        ReferenceSiteInfo::new("chr1", pos, ".", "A", "T", 0.01, 0.001, f64::NAN)
    }

    fn expand(block: &UniqueHaplotypeBlock, i: usize) -> Vec<i8> {
        (0..block.expanded_haplotype_size())
            .map(|h| block.allele(i, h))
            .collect()
    }

    #[test]
    fn test_first_variant_seeds_columns() {
        let mut block = UniqueHaplotypeBlock::new();
        assert!(block.compress_variant(&site(100), &[0, 1, 0, 1, 0]));
        assert_eq!(block.unique_haplotype_size(), 2);
        assert_eq!(block.cardinalities(), &[3, 2]);
        assert_eq!(block.unique_map(), &[0, 1, 0, 1, 0]);
        assert_eq!(block.variants()[0].ac, 2);
    }

    #[test]
    fn test_column_split_back_fills() {
        let mut block = UniqueHaplotypeBlock::new();
        // Haps 0..4: two patterns at first variant, then hap 2 diverges.
        assert!(block.compress_variant(&site(100), &[0, 0, 0, 1]));
        assert!(block.compress_variant(&site(200), &[0, 0, 1, 1]));
        assert_eq!(block.unique_haplotype_size(), 3);
        assert_eq!(expand(&block, 0), vec![0, 0, 0, 1]);
        assert_eq!(expand(&block, 1), vec![0, 0, 1, 1]);
        // invariants
        let card_sum: usize = block.cardinalities().iter().sum();
        assert_eq!(card_sum, 4);
        for v in block.variants() {
            assert_eq!(v.gt.len(), block.cardinalities().len());
            let ac: usize = v
                .gt
                .iter()
                .zip(block.cardinalities())
                .map(|(&g, &c)| g as usize * c)
                .sum();
            assert_eq!(v.ac, ac);
        }
    }

    #[test]
    fn test_decompression_law() {
        // 8 haplotypes, 3 distinct row patterns over 5 variants.
        let patterns: [[i8; 5]; 3] = [[0, 1, 0, 1, 0], [1, 1, 0, 0, 0], [0, 0, 0, 1, 1]];
        let assignment = [0usize, 1, 2, 0, 1, 2, 0, 0];
        let mut block = UniqueHaplotypeBlock::new();
        for i in 0..5 {
            let alleles: Vec<i8> = assignment.iter().map(|&p| patterns[p][i]).collect();
            assert!(block.compress_variant(&site(100 + i as u32), &alleles));
        }
        assert_eq!(block.unique_haplotype_size(), 3);
        for i in 0..5 {
            let expected: Vec<i8> = assignment.iter().map(|&p| patterns[p][i]).collect();
            assert_eq!(expand(&block, i), expected);
        }
    }

    #[test]
    fn test_eov_slots_must_be_stable() {
        let mut block = UniqueHaplotypeBlock::new();
        assert!(block.compress_variant(&site(100), &[0, 1, GT_EOV]));
        assert!(block.compress_variant(&site(200), &[1, 1, GT_EOV]));
        // EOV moving to another slot is a ploidy inconsistency
        assert!(!block.compress_variant(&site(300), &[0, GT_EOV, 1]));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut block = UniqueHaplotypeBlock::new();
        assert!(block.compress_variant(&site(100), &[0, 1]));
        assert!(!block.compress_variant(&site(200), &[0, 1, 0]));
        assert!(!block.compress_variant(&site(200), &[]));
    }

    #[test]
    fn test_trim_and_clear() {
        let mut block = UniqueHaplotypeBlock::new();
        for pos in [100u32, 200, 300] {
            assert!(block.compress_variant(&site(pos), &[0, 1]));
        }
        block.trim(150, 250);
        assert_eq!(block.variant_size(), 1);
        assert_eq!(block.variants()[0].site.pos, 200);
        block.trim(900, 1000);
        assert!(block.is_empty());
        assert_eq!(block.expanded_haplotype_size(), 0);
    }

    #[test]
    fn test_remove_eov() {
        let mut block = UniqueHaplotypeBlock::new();
        assert!(block.compress_variant(&site(100), &[0, GT_EOV, 1]));
        block.remove_eov();
        assert_eq!(block.unique_map(), &[0, 1]);
    }

    #[test]
    fn test_fill_cm_from_recom_accumulates() {
        let mut block = UniqueHaplotypeBlock::new();
        for pos in [100u32, 200] {
            assert!(block.compress_variant(&site(pos), &[0, 1]));
        }
        let mut start = 1.0;
        block.fill_cm_from_recom(&mut start);
        assert!((block.variants()[0].site.cm - 1.0).abs() < 1e-9);
        let step = switch_prob_to_cm(0.001);
        assert!((block.variants()[1].site.cm - (1.0 + step)).abs() < 1e-9);
        assert!((start - (1.0 + 2.0 * step)).abs() < 1e-9);
    }

    #[test]
    fn test_subset_haplotypes() {
        let mut block = UniqueHaplotypeBlock::new();
        assert!(block.compress_variant(&site(100), &[0, 0, 1, 1]));
        assert!(block.compress_variant(&site(200), &[0, 1, 1, 1]));
        // keep haps 0 and 2: columns for hap 1's pattern vanish
        let sub = block.subset_haplotypes(&[0, 2]);
        assert_eq!(sub.expanded_haplotype_size(), 2);
        assert_eq!(sub.cardinalities().iter().sum::<usize>(), 2);
        assert_eq!(
            (0..2).map(|h| sub.allele(0, h)).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            (0..2).map(|h| sub.allele(1, h)).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(sub.variants()[0].ac, 1);
    }

    fn lines_of(text: &str) -> impl Iterator<Item = std::io::Result<(usize, String)>> + '_ {
        text.lines()
            .enumerate()
            .map(|(i, l)| Ok((i + 1, l.to_string())))
    }

    #[test]
    fn test_m3vcf_v1_block() {
        let text = "20\t100\t<BLOCK>\t.\t.\t.\t.\tVARIANTS=2;REPS=2\tGT\t0\t1\t0\t1\n\
                    20\t100\trs1\tA\tT\t.\t.\tERR=0.01;RECOM=0.001\t01\n\
                    20\t200\trs2\tC\tG\t.\t.\tERR=0.01;RECOM=0.002\t10\n";
        let mut it = lines_of(text);
        let block = UniqueHaplotypeBlock::deserialize_m3vcf(&mut it, 1, 4)
            .unwrap()
            .unwrap();
        assert_eq!(block.variant_size(), 2);
        assert_eq!(block.unique_haplotype_size(), 2);
        assert_eq!(block.cardinalities(), &[2, 2]);
        assert_eq!(block.variants()[0].ac, 2);
        assert_eq!(block.variants()[1].gt, vec![1, 0]);
        assert!((block.variants()[0].site.err - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_m3vcf_v2_block() {
        let text = "20\t100\t<BLOCK>\t.\t.\t.\t.\tVARIANTS=1;REPS=3\tGT\t0|1\t2|0\n\
                    20\t100\trs1\tA\tT\t.\t.\tERR=0.01;RECOM=0\t1,2\n";
        let mut it = lines_of(text);
        let block = UniqueHaplotypeBlock::deserialize_m3vcf(&mut it, 2, 4)
            .unwrap()
            .unwrap();
        assert_eq!(block.unique_map(), &[0, 1, 2, 0]);
        assert_eq!(block.variants()[0].gt, vec![0, 1, 1]);
        assert_eq!(block.variants()[0].ac, 2);
    }

    #[test]
    fn test_m3vcf_missing_header_fields() {
        let text = "20\t100\t<BLOCK>\t.\t.\t.\t.\tREPS=2\tGT\t0\t1\n";
        let mut it = lines_of(text);
        assert!(UniqueHaplotypeBlock::deserialize_m3vcf(&mut it, 1, 2).is_err());
    }
}
