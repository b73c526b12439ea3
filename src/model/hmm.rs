//! # Hidden Markov Model
//!
//! Li-Stephens style forward/backward traversal over the compressed
//! reference. Probabilities live in three nested state spaces per block:
//!
//! - S3: the block's unique columns (the working representation)
//! - S1: expanded haplotypes, recovered from S3 via junction proportions
//! - S2: the unique columns of a *full-reference* block, used to impute
//!   untyped sites
//!
//! Forward vectors hold per-column mass; backward vectors hold per-column
//! sums of member likelihoods, so a column's posterior joint is
//! `left[u] * right[u] / cardinality[u]`. Both directions share one
//! transpose kernel under this convention.
//!
//! Forward state (per typed block) is retained for the backward pass; the
//! backward pass combines both into posterior dosages for every reference
//! variant and leave-one-out dosages for typed variants.

use std::collections::VecDeque;

use crate::data::block::{UniqueHaplotypeBlock, UNIQUE_MAP_EOV};
use crate::data::reduced::{RefPanelPos, ReducedHaplotypes};
use crate::data::variant::{ReferenceVariant, TargetVariant};
use crate::error::{RemacError, Result};
use crate::model::dosage::HaplotypeDosages;

/// Running probability sums below this trigger a rescale.
pub const JUMP_THRESHOLD: f32 = 1e-10;

/// Rescale factor applied on underflow.
pub const JUMP_FIX: f32 = 1e15;

/// Discretization denominator for dosages (milli-dosage bins).
const BIN_SCALAR: f32 = 1000.0;

#[inline]
fn bin(dose: f32) -> f32 {
    (dose * BIN_SCALAR + 0.5).floor() / BIN_SCALAR
}

/// Tunables for one HMM instance.
#[derive(Clone, Copy, Debug)]
pub struct HmmParams {
    /// Posterior mass threshold for keeping an S3 column in the template set.
    pub prob_threshold: f32,
    /// Optional threshold applied in the expanded (S1) space; negative
    /// disables it.
    pub s1_prob_threshold: f32,
    /// Maximum per-column posterior drift below which the cached S1
    /// expansion is reused.
    pub diff_threshold: f32,
    /// Background mismatch probability folded into every emission.
    pub background_error: f32,
    /// Dosage decay rate in flanking regions (0 disables).
    pub decay: f64,
}

impl Default for HmmParams {
    fn default() -> Self {
        Self {
            prob_threshold: 0.01,
            s1_prob_threshold: -1.0,
            diff_threshold: 0.01,
            background_error: 1e-5,
            decay: 0.0,
        }
    }
}

/// Template-selection scratch shared by the S3 -> S1 -> S2 transformations.
///
/// Kept apart from the probability matrices so `impute` can borrow forward
/// state immutably while updating these caches.
#[derive(Default)]
struct TemplateState {
    best_s3_haps: Vec<u32>,
    best_s3_probs: Vec<f32>,
    prev_s3_haps: Vec<u32>,
    prev_s3_probs: Vec<f32>,
    best_s1_haps: Vec<u32>,
    best_s1_probs: Vec<f32>,
    s1_sum: f64,
    s2_probs: Vec<f32>,
    s2_cardinalities: Vec<usize>,
}

impl TemplateState {
    fn clear(&mut self) {
        self.best_s3_haps.clear();
        self.best_s3_probs.clear();
        self.prev_s3_haps.clear();
        self.prev_s3_probs.clear();
        self.best_s1_haps.clear();
        self.best_s1_probs.clear();
        self.s1_sum = 0.0;
    }

    /// Whether the current best-S3 set differs from the cached one by more
    /// than `diff_threshold` in any column's posterior.
    fn s3_set_changed(&self, diff_threshold: f32) -> bool {
        if self.best_s3_haps != self.prev_s3_haps {
            return true;
        }
        self.best_s3_probs
            .iter()
            .zip(&self.prev_s3_probs)
            .any(|(a, b)| (a - b).abs() > diff_threshold)
    }

    /// Expand the best S3 columns into per-haplotype (S1) probabilities.
    ///
    /// A haplotype's mass splits into the share that never recombined inside
    /// the block (carrying its junction proportion) and the redistributed
    /// remainder (uniform within the column), on each side independently.
    #[allow(clippy::too_many_arguments)]
    fn s3_to_s1_probs(
        &mut self,
        left: &[f32],
        right: &[f32],
        left_nr: &[f32],
        right_nr: &[f32],
        props_fwd: &[f32],
        props_bwd: &[f32],
        reverse_map: &[Vec<usize>],
        cardinalities: &[usize],
        prob_sum: f64,
        s1_prob_threshold: f32,
    ) {
        self.best_s1_haps.clear();
        self.best_s1_probs.clear();
        self.s1_sum = 0.0;

        for &u in &self.best_s3_haps {
            let u = u as usize;
            let card = cardinalities[u] as f32;
            let l_redist = (left[u] - left_nr[u]) / card;
            let r_redist = (right[u] - right_nr[u]) / card;
            for &h in &reverse_map[u] {
                let lp = left_nr[u] * props_fwd[h] + l_redist;
                let rp = right_nr[u] * props_bwd[h] + r_redist;
                let p = (lp as f64 * rp as f64 / prob_sum) as f32;
                if s1_prob_threshold > 0.0 && p <= s1_prob_threshold {
                    continue;
                }
                self.best_s1_haps.push(h as u32);
                self.best_s1_probs.push(p);
                self.s1_sum += p as f64;
            }
        }
    }

    /// Fold the S1 set into a full-reference block's unique columns.
    fn s1_to_s2_probs(&mut self, uniq_map: &[i64], s2_size: usize) {
        self.s2_probs.clear();
        self.s2_probs.resize(s2_size, 0.0);
        self.s2_cardinalities.clear();
        self.s2_cardinalities.resize(s2_size, 0);
        for (&h, &p) in self.best_s1_haps.iter().zip(&self.best_s1_probs) {
            let c = uniq_map[h as usize];
            if c != UNIQUE_MAP_EOV {
                self.s2_probs[c as usize] += p;
                self.s2_cardinalities[c as usize] += 1;
            }
        }
    }

    /// Posterior ALT probability at an untyped reference variant.
    ///
    /// Mass carried by enumerated haplotypes flows through the S2 fold; the
    /// truncated tail is apportioned by the cardinality of the uncovered
    /// ALT-carrying columns.
    fn untyped_dose(&self, v: &ReferenceVariant, n_templates: usize) -> f32 {
        let mut alt_covered = 0.0f64;
        let mut alt_covered_card = 0usize;
        for (c, &g) in v.gt.iter().enumerate() {
            if g > 0 {
                alt_covered += self.s2_probs[c] as f64;
                alt_covered_card += self.s2_cardinalities[c];
            }
        }
        let n_s1 = self.best_s1_haps.len();
        let rem = (1.0 - self.s1_sum).max(0.0);
        let uncovered = n_templates.saturating_sub(n_s1);
        let tail = if uncovered > 0 {
            rem * v.ac.saturating_sub(alt_covered_card) as f64 / uncovered as f64
        } else {
            0.0
        };
        (alt_covered + tail) as f32
    }
}

/// Per-worker HMM state, reused across haplotypes.
pub struct HiddenMarkovModel {
    params: HmmParams,

    /// `forward_probs[b][i][s]`: forward probability at variant i of typed
    /// block b, unique column s, conditioned through variant i.
    forward_probs: Vec<Vec<Vec<f32>>>,
    /// As above, but never redistributed by recombination since block entry.
    forward_norecom_probs: Vec<Vec<Vec<f32>>>,
    /// `junction_prob_proportions[b][h]`: expanded haplotype h's share of
    /// its column's mass at block b's entry (sums to 1 within each column).
    junction_prob_proportions: Vec<Vec<f32>>,
    /// True where a `JUMP_FIX` rescale was applied during the forward pass.
    precision_jumps: Vec<bool>,

    templates: TemplateState,
}

impl HiddenMarkovModel {
    pub fn new(params: HmmParams) -> Self {
        Self {
            params,
            forward_probs: Vec::new(),
            forward_norecom_probs: Vec::new(),
            junction_prob_proportions: Vec::new(),
            precision_jumps: Vec::new(),
            templates: TemplateState::default(),
        }
    }

    /// True where a precision rescale fired during the last forward pass.
    pub fn precision_jumps(&self) -> &[bool] {
        &self.precision_jumps
    }

    /// Forward pass for one target haplotype over the typed reference
    /// blocks. Retains per-block forward state for `traverse_backward`.
    pub fn traverse_forward(
        &mut self,
        ref_blocks: &VecDeque<UniqueHaplotypeBlock>,
        tar_variants: &[TargetVariant],
        hap_idx: usize,
    ) -> Result<()> {
        let n_blocks = ref_blocks.len();
        debug_assert_eq!(
            tar_variants.len(),
            ref_blocks.iter().map(|b| b.variant_size()).sum::<usize>()
        );

        self.precision_jumps.clear();
        self.precision_jumps.resize(tar_variants.len(), false);
        self.forward_probs.resize(n_blocks, Vec::new());
        self.forward_norecom_probs.resize(n_blocks, Vec::new());
        self.junction_prob_proportions.resize(n_blocks, Vec::new());

        let mut global_idx = 0usize;
        for b in 0..n_blocks {
            let block = &ref_blocks[b];
            let n_uniq = block.unique_haplotype_size();
            let n_vars = block.variant_size();
            self.forward_probs[b].resize(n_vars, Vec::new());
            self.forward_norecom_probs[b].resize(n_vars, Vec::new());
            for i in 0..n_vars {
                self.forward_probs[b][i].clear();
                self.forward_probs[b][i].resize(n_uniq, 0.0);
                self.forward_norecom_probs[b][i].clear();
                self.forward_norecom_probs[b][i].resize(n_uniq, 0.0);
            }

            if b == 0 {
                let mut row = std::mem::take(&mut self.forward_probs[0][0]);
                let mut row_nr = std::mem::take(&mut self.forward_norecom_probs[0][0]);
                let mut props = std::mem::take(&mut self.junction_prob_proportions[0]);
                initialize_likelihoods(&mut row, &mut row_nr, &mut props, block);
                self.forward_probs[0][0] = row;
                self.forward_norecom_probs[0][0] = row_nr;
                self.junction_prob_proportions[0] = props;
            } else {
                // Project the conditioned exit distribution of block b-1
                // onto block b's unique columns, then recombine across the
                // boundary with the boundary variant's switch probability.
                let prev_block = &ref_blocks[b - 1];
                let n_expanded = block.expanded_haplotype_size();
                let mut temp = vec![0.0f32; n_uniq];
                let mut temp_nr = vec![0.0f32; n_uniq];
                {
                    let prev_row = self.forward_probs[b - 1].last().unwrap();
                    let prev_row_nr = self.forward_norecom_probs[b - 1].last().unwrap();
                    let (head, tail) = self.junction_prob_proportions.split_at_mut(b);
                    let prev_props = &head[b - 1];
                    let props = &mut tail[0];
                    props.clear();
                    props.resize(n_expanded, 0.0);

                    for h in 0..n_expanded {
                        let pu = prev_block.unique_map()[h];
                        let cu = block.unique_map()[h];
                        if pu == UNIQUE_MAP_EOV || cu == UNIQUE_MAP_EOV {
                            continue;
                        }
                        let (pu, cu) = (pu as usize, cu as usize);
                        let p = prev_row_nr[pu] * prev_props[h]
                            + (prev_row[pu] - prev_row_nr[pu])
                                / prev_block.cardinalities()[pu] as f32;
                        props[h] = p;
                        temp[cu] += p;
                        // Entering a block, nothing has recombined within it.
                        temp_nr[cu] += p;
                    }
                    for h in 0..n_expanded {
                        let cu = block.unique_map()[h];
                        if cu != UNIQUE_MAP_EOV && temp[cu as usize] > 0.0 {
                            props[h] /= temp[cu as usize];
                        }
                    }
                }

                let recom = tar_variants[global_idx - 1].recom;
                let jumped = transpose(
                    &temp,
                    &mut self.forward_probs[b][0],
                    &temp_nr,
                    &mut self.forward_norecom_probs[b][0],
                    block.cardinalities(),
                    recom as f64,
                );
                self.precision_jumps[global_idx - 1] = jumped;
            }

            for i in 0..n_vars {
                let tar = &tar_variants[global_idx];
                let observed = tar.gt[hap_idx];
                condition(
                    &mut self.forward_probs[b][i],
                    &mut self.forward_norecom_probs[b][i],
                    &block.variants()[i].gt,
                    observed,
                    tar.err,
                    tar.af,
                    self.params.background_error,
                );
                if i + 1 < n_vars {
                    let (cur, next) = split_rows(&mut self.forward_probs[b], i);
                    let (cur_nr, next_nr) = split_rows(&mut self.forward_norecom_probs[b], i);
                    let jumped = transpose(
                        cur,
                        next,
                        cur_nr,
                        next_nr,
                        block.cardinalities(),
                        tar.recom as f64,
                    );
                    self.precision_jumps[global_idx] = jumped;
                }
                global_idx += 1;
            }
        }

        Ok(())
    }

    /// Backward pass for one target haplotype: walks the typed blocks in
    /// reverse, combining stored forward state with the running backward
    /// vectors, imputing every full-reference variant and emitting
    /// leave-one-out dosages at typed sites.
    pub fn traverse_backward(
        &mut self,
        ref_blocks: &VecDeque<UniqueHaplotypeBlock>,
        tar_variants: &[TargetVariant],
        hap_idx: usize,
        reverse_maps: &[Vec<Vec<usize>>],
        full_reference: &ReducedHaplotypes,
        out: &mut HaplotypeDosages,
    ) -> Result<()> {
        let n_blocks = ref_blocks.len();
        let mut global_idx = tar_variants.len();

        let mut backward: Vec<f32> = Vec::new();
        let mut backward_nr: Vec<f32> = Vec::new();
        let mut props_bwd: Vec<f32> = Vec::new();

        let mut full_pos = full_reference.last_pos();
        let mut prev_full_block = usize::MAX;
        let mut prev_best_hap = usize::MAX;
        self.templates.clear();

        for b in (0..n_blocks).rev() {
            let block = &ref_blocks[b];
            let n_uniq = block.unique_haplotype_size();
            let n_expanded = block.expanded_haplotype_size();
            let n_vars = block.variant_size();

            if b == n_blocks - 1 {
                initialize_likelihoods(&mut backward, &mut backward_nr, &mut props_bwd, block);
            } else {
                // Project the conditioned backward distribution of the later
                // block onto this block's columns, mirroring the forward
                // junction, then recombine across the boundary. Column
                // indices do not carry across blocks, so the dominant-column
                // cache resets here.
                prev_best_hap = usize::MAX;
                let later_block = &ref_blocks[b + 1];
                let mut temp = vec![0.0f32; n_uniq];
                let mut temp_nr = vec![0.0f32; n_uniq];
                let mut new_props = vec![0.0f32; n_expanded];
                for h in 0..n_expanded {
                    let lu = later_block.unique_map()[h];
                    let cu = block.unique_map()[h];
                    if lu == UNIQUE_MAP_EOV || cu == UNIQUE_MAP_EOV {
                        continue;
                    }
                    let (lu, cu) = (lu as usize, cu as usize);
                    let p = backward_nr[lu] * props_bwd[h]
                        + (backward[lu] - backward_nr[lu]) / later_block.cardinalities()[lu] as f32;
                    new_props[h] = p;
                    temp[cu] += p;
                    temp_nr[cu] += p;
                }
                for h in 0..n_expanded {
                    let cu = block.unique_map()[h];
                    if cu != UNIQUE_MAP_EOV && temp[cu as usize] > 0.0 {
                        new_props[h] /= temp[cu as usize];
                    }
                }

                backward.clear();
                backward.resize(n_uniq, 0.0);
                backward_nr.clear();
                backward_nr.resize(n_uniq, 0.0);
                props_bwd = new_props;

                let recom = tar_variants[global_idx - 1].recom;
                transpose(
                    &temp,
                    &mut backward,
                    &temp_nr,
                    &mut backward_nr,
                    block.cardinalities(),
                    recom as f64,
                );
            }

            for i in (0..n_vars).rev() {
                global_idx -= 1;
                let tar = &tar_variants[global_idx];
                let observed = tar.gt[hap_idx];

                impute_at_anchor(
                    &self.params,
                    &self.forward_probs[b][i],
                    &self.forward_norecom_probs[b][i],
                    &self.junction_prob_proportions[b],
                    &mut self.templates,
                    block,
                    i,
                    tar,
                    global_idx,
                    observed,
                    &backward,
                    &backward_nr,
                    &props_bwd,
                    &reverse_maps[b],
                    &mut full_pos,
                    &mut prev_full_block,
                    &mut prev_best_hap,
                    out,
                )?;

                condition(
                    &mut backward,
                    &mut backward_nr,
                    &block.variants()[i].gt,
                    observed,
                    tar.err,
                    tar.af,
                    self.params.background_error,
                );

                if i > 0 {
                    let recom = tar_variants[global_idx - 1].recom;
                    let mut next = vec![0.0f32; n_uniq];
                    let mut next_nr = vec![0.0f32; n_uniq];
                    transpose(
                        &backward,
                        &mut next,
                        &backward_nr,
                        &mut next_nr,
                        block.cardinalities(),
                        recom as f64,
                    );
                    backward = next;
                    backward_nr = next_nr;
                }
            }
        }

        debug_assert_eq!(global_idx, 0);
        Ok(())
    }
}

/// Posterior dosage work at one typed site: typed dose + LOO, then the
/// S3 -> S1 -> S2 transformations and the untyped drain of the
/// full-reference cursor down to this anchor.
#[allow(clippy::too_many_arguments)]
fn impute_at_anchor(
    params: &HmmParams,
    left: &[f32],
    left_nr: &[f32],
    props_fwd: &[f32],
    templates: &mut TemplateState,
    block: &UniqueHaplotypeBlock,
    local_idx: usize,
    tar: &TargetVariant,
    row: usize,
    observed: i8,
    backward: &[f32],
    backward_nr: &[f32],
    props_bwd: &[f32],
    reverse_map: &[Vec<usize>],
    full_pos: &mut Option<RefPanelPos<'_>>,
    prev_full_block: &mut usize,
    prev_best_hap: &mut usize,
    out: &mut HaplotypeDosages,
) -> Result<()> {
    let typed_variant = &block.variants()[local_idx];
    let cardinalities = block.cardinalities();
    let n_uniq = left.len();

    // Joint posterior per column: backward vectors carry member sums, so the
    // column joint divides by its cardinality.
    let joint = |u: usize| left[u] as f64 * backward[u] as f64 / cardinalities[u] as f64;

    let mut prob_sum = 0.0f64;
    for u in 0..n_uniq {
        prob_sum += joint(u);
    }
    if !(prob_sum > 0.0) {
        return Err(RemacError::hmm(format!(
            "posterior mass vanished at {}:{}",
            tar.chrom, tar.pos
        )));
    }

    // Typed-site posterior, with a dominant-column shortcut.
    let dose = if *prev_best_hap < n_uniq
        && joint(*prev_best_hap) / prob_sum >= (1.0 - params.prob_threshold) as f64
    {
        templates.best_s3_haps.clear();
        templates.best_s3_probs.clear();
        templates.best_s3_haps.push(*prev_best_hap as u32);
        templates.best_s3_probs.push(1.0);
        bin(typed_variant.gt[*prev_best_hap].max(0) as f32)
    } else {
        let mut alt_sum = 0.0f64;
        let mut best_u = 0usize;
        let mut best_p = -1.0f32;
        templates.best_s3_haps.clear();
        templates.best_s3_probs.clear();
        for u in 0..n_uniq {
            let j = joint(u);
            if typed_variant.gt[u] > 0 {
                alt_sum += j;
            }
            let norm = (j / prob_sum) as f32;
            if norm > params.prob_threshold {
                templates.best_s3_haps.push(u as u32);
                templates.best_s3_probs.push(norm);
            }
            if norm > best_p {
                best_p = norm;
                best_u = u;
            }
        }
        if templates.best_s3_haps.is_empty() {
            templates.best_s3_haps.push(best_u as u32);
            templates.best_s3_probs.push(best_p);
        }
        *prev_best_hap = if best_p >= 1.0 - params.prob_threshold {
            best_u
        } else {
            usize::MAX
        };
        bin((alt_sum / prob_sum) as f32)
    };

    check_unit_interval(dose, tar)?;

    // Leave-one-out: strip this site's emission from each column's joint
    // before normalizing.
    let loo_dose = if observed >= 0 {
        let freq = if observed > 0 { tar.af } else { 1.0 - tar.af };
        let prandom = tar.err * freq + params.background_error;
        let pmatch = (1.0 - tar.err) + tar.err * freq + params.background_error;
        let mut loo_sum = 0.0f64;
        let mut loo_alt = 0.0f64;
        for u in 0..n_uniq {
            let emission = if typed_variant.gt[u] == observed {
                pmatch
            } else {
                prandom
            };
            let j = joint(u) / emission as f64;
            loo_sum += j;
            if typed_variant.gt[u] > 0 {
                loo_alt += j;
            }
        }
        if loo_sum > 0.0 {
            bin((loo_alt / loo_sum) as f32)
        } else {
            dose
        }
    } else {
        dose
    };
    out.loo_dosages[row] = loo_dose;

    // Untyped drain down to this anchor.
    let Some(pos) = full_pos.as_mut() else {
        return Ok(());
    };
    if row > 0 && pos.variant().site.pos < tar.pos {
        return Ok(());
    }

    // Refresh the S1 expansion when the template set moved.
    if templates.s3_set_changed(params.diff_threshold) {
        templates.s3_to_s1_probs(
            left,
            backward,
            left_nr,
            backward_nr,
            props_fwd,
            props_bwd,
            reverse_map,
            cardinalities,
            prob_sum,
            params.s1_prob_threshold,
        );
        *prev_full_block = usize::MAX; // force S2 rebuild
        templates.prev_s3_haps.clone_from(&templates.best_s3_haps);
        templates.prev_s3_probs.clone_from(&templates.best_s3_probs);
    }

    let n_templates: usize = cardinalities.iter().sum();
    let anchor_cm = typed_variant.site.cm;

    loop {
        let Some(pos) = full_pos.as_mut() else {
            break;
        };
        let v = pos.variant();
        if row > 0 && v.site.pos < tar.pos {
            break;
        }

        if pos.block_idx() != *prev_full_block {
            templates.s1_to_s2_probs(pos.unique_map(), pos.cardinalities().len());
            *prev_full_block = pos.block_idx();
        }

        let global = pos.global_idx();
        let is_anchor = v.site.pos == tar.pos
            && v.site.ref_allele == tar.ref_allele
            && v.site.alt_allele == tar.alt_allele;
        if is_anchor {
            out.dosages[global] = dose;
        } else {
            let mut d = templates.untyped_dose(v, n_templates);
            if params.decay > 0.0 && anchor_cm.is_finite() && v.site.cm.is_finite() {
                let af = if n_templates > 0 {
                    v.ac as f32 / n_templates as f32
                } else {
                    0.0
                };
                let w = (-params.decay * (v.site.cm - anchor_cm).abs()).exp() as f32;
                d = af + (d - af) * w;
            }
            let d = bin(d.clamp(0.0, 1.0));
            check_unit_interval(d, tar)?;
            out.dosages[global] = d;
        }

        if !pos.retreat() {
            *full_pos = None;
            break;
        }
    }

    Ok(())
}

/// Uniform start: each column weighted by its cardinality, per-haplotype
/// proportions uniform within each column.
fn initialize_likelihoods(
    probs: &mut Vec<f32>,
    probs_norecom: &mut Vec<f32>,
    proportions: &mut Vec<f32>,
    block: &UniqueHaplotypeBlock,
) {
    let n_templates: usize = block.cardinalities().iter().sum();
    probs.clear();
    probs_norecom.clear();
    proportions.clear();
    proportions.resize(block.expanded_haplotype_size(), 0.0);

    for &c in block.cardinalities() {
        probs.push(c as f32 / n_templates as f32);
    }
    probs_norecom.extend_from_slice(probs);

    for (h, &u) in block.unique_map().iter().enumerate() {
        if u != UNIQUE_MAP_EOV {
            proportions[h] = 1.0 / block.cardinalities()[u as usize] as f32;
        }
    }
}

/// Multiply each column's probability by the emission for the observed
/// allele. Missing observations (negative) skip conditioning.
fn condition(
    probs: &mut [f32],
    probs_norecom: &mut [f32],
    template_gt: &[i8],
    observed: i8,
    err: f32,
    af: f32,
    background_error: f32,
) {
    if observed < 0 {
        return;
    }
    let freq = if observed > 0 { af } else { 1.0 - af };
    let prandom = err * freq + background_error;
    let pmatch = (1.0 - err) + err * freq + background_error;

    for (u, (p, pn)) in probs.iter_mut().zip(probs_norecom.iter_mut()).enumerate() {
        let emission = if template_gt[u] == observed {
            pmatch
        } else {
            prandom
        };
        *p *= emission;
        *pn *= emission;
    }
}

/// Advance probabilities to the next variant, redistributing `recom` of the
/// mass by cardinality. Returns true when an underflow rescale was applied.
fn transpose(
    from: &[f32],
    to: &mut [f32],
    from_norecom: &[f32],
    to_norecom: &mut [f32],
    cardinalities: &[usize],
    recom: f64,
) -> bool {
    debug_assert_eq!(from.len(), to.len());
    let n_templates: usize = cardinalities.iter().sum();
    let sum: f64 = from.iter().map(|&p| p as f64).sum();

    let jumped = (sum as f32) < JUMP_THRESHOLD;
    let fix = if jumped { JUMP_FIX as f64 } else { 1.0 };

    let uniform = sum * recom / n_templates as f64;
    let complement = 1.0 - recom;
    for (u, (t, tn)) in to.iter_mut().zip(to_norecom.iter_mut()).enumerate() {
        *t = (fix * (complement * from[u] as f64 + cardinalities[u] as f64 * uniform)) as f32;
        *tn = (fix * complement * from_norecom[u] as f64) as f32;
    }
    jumped
}

fn check_unit_interval(dose: f32, tar: &TargetVariant) -> Result<()> {
    if !(-1e-3..=1.0 + 1e-3).contains(&dose) {
        return Err(RemacError::hmm(format!(
            "dosage {} outside [0,1] at {}:{}",
            dose, tar.chrom, tar.pos
        )));
    }
    Ok(())
}

/// Disjoint mutable rows i and i+1 of a probability matrix.
fn split_rows(rows: &mut [Vec<f32>], i: usize) -> (&mut Vec<f32>, &mut Vec<f32>) {
    let (a, b) = rows.split_at_mut(i + 1);
    (&mut a[i], &mut b[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::variant::{ReferenceSiteInfo, GT_MISSING};
    use crate::io::reference::generate_reverse_maps;

    fn site(pos: u32) -> ReferenceSiteInfo {
        ReferenceSiteInfo::new("chr1", pos, ".", "A", "T", 0.01, 0.0, f64::NAN)
    }

    fn tar_variant(pos: u32, af: f32, recom: f32, gt: Vec<i8>) -> TargetVariant {
        TargetVariant {
            chrom: "chr1".into(),
            pos,
            id: String::new(),
            ref_allele: "A".into(),
            alt_allele: "T".into(),
            in_target: true,
            in_reference: true,
            af,
            err: 0.01,
            recom,
            gt,
        }
    }

    /// Typed reference and target variants where the first reference
    /// haplotype carries every ALT and the rest carry none.
    fn carrier_panel(n_sites: usize, n_haps: usize) -> (ReducedHaplotypes, Vec<TargetVariant>) {
        let mut typed = ReducedHaplotypes::new(16, 512, 10);
        let mut tar = Vec::new();
        for i in 0..n_sites {
            let pos = 1000 + i as u32 * 100;
            let alleles: Vec<i8> = (0..n_haps).map(|h| i8::from(h == 0)).collect();
            let mut s = site(pos);
            let recom = if i + 1 == n_sites { 0.0 } else { 0.001 };
            s.recom = recom;
            assert!(typed.compress_variant(&s, &alleles, false));
            tar.push(tar_variant(pos, 1.0 / n_haps as f32, recom, vec![1]));
        }
        (typed, tar)
    }

    #[test]
    fn test_forward_probability_conservation() {
        let (typed, tar) = carrier_panel(8, 4);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        for (b, block) in typed.blocks().iter().enumerate() {
            for i in 0..block.variant_size() {
                let sum: f32 = hmm.forward_probs[b][i].iter().sum();
                assert!(
                    sum >= JUMP_THRESHOLD && sum <= 1.05,
                    "forward sum {} out of range at block {} variant {}",
                    sum,
                    b,
                    i
                );
            }
        }
    }

    #[test]
    fn test_single_typed_site_pass_through() {
        // One observed ALT at a site with panel frequency 0.25.
        let mut typed = ReducedHaplotypes::new(16, 512, 10);
        let mut s = site(1000);
        s.recom = 0.0;
        assert!(typed.compress_variant(&s, &[1, 0, 0, 0], false));
        let tar = vec![tar_variant(1000, 0.25, 0.0, vec![1])];

        let reverse_maps = generate_reverse_maps(&typed);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        let mut out = HaplotypeDosages::new(1, 1);
        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        hmm.traverse_backward(typed.blocks(), &tar, 0, &reverse_maps, &typed, &mut out)
            .unwrap();
        assert!(
            out.dosages[0] >= 0.98,
            "pass-through dose {} below 0.98",
            out.dosages[0]
        );
    }

    #[test]
    fn test_matching_haplotype_dominates() {
        let (typed, tar) = carrier_panel(10, 4);
        let reverse_maps = generate_reverse_maps(&typed);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        let mut out = HaplotypeDosages::new(typed.variant_size(), tar.len());

        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        hmm.traverse_backward(typed.blocks(), &tar, 0, &reverse_maps, &typed, &mut out)
            .unwrap();

        for (i, &d) in out.dosages.iter().enumerate() {
            assert!(d >= 0.98, "site {} dose {} below 0.98", i, d);
        }
        // Neighbors pin the template, so leaving one site out barely moves it.
        for (i, &d) in out.loo_dosages.iter().enumerate() {
            assert!(d >= 0.95, "site {} loo {} below 0.95", i, d);
        }
    }

    #[test]
    fn test_missing_observation_falls_back_to_prior() {
        // A single typed site with a missing observation: the posterior is
        // the panel frequency.
        let mut typed = ReducedHaplotypes::new(16, 512, 10);
        let mut s = site(1000);
        s.recom = 0.0;
        assert!(typed.compress_variant(&s, &[1, 0, 0, 0], false));
        let tar = vec![tar_variant(1000, 0.25, 0.0, vec![GT_MISSING])];

        let reverse_maps = generate_reverse_maps(&typed);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        let mut out = HaplotypeDosages::new(1, 1);
        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        hmm.traverse_backward(typed.blocks(), &tar, 0, &reverse_maps, &typed, &mut out)
            .unwrap();
        assert!(
            (out.dosages[0] - 0.25).abs() <= 0.005,
            "expected prior 0.25, got {}",
            out.dosages[0]
        );
    }

    #[test]
    fn test_untyped_sites_follow_template() {
        // Typed sites every 200bp; the full reference interleaves untyped
        // sites where the carrier haplotype also holds the ALT.
        let n_haps = 4;
        let n_typed = 6;
        let mut typed = ReducedHaplotypes::new(16, 512, 10);
        let mut full = ReducedHaplotypes::new(16, 512, 10);
        let mut tar = Vec::new();
        for i in 0..n_typed {
            let pos = 1000 + i as u32 * 200;
            let alleles: Vec<i8> = (0..n_haps).map(|h| i8::from(h == 0)).collect();
            let recom = if i + 1 == n_typed { 0.0 } else { 0.001 };
            let mut s = site(pos);
            s.recom = recom;
            assert!(typed.compress_variant(&s, &alleles, false));
            assert!(full.compress_variant(&s, &alleles, false));
            if i + 1 < n_typed {
                // untyped site between anchors
                let s2 = site(pos + 100);
                assert!(full.compress_variant(&s2, &alleles, false));
            }
            tar.push(tar_variant(pos, 0.25, recom, vec![1]));
        }

        let reverse_maps = generate_reverse_maps(&typed);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        let mut out = HaplotypeDosages::new(full.variant_size(), tar.len());
        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        hmm.traverse_backward(typed.blocks(), &tar, 0, &reverse_maps, &full, &mut out)
            .unwrap();

        for (i, &d) in out.dosages.iter().enumerate() {
            assert!(
                d >= 0.9,
                "full-reference site {} dose {} should follow the carrier",
                i,
                d
            );
        }
    }

    #[test]
    fn test_precision_jump_recovery() {
        // Long stretch of conditioning against a mismatching panel drives
        // the running sum under the jump threshold.
        let n_haps = 4;
        let n_sites = 3000;
        let mut typed = ReducedHaplotypes::new(16, 512, 10);
        let mut tar = Vec::new();
        for i in 0..n_sites {
            let pos = 1000 + i as u32;
            // Panel is all-REF; the target insists on ALT everywhere.
            let alleles: Vec<i8> = vec![0; n_haps];
            let recom = if i + 1 == n_sites { 0.0 } else { 1e-5 };
            let mut s = site(pos);
            s.recom = recom;
            assert!(typed.compress_variant(&s, &alleles, false));
            tar.push(tar_variant(pos, 0.01, recom, vec![1]));
        }

        let reverse_maps = generate_reverse_maps(&typed);
        let mut hmm = HiddenMarkovModel::new(HmmParams::default());
        let mut out = HaplotypeDosages::new(typed.variant_size(), tar.len());
        hmm.traverse_forward(typed.blocks(), &tar, 0).unwrap();
        assert!(
            hmm.precision_jumps().iter().any(|&j| j),
            "expected at least one precision jump"
        );
        hmm.traverse_backward(typed.blocks(), &tar, 0, &reverse_maps, &typed, &mut out)
            .unwrap();
        for &d in &out.dosages {
            assert!((0.0..=1.0).contains(&d), "dose {} outside [0,1]", d);
        }
    }
}
