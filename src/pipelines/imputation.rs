//! # Imputation Pipeline
//!
//! Chunked orchestration: stat the reference, walk the query region in
//! chunk-sized steps with overlap flanks, load both panels, fan the
//! per-haplotype HMM traversals out over a rayon pool, and either write the
//! chunk directly or spill haplotype groups to temp files and merge.

use std::cell::RefCell;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::Config;
use crate::data::genetic_map::GeneticMapFile;
use crate::data::variant::GT_EOV;
use crate::error::{RemacError, Result};
use crate::io::dosage_writer::{typed_only_row, DosageWriter, RecordKind, RecordPlan};
use crate::io::reference::{
    generate_reverse_maps, load_reference_haplotypes, load_reference_haplotypes_old_recom,
    separate_target_only_variants, stat_ref_panel,
};
use crate::io::target::{load_target_haplotypes, stat_tar_panel};
use crate::io::temp::{TempDosageReader, TempDosageWriter};
use crate::io::Region;
use crate::model::dosage::{FullDosagesResults, HaplotypeDosages};
use crate::model::hmm::HiddenMarkovModel;

thread_local! {
    static WORKER_HMM: RefCell<Option<HiddenMarkovModel>> = RefCell::new(None);
}

/// Top-level imputation driver.
pub struct ImputationPipeline {
    config: Config,
    pool: rayon::ThreadPool,
}

impl ImputationPipeline {
    pub fn new(config: Config) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("remac-worker-{}", i))
            .build()
            .map_err(|e| RemacError::config(format!("failed to create thread pool: {}", e)))?;
        Ok(Self { config, pool })
    }

    pub fn run(&self) -> Result<()> {
        let ref_path = self.config.ref_path.as_ref().unwrap();
        let tar_path = self.config.tar_path.as_ref().unwrap();

        let query = self
            .config
            .parsed_region()
            .unwrap_or_else(|| Region::chromosome(""));
        let mut chrom = query.chrom.clone();
        let mut end_pos = query.to;
        stat_ref_panel(ref_path, &mut chrom, &mut end_pos)?;

        let sample_ids = stat_tar_panel(tar_path)?;
        info!(samples = sample_ids.len(), chrom = %chrom, "target panel");

        let mut writer = DosageWriter::new(
            &self.config.out_path,
            self.config.emp_out_path.as_deref(),
            self.config.sites_out_path.as_deref(),
            self.config.output_format()?,
            sample_ids,
            self.config.parse_format_fields()?,
            &chrom,
            self.config.min_r2,
        )?;

        let mut chunk_start = query.from;
        while chunk_start <= end_pos {
            let chunk_end = end_pos.min(chunk_start + self.config.chunk_size as u64 - 1);
            let impute_region = Region::new(chrom.clone(), chunk_start, chunk_end);
            self.impute_chunk(&impute_region, &mut writer)?;
            chunk_start = chunk_end + 1;
        }

        Ok(())
    }

    fn impute_chunk(&self, impute_region: &Region, writer: &mut DosageWriter) -> Result<()> {
        let config = &self.config;
        let overlap = config.overlap as u64;
        let extended_region = Region::new(
            impute_region.chrom.clone(),
            impute_region.from.saturating_sub(overlap).max(1),
            impute_region.to.saturating_add(overlap),
        );

        info!(region = %impute_region, "imputing chunk");

        let mut sample_ids = Vec::new();
        let mut target_sites = Vec::new();
        load_target_haplotypes(
            config.tar_path.as_ref().unwrap(),
            &extended_region,
            &mut target_sites,
            &mut sample_ids,
        )?;

        let mut map_file = match &config.map_path {
            Some(p) => Some(GeneticMapFile::new(p, &impute_region.chrom)?),
            None => None,
        };

        let mut typed_only = Default::default();
        let mut full = Default::default();
        let load = if config.legacy_recom {
            load_reference_haplotypes_old_recom
        } else {
            load_reference_haplotypes
        };
        load(
            config.ref_path.as_ref().unwrap(),
            &extended_region,
            impute_region,
            &config.subset_ids()?,
            &mut target_sites,
            &mut typed_only,
            &mut full,
            map_file.as_mut(),
            config.min_recom,
            config.match_error,
        )?;

        let mut target_only_sites = separate_target_only_variants(&mut target_sites);

        if full.variant_size() == 0 {
            warn!(region = %impute_region, "skipping empty region in reference");
            return Ok(());
        }

        let tar_ref_ratio = typed_only.variant_size() as f32 / full.variant_size() as f32;
        info!(
            ratio = tar_ref_ratio,
            typed = typed_only.variant_size(),
            full = full.variant_size(),
            "typed sites to imputed sites ratio"
        );
        if tar_ref_ratio < config.min_ratio || target_sites.is_empty() {
            if config.fail_min_ratio() {
                return Err(RemacError::RatioBelowMinimum {
                    ratio: tar_ref_ratio,
                    min_ratio: config.min_ratio,
                });
            }
            warn!(
                region = %impute_region,
                "not enough target variants are available to impute this chunk; skipping \
                 (the --min-ratio, --chunk, or --region options may need to be altered)"
            );
            return Ok(());
        }

        if !target_only_sites.is_empty() {
            let in_region = target_only_sites
                .iter()
                .filter(|v| impute_region.contains(v.pos as u64))
                .count();
            if config.all_typed_sites {
                info!(count = in_region, "target-only variants included in output");
            } else {
                info!(count = in_region, "target-only variants excluded from output");
                target_only_sites.clear();
            }
        }

        let reverse_maps = generate_reverse_maps(&typed_only);

        let n_haps = target_sites[0].gt.len();
        if n_haps % sample_ids.len() != 0 {
            return Err(RemacError::malformed(
                "target haplotype count is not a multiple of the sample count",
            ));
        }
        let ploidy = n_haps / sample_ids.len();
        let buffer_size = (config.temp_buffer * ploidy).min(n_haps);

        let mut results = FullDosagesResults::default();
        results.resize(full.variant_size(), target_sites.len(), buffer_size);

        let plan = RecordPlan::build(&target_sites, &target_only_sites, &full, impute_region);

        let params = config.hmm_params();
        let n_full = full.variant_size();
        let n_typed = target_sites.len();

        let mut temp_files: Vec<TempDosageReader> = Vec::new();
        let mut temp_emp_files: Vec<TempDosageReader> = Vec::new();
        let spill = n_haps > buffer_size;

        info!(threads = config.threads, haplotypes = n_haps, "running HMM");

        let mut group_start = 0usize;
        while group_start < n_haps {
            let group_size = buffer_size.min(n_haps - group_start);
            if group_start > 0 {
                results.fill_eov();
            }
            if group_size < buffer_size {
                results.shrink_columns(group_size);
            }

            let typed_ref = &typed_only;
            let full_ref = &full;
            let sites_ref = &target_sites;
            let maps_ref = &reverse_maps;
            let columns: Vec<Option<(usize, HaplotypeDosages)>> = self.pool.install(|| {
                (group_start..group_start + group_size)
                    .into_par_iter()
                    .map(|h| {
                        if sites_ref[0].gt[h] == GT_EOV {
                            return Ok(None); // sample has fewer haplotypes
                        }
                        WORKER_HMM.with(|cell| {
                            let mut slot = cell.borrow_mut();
                            let hmm =
                                slot.get_or_insert_with(|| HiddenMarkovModel::new(params));
                            let mut out = HaplotypeDosages::new(n_full, n_typed);
                            hmm.traverse_forward(typed_ref.blocks(), sites_ref, h)?;
                            hmm.traverse_backward(
                                typed_ref.blocks(),
                                sites_ref,
                                h,
                                maps_ref,
                                full_ref,
                                &mut out,
                            )?;
                            Ok(Some((h, out)))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            for entry in columns.into_iter().flatten() {
                let (h, out) = entry;
                results.set_column(h - group_start, &out);
            }

            if spill {
                let mut temp = TempDosageWriter::create(
                    &config.resolved_temp_prefix(),
                    group_start / buffer_size,
                )?;
                let emp_requested = config.emp_out_path.is_some();
                let mut emp_temp = if emp_requested {
                    Some(TempDosageWriter::create(
                        &config.resolved_temp_prefix(),
                        group_start / buffer_size,
                    )?)
                } else {
                    None
                };

                for desc in &plan.records {
                    match &desc.kind {
                        RecordKind::Imputed { full_row, typed } => {
                            temp.write_row(results.dosage_row(*full_row))?;
                            if let (Some(t), Some(emp)) = (*typed, emp_temp.as_mut()) {
                                emp.write_row(results.loo_dosage_row(t))?;
                            }
                        }
                        RecordKind::TypedOnly { tar_idx } => {
                            temp.write_row(&typed_only_row(
                                &target_only_sites[*tar_idx].gt,
                                group_start..group_start + group_size,
                            ))?;
                        }
                    }
                }

                temp_files.push(temp.into_reader()?);
                if let Some(emp) = emp_temp {
                    temp_emp_files.push(emp.into_reader()?);
                }

                info!(
                    completed = (group_start + group_size) / ploidy,
                    total = sample_ids.len(),
                    "samples imputed"
                );
            }

            group_start += group_size;
        }

        if !temp_files.is_empty() {
            info!(files = temp_files.len(), "merging temp files");
            writer.merge_temp_files(&plan, &target_sites, temp_files, temp_emp_files)?;
        } else {
            let emp_requested = config.emp_out_path.is_some();
            writer.write_records(&plan, &target_sites, |desc| {
                Ok(match &desc.kind {
                    RecordKind::Imputed { full_row, typed } => (
                        results.dosage_row(*full_row).to_vec(),
                        (*typed)
                            .filter(|_| emp_requested)
                            .map(|t| results.loo_dosage_row(t).to_vec()),
                    ),
                    RecordKind::TypedOnly { tar_idx } => (
                        typed_only_row(&target_only_sites[*tar_idx].gt, 0..n_haps),
                        None,
                    ),
                })
            })?;
        }

        writer.finish_chunk();
        Ok(())
    }
}
