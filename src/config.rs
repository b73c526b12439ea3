//! # Configuration Logic
//!
//! CLI argument parsing and validation using clap derive. One binary with
//! three modes: imputation (default), `--update-m3vcf`, and
//! `--compress-reference`. Deprecated option names from earlier releases are
//! accepted with a warning and remapped.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use crate::error::{RemacError, Result};
use crate::io::dosage_writer::{FormatField, OutputFormat};
use crate::io::Region;
use crate::model::hmm::HmmParams;

/// remac: reference-panel genotype imputation
#[derive(Parser, Debug, Clone)]
#[command(name = "remac")]
#[command(version)]
#[command(about = "Fast reference-panel genotype imputation", long_about = None)]
#[command(override_usage = "remac [OPTIONS] <reference.msav> <target.{vcf,vcf.gz,sav}>\n       \
    remac [OPTIONS] --update-m3vcf <reference.m3vcf.gz>\n       \
    remac [OPTIONS] --compress-reference <reference.{vcf,vcf.gz,sav}>")]
pub struct Config {
    /// Reference panel path
    #[arg(value_name = "REFERENCE")]
    pub ref_path: Option<PathBuf>,

    /// Target panel path
    #[arg(value_name = "TARGET")]
    pub tar_path: Option<PathBuf>,

    /// Output path
    #[arg(short = 'o', long = "output", default_value = "/dev/stdout")]
    pub out_path: PathBuf,

    /// Output file format (vcf, vcf.gz, bcf, ubcf, sav, or usav)
    #[arg(short = 'O', long = "output-format", default_value = "sav")]
    pub out_format: String,

    /// Output path for a sites-only file
    #[arg(short = 's', long = "sites")]
    pub sites_out_path: Option<PathBuf>,

    /// Output path for empirical (leave-one-out) dosages
    #[arg(short = 'e', long = "empirical-output")]
    pub emp_out_path: Option<PathBuf>,

    /// Include sites that exist only in the target file
    #[arg(short = 'a', long = "all-typed-sites")]
    pub all_typed_sites: bool,

    /// Genetic map file
    #[arg(short = 'm', long = "map")]
    pub map_path: Option<PathBuf>,

    /// Genomic region to impute (chr, chr:start, or chr:start-end)
    #[arg(short = 'r', long = "region")]
    pub region: Option<String>,

    /// Number of threads
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,

    /// Number of samples to impute before writing to temporary files
    #[arg(short = 'b', long = "temp-buffer", default_value_t = 200)]
    pub temp_buffer: usize,

    /// Maximum chunk length in base pairs to impute at once
    #[arg(short = 'c', long = "chunk", default_value_t = 20_000_000)]
    pub chunk_size: i64,

    /// Flanking length in base pairs fed to the HMM on each side of a chunk
    #[arg(short = 'w', long = "overlap", default_value_t = 3_000_000)]
    pub overlap: i64,

    /// Comma-separated FORMAT fields to generate (GT, HDS, DS, GP, or SD)
    #[arg(short = 'f', long = "format", default_value = "HDS")]
    pub fmt_fields: String,

    /// Comma-separated sample IDs to subset from the reference panel
    #[arg(long = "sample-ids")]
    pub sample_ids: Option<String>,

    /// File of sample IDs (one per line) to subset from the reference panel
    #[arg(long = "sample-ids-file")]
    pub sample_ids_file: Option<PathBuf>,

    /// Prefix path for temporary files (default: ${TMPDIR}/m4_)
    #[arg(long = "temp-prefix")]
    pub temp_prefix: Option<PathBuf>,

    /// Error parameter for HMM match probabilities
    #[arg(long = "match-error", default_value_t = 0.01)]
    pub match_error: f32,

    /// Minimum estimated r-square for output variants
    #[arg(long = "min-r2", default_value_t = -1.0, allow_hyphen_values = true)]
    pub min_r2: f32,

    /// Minimum ratio of typed sites to reference sites
    #[arg(long = "min-ratio", default_value_t = 1e-4)]
    pub min_ratio: f32,

    /// Behavior when --min-ratio is not met ("skip" or "fail")
    #[arg(long = "min-ratio-behavior", default_value = "fail")]
    pub min_ratio_behavior: String,

    /// Minimum switch probability between adjacent typed variants
    #[arg(long = "min-recom", default_value_t = 1e-5)]
    pub min_recom: f32,

    /// Posterior probability threshold for template selection
    #[arg(long = "prob-threshold", default_value_t = 0.01)]
    pub prob_threshold: f32,

    /// Template-selection threshold in the expanded state space (disabled
    /// when negative)
    #[arg(long = "prob-threshold-s1", default_value_t = -1.0, allow_hyphen_values = true)]
    pub prob_threshold_s1: f32,

    /// Posterior drift threshold for reusing template expansions
    #[arg(long = "diff-threshold", default_value_t = 0.01)]
    pub diff_threshold: f32,

    /// Dosage decay rate in flanking regions (0 disables)
    #[arg(long = "decay", default_value_t = 0.0)]
    pub decay: f64,

    /// Derive typed-site switch probabilities by summing per-site reference
    /// values instead of centimorgan differences
    #[arg(long = "legacy-recom", hide = true)]
    pub legacy_recom: bool,

    /// Convert a legacy M3VCF reference panel to the msav container
    #[arg(long = "update-m3vcf")]
    pub update_m3vcf: bool,

    /// Compress a phased VCF reference panel into the msav container
    #[arg(long = "compress-reference")]
    pub compress_reference: bool,

    /// Minimum block size for unique haplotype compression
    #[arg(long = "min-block-size", default_value_t = 10)]
    pub min_block_size: usize,

    /// Maximum block size for unique haplotype compression
    #[arg(long = "max-block-size", default_value_t = 65_535)]
    pub max_block_size: usize,

    /// Slope-check interval for the compression heuristic
    #[arg(long = "slope-unit", default_value_t = 10)]
    pub slope_unit: usize,

    // ==== deprecated options, remapped with a warning ====
    #[arg(long = "allTypedSites", hide = true)]
    pub deprecated_all_typed_sites: bool,

    #[arg(long = "rsid", hide = true)]
    pub deprecated_rsid: bool,

    #[arg(long = "meta", hide = true)]
    pub deprecated_meta: bool,

    #[arg(long = "noPhoneHome", hide = true)]
    pub deprecated_no_phone_home: bool,

    #[arg(long = "referenceEstimates", hide = true)]
    pub deprecated_reference_estimates: bool,

    #[arg(long = "haps", hide = true)]
    pub deprecated_haps: Option<PathBuf>,

    #[arg(long = "refHaps", hide = true)]
    pub deprecated_ref_haps: Option<PathBuf>,

    #[arg(long = "prefix", hide = true)]
    pub deprecated_prefix: Option<String>,

    #[arg(long = "mapFile", hide = true)]
    pub deprecated_map_file: Option<PathBuf>,

    #[arg(long = "chr", hide = true)]
    pub deprecated_chr: Option<String>,

    #[arg(long = "start", hide = true)]
    pub deprecated_start: Option<u64>,

    #[arg(long = "end", hide = true)]
    pub deprecated_end: Option<u64>,

    #[arg(long = "window", hide = true)]
    pub deprecated_window: Option<i64>,

    #[arg(long = "ChunkLengthMb", hide = true)]
    pub deprecated_chunk_length_mb: Option<i64>,

    #[arg(long = "ChunkOverlapMb", hide = true)]
    pub deprecated_chunk_overlap_mb: Option<i64>,

    #[arg(long = "cpus", hide = true)]
    pub deprecated_cpus: Option<usize>,

    #[arg(long = "minRatio", hide = true)]
    pub deprecated_min_ratio: Option<f32>,
}

impl Config {
    /// Parse command line arguments, apply deprecated remappings, and
    /// validate.
    pub fn parse_and_validate() -> Result<Self> {
        Self::try_from_args(std::env::args())
    }

    /// Parse from an explicit argument list (first element is the program
    /// name). Used by tests and embedding callers.
    pub fn try_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Self::parse_from(args);
        config.apply_deprecated();
        config.validate()?;
        Ok(config)
    }

    fn apply_deprecated(&mut self) {
        if self.deprecated_all_typed_sites {
            warn!("--allTypedSites is deprecated in favor of --all-typed-sites");
            self.all_typed_sites = true;
        }
        if self.deprecated_rsid {
            warn!("--rsid is deprecated (on by default)");
        }
        if self.deprecated_no_phone_home {
            warn!("--noPhoneHome is deprecated and ignored");
        }
        if self.deprecated_reference_estimates {
            warn!("--referenceEstimates is deprecated and ignored");
        }
        if let Some(p) = self.deprecated_haps.take() {
            warn!("--haps is deprecated");
            self.tar_path = Some(p);
        }
        if let Some(p) = self.deprecated_ref_haps.take() {
            warn!("--refHaps is deprecated");
            self.ref_path = Some(p);
        }
        if let Some(p) = self.deprecated_map_file.take() {
            warn!("--mapFile is deprecated in favor of --map");
            self.map_path = Some(p);
        }
        if self.deprecated_chr.is_some()
            || self.deprecated_start.is_some()
            || self.deprecated_end.is_some()
        {
            warn!("--chr/--start/--end are deprecated in favor of --region");
            let base = self
                .region
                .as_deref()
                .map(Region::parse)
                .unwrap_or_else(|| Region::chromosome(""));
            let chrom = self.deprecated_chr.take().unwrap_or(base.chrom);
            let from = self.deprecated_start.take().unwrap_or(base.from);
            let to = self.deprecated_end.take().unwrap_or(base.to);
            self.region = Some(Region::new(chrom, from, to).to_string());
        }
        if let Some(w) = self.deprecated_window.take() {
            warn!("--window is deprecated in favor of --overlap");
            self.overlap = w;
        }
        if let Some(c) = self.deprecated_chunk_length_mb.take() {
            warn!("--ChunkLengthMb is deprecated in favor of --chunk");
            self.chunk_size = c * 1_000_000;
        }
        if let Some(w) = self.deprecated_chunk_overlap_mb.take() {
            warn!("--ChunkOverlapMb is deprecated in favor of --overlap");
            self.overlap = w * 1_000_000;
        }
        if let Some(t) = self.deprecated_cpus.take() {
            warn!("--cpus is deprecated in favor of --threads");
            self.threads = t;
        }
        if let Some(r) = self.deprecated_min_ratio.take() {
            warn!("--minRatio is deprecated in favor of --min-ratio");
            self.min_ratio = r;
        }
        if let Some(prefix) = self.deprecated_prefix.take() {
            warn!("--prefix is deprecated in favor of --output, --empirical-output, and --sites");
            // Previous releases wrote bgzipped VCF under the prefix.
            if self.out_format == "sav" {
                self.out_format = "vcf.gz".to_string();
            }
            let suffix = match self.out_format.as_str() {
                "vcf" => "vcf",
                "bcf" | "ubcf" => "bcf",
                "sav" | "usav" => "sav",
                _ => "vcf.gz",
            };
            self.out_path = PathBuf::from(format!("{}.dose.{}", prefix, suffix));
            self.sites_out_path = Some(PathBuf::from(format!("{}.sites.{}", prefix, suffix)));
            if self.deprecated_meta {
                self.emp_out_path =
                    Some(PathBuf::from(format!("{}.empiricalDose.{}", prefix, suffix)));
            }
        }
        if self.deprecated_meta {
            warn!("--meta is deprecated in favor of --empirical-output");
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.ref_path.is_none() {
            return Err(RemacError::config("missing reference panel argument"));
        }
        if !self.update_m3vcf && !self.compress_reference && self.tar_path.is_none() {
            return Err(RemacError::config("missing target panel argument"));
        }
        if self.update_m3vcf && self.compress_reference {
            return Err(RemacError::config(
                "--update-m3vcf and --compress-reference are mutually exclusive",
            ));
        }

        self.parse_format_fields()?;
        const FORMATS: [&str; 6] = ["vcf", "vcf.gz", "bcf", "ubcf", "sav", "usav"];
        if !FORMATS.contains(&self.out_format.as_str()) {
            return Err(RemacError::config(format!(
                "invalid --output-format ({})",
                self.out_format
            )));
        }

        if self.min_ratio_behavior != "skip" && self.min_ratio_behavior != "fail" {
            return Err(RemacError::config(format!(
                "invalid --min-ratio-behavior ({})",
                self.min_ratio_behavior
            )));
        }

        // Clamp numeric knobs to their meaningful ranges.
        self.match_error = self.match_error.clamp(0.0, 0.5);
        self.min_ratio = self.min_ratio.clamp(0.0, 1.0);
        self.min_recom = self.min_recom.clamp(0.0, 0.5);
        self.prob_threshold = self.prob_threshold.clamp(0.0, 1.0);
        self.prob_threshold_s1 = self.prob_threshold_s1.min(1.0);
        self.diff_threshold = self.diff_threshold.max(0.0);
        self.min_block_size = self.min_block_size.max(1);
        self.max_block_size = self.max_block_size.max(1);
        self.slope_unit = self.slope_unit.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.overlap = self.overlap.max(0);
        self.threads = self.threads.max(1);
        self.temp_buffer = self.temp_buffer.max(1);

        Ok(())
    }

    /// Resolved FORMAT field list; HDS is forced in when empirical output
    /// is requested.
    pub fn parse_format_fields(&self) -> Result<Vec<FormatField>> {
        let mut fields = Vec::new();
        for name in self.fmt_fields.split(',') {
            let f = FormatField::parse(name.trim()).ok_or_else(|| {
                RemacError::config(format!("invalid --format option ({})", name))
            })?;
            if !fields.contains(&f) {
                fields.push(f);
            }
        }
        if self.emp_out_path.is_some() && !fields.contains(&FormatField::Hds) {
            fields.push(FormatField::Hds);
        }
        Ok(fields)
    }

    /// Resolved output container format. BCF names are accepted but this
    /// build carries no native BCF encoder, so they fall back to VCF with a
    /// warning.
    pub fn output_format(&self) -> Result<OutputFormat> {
        Ok(match self.out_format.as_str() {
            "vcf" => OutputFormat::Vcf,
            "vcf.gz" => OutputFormat::VcfGz,
            "sav" => OutputFormat::Sav,
            "usav" => OutputFormat::Usav,
            "bcf" => {
                warn!("BCF output is not supported by this build; writing bgzipped VCF instead");
                OutputFormat::VcfGz
            }
            "ubcf" => {
                warn!("BCF output is not supported by this build; writing plain VCF instead");
                OutputFormat::Vcf
            }
            other => {
                return Err(RemacError::config(format!(
                    "invalid --output-format ({})",
                    other
                )))
            }
        })
    }

    /// Query region, when one was given.
    pub fn parsed_region(&self) -> Option<Region> {
        self.region.as_deref().map(Region::parse)
    }

    /// Reference sample subset from --sample-ids and --sample-ids-file.
    pub fn subset_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        if let Some(list) = &self.sample_ids {
            ids.extend(list.split(',').map(|s| s.trim().to_string()));
        }
        if let Some(path) = &self.sample_ids_file {
            let text = std::fs::read_to_string(path)
                .map_err(|e| RemacError::input_missing(path, e.to_string()))?;
            ids.extend(text.split_whitespace().map(|s| s.to_string()));
        }
        ids.remove("");
        Ok(ids)
    }

    /// Temp-file prefix: --temp-prefix, else ${TMPDIR}/m4_, else /tmp/m4_.
    pub fn resolved_temp_prefix(&self) -> PathBuf {
        if let Some(p) = &self.temp_prefix {
            return p.clone();
        }
        match std::env::var("TMPDIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join("m4_"),
            _ => PathBuf::from("/tmp/m4_"),
        }
    }

    /// Whether a failed ratio check aborts instead of skipping the chunk.
    pub fn fail_min_ratio(&self) -> bool {
        self.min_ratio_behavior == "fail"
    }

    pub fn hmm_params(&self) -> HmmParams {
        HmmParams {
            prob_threshold: self.prob_threshold,
            s1_prob_threshold: self.prob_threshold_s1,
            diff_threshold: self.diff_threshold,
            background_error: 1e-5,
            decay: self.decay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut config = Config::parse_from(args);
        config.apply_deprecated();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_defaults() {
        let c = parse(&["remac", "ref.msav", "tar.vcf.gz"]);
        assert_eq!(c.chunk_size, 20_000_000);
        assert_eq!(c.overlap, 3_000_000);
        assert_eq!(c.threads, 1);
        assert_eq!(c.temp_buffer, 200);
        assert_eq!(c.min_block_size, 10);
        assert_eq!(c.max_block_size, 65_535);
        assert_eq!(c.slope_unit, 10);
        assert!((c.match_error - 0.01).abs() < 1e-9);
        assert!(c.fail_min_ratio());
        assert_eq!(c.parse_format_fields().unwrap(), vec![FormatField::Hds]);
    }

    #[test]
    fn test_block_size_options_write_their_own_fields() {
        let c = parse(&[
            "remac",
            "--compress-reference",
            "--min-block-size",
            "32",
            "--max-block-size",
            "1024",
            "--slope-unit",
            "5",
            "ref.vcf.gz",
        ]);
        assert_eq!(c.min_block_size, 32);
        assert_eq!(c.max_block_size, 1024);
        assert_eq!(c.slope_unit, 5);
        assert!((c.min_ratio - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn test_format_list_parses() {
        let c = parse(&["remac", "-f", "GT,DS,HDS", "ref.msav", "tar.vcf.gz"]);
        assert_eq!(
            c.parse_format_fields().unwrap(),
            vec![FormatField::Gt, FormatField::Ds, FormatField::Hds]
        );
    }

    #[test]
    fn test_invalid_format_rejected() {
        let mut c = Config::parse_from(["remac", "-f", "XX", "ref.msav", "tar.vcf.gz"]);
        c.apply_deprecated();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_empirical_output_forces_hds() {
        let c = parse(&[
            "remac",
            "-f",
            "GT",
            "-e",
            "emp.sav",
            "ref.msav",
            "tar.vcf.gz",
        ]);
        assert!(c.parse_format_fields().unwrap().contains(&FormatField::Hds));
    }

    #[test]
    fn test_deprecated_chr_start_end() {
        let c = parse(&[
            "remac",
            "--chr",
            "20",
            "--start",
            "100",
            "--end",
            "500",
            "ref.msav",
            "tar.vcf.gz",
        ]);
        assert_eq!(c.parsed_region().unwrap(), Region::new("20", 100, 500));
    }

    #[test]
    fn test_deprecated_prefix_derives_paths() {
        let c = parse(&["remac", "--prefix", "outdir/run1", "ref.msav", "tar.vcf.gz"]);
        assert_eq!(c.out_path, PathBuf::from("outdir/run1.dose.vcf.gz"));
        assert_eq!(
            c.sites_out_path,
            Some(PathBuf::from("outdir/run1.sites.vcf.gz"))
        );
    }

    #[test]
    fn test_missing_target_rejected() {
        let mut c = Config::parse_from(["remac", "ref.msav"]);
        c.apply_deprecated();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_compress_reference_single_positional() {
        let c = parse(&["remac", "--compress-reference", "ref.vcf.gz"]);
        assert!(c.compress_reference);
        assert!(c.tar_path.is_none());
    }
}
