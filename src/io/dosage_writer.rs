//! # Dosage Writer
//!
//! Final write-out of imputed chunks: one record per reference variant in
//! the impute region, optionally interleaved with target-only sites, with
//! FORMAT fields derived from per-haplotype dosages and INFO statistics
//! (AF, MAF, AVG_CS, R2, and ER2 for the empirical output).
//!
//! The same record plan drives three paths: direct write-out from the
//! in-memory dosage matrix, per-group temp spills, and the lockstep merge of
//! those temps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use noodles::bgzf as bgzf_io;
use tracing::info;

use crate::data::reduced::ReducedHaplotypes;
use crate::data::variant::{
    eov_f32, is_eov_f32, is_missing_f32, missing_f32, TargetVariant, GT_EOV, GT_MISSING,
};
use crate::error::{RemacError, Result};
use crate::io::temp::TempDosageReader;
use crate::io::Region;

/// Output container family for dosage records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Vcf,
    VcfGz,
    Sav,
    Usav,
}

/// FORMAT fields the writer can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatField {
    Gt,
    Hds,
    Ds,
    Gp,
    Sd,
}

impl FormatField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GT" => Some(Self::Gt),
            "HDS" => Some(Self::Hds),
            "DS" => Some(Self::Ds),
            "GP" => Some(Self::Gp),
            "SD" => Some(Self::Sd),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gt => "GT",
            Self::Hds => "HDS",
            Self::Ds => "DS",
            Self::Gp => "GP",
            Self::Sd => "SD",
        }
    }
}

/// What one output record is backed by.
#[derive(Clone, Debug)]
pub enum RecordKind {
    /// A reference-panel variant: a row of the dosage matrix, possibly a
    /// typed site (index into `target_sites`, which is also its LOO row).
    Imputed {
        full_row: usize,
        typed: Option<usize>,
    },
    /// A site exclusive to the target file, passed through unchanged.
    TypedOnly { tar_idx: usize },
}

/// One output record's identity and data source.
#[derive(Clone, Debug)]
pub struct RecordDesc {
    pub chrom: String,
    pub pos: u32,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub kind: RecordKind,
}

/// Position-ordered output records for one chunk.
pub struct RecordPlan {
    pub records: Vec<RecordDesc>,
}

impl RecordPlan {
    /// Interleave the full reference (clipped to the impute region) with
    /// target-only sites by position, and mark typed reference sites.
    pub fn build(
        target_sites: &[TargetVariant],
        target_only_sites: &[TargetVariant],
        full_reference: &ReducedHaplotypes,
        impute_region: &Region,
    ) -> Self {
        let mut records = Vec::with_capacity(full_reference.variant_size());
        let mut only_iter = target_only_sites
            .iter()
            .enumerate()
            .filter(|(_, v)| impute_region.contains(v.pos as u64))
            .peekable();
        let mut typed_from = 0usize;

        let mut pos_opt = full_reference.first_pos();
        let mut full_row = 0usize;
        while let Some(pos) = pos_opt.as_mut() {
            let v = pos.variant();

            while let Some(&(tar_idx, only)) = only_iter.peek() {
                if only.pos <= v.site.pos {
                    records.push(RecordDesc {
                        chrom: only.chrom.clone(),
                        pos: only.pos,
                        id: only.id.clone(),
                        ref_allele: only.ref_allele.clone(),
                        alt_allele: only.alt_allele.clone(),
                        kind: RecordKind::TypedOnly { tar_idx },
                    });
                    only_iter.next();
                } else {
                    break;
                }
            }

            while typed_from < target_sites.len() && target_sites[typed_from].pos < v.site.pos {
                typed_from += 1;
            }
            let typed = (typed_from..target_sites.len())
                .take_while(|&t| target_sites[t].pos == v.site.pos)
                .find(|&t| {
                    target_sites[t].ref_allele == v.site.ref_allele
                        && target_sites[t].alt_allele == v.site.alt_allele
                });

            records.push(RecordDesc {
                chrom: v.site.chrom.clone(),
                pos: v.site.pos,
                id: v.site.id.clone(),
                ref_allele: v.site.ref_allele.clone(),
                alt_allele: v.site.alt_allele.clone(),
                kind: RecordKind::Imputed { full_row, typed },
            });

            full_row += 1;
            if !pos.advance() {
                break;
            }
        }
        for (tar_idx, only) in only_iter {
            records.push(RecordDesc {
                chrom: only.chrom.clone(),
                pos: only.pos,
                id: only.id.clone(),
                ref_allele: only.ref_allele.clone(),
                alt_allele: only.alt_allele.clone(),
                kind: RecordKind::TypedOnly { tar_idx },
            });
        }

        Self { records }
    }
}

/// Per-record dosage statistics: the estimated-correlation formula is the
/// dosage R-squared `(Σd² − (Σd)²/n) / (Σd − (Σd)²/n)`.
struct RecordStats {
    af: f32,
    maf: f32,
    avg_cs: f32,
    r2: f32,
}

fn record_stats(hds: &[f32]) -> RecordStats {
    let mut n = 0usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut cs_sum = 0.0f64;
    for &d in hds {
        if is_eov_f32(d) || is_missing_f32(d) {
            continue;
        }
        n += 1;
        sum += d as f64;
        sum_sq += d as f64 * d as f64;
        cs_sum += d.max(1.0 - d) as f64;
    }
    if n == 0 {
        return RecordStats {
            af: 0.0,
            maf: 0.0,
            avg_cs: 0.0,
            r2: 0.0,
        };
    }
    let af = (sum / n as f64) as f32;
    let mean_term = sum * sum / n as f64;
    let num = sum_sq - mean_term;
    let den = sum - mean_term;
    let r2 = if num <= 0.0 || den <= 0.0 {
        0.0
    } else {
        ((num / den) as f32).clamp(0.0, 1.0)
    };
    RecordStats {
        af,
        maf: af.min(1.0 - af),
        avg_cs: (cs_sum / n as f64) as f32,
        r2,
    }
}

/// Squared Pearson correlation between observed alleles and leave-one-out
/// dosages over the haplotypes where both are present.
fn empirical_r2(observed: &[i8], loo: &[f32]) -> Option<f32> {
    let mut n = 0usize;
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&o, &d) in observed.iter().zip(loo) {
        if o < 0 || is_eov_f32(d) || is_missing_f32(d) {
            continue;
        }
        let x = o as f64;
        let y = d as f64;
        n += 1;
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
    }
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let cov = sxy - sx * sy / nf;
    let vx = sxx - sx * sx / nf;
    let vy = syy - sy * sy / nf;
    if vx <= 0.0 || vy <= 0.0 {
        return None;
    }
    Some(((cov * cov / (vx * vy)) as f32).clamp(0.0, 1.0))
}

enum Sink {
    Text(Box<dyn Write + Send>),
    Binary(Box<dyn Write + Send>),
}

impl Sink {
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Text(w) | Sink::Binary(w) => w.flush(),
        }
    }
}

/// Writer over a chunk's output records.
pub struct DosageWriter {
    sink: Sink,
    emp_sink: Option<Sink>,
    sites_sink: Option<Sink>,
    fmt_fields: Vec<FormatField>,
    sample_ids: Vec<String>,
    min_r2: f32,
    er2_sum: f64,
    er2_n: usize,
}

const SAV_MAGIC: &[u8; 4] = b"RSAV";

impl DosageWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        out_path: &Path,
        emp_out_path: Option<&Path>,
        sites_out_path: Option<&Path>,
        format: OutputFormat,
        sample_ids: Vec<String>,
        fmt_fields: Vec<FormatField>,
        chrom: &str,
        min_r2: f32,
    ) -> Result<Self> {
        let mut writer = Self {
            sink: open_sink(out_path, format)?,
            emp_sink: emp_out_path.map(|p| open_sink(p, format)).transpose()?,
            sites_sink: sites_out_path.map(|p| open_sink(p, format)).transpose()?,
            fmt_fields,
            sample_ids,
            min_r2,
            er2_sum: 0.0,
            er2_n: 0,
        };
        writer.write_headers(chrom)?;
        Ok(writer)
    }

    fn write_headers(&mut self, chrom: &str) -> Result<()> {
        write_header(&mut self.sink, chrom, &self.fmt_fields, &self.sample_ids, false)?;
        if let Some(sink) = self.emp_sink.as_mut() {
            write_header(sink, chrom, &[FormatField::Hds], &self.sample_ids, true)?;
        }
        if let Some(sink) = self.sites_sink.as_mut() {
            write_header(sink, chrom, &[], &[], false)?;
        }
        Ok(())
    }

    /// Write every planned record, pulling dosage rows from `values`.
    ///
    /// `values` receives each record descriptor and must return the full
    /// HDS row (all haplotypes) plus, for typed sites when empirical output
    /// is enabled, the leave-one-out row.
    pub fn write_records<F>(
        &mut self,
        plan: &RecordPlan,
        target_sites: &[TargetVariant],
        mut values: F,
    ) -> Result<()>
    where
        F: FnMut(&RecordDesc) -> Result<(Vec<f32>, Option<Vec<f32>>)>,
    {
        for desc in &plan.records {
            let (hds, loo) = values(desc)?;
            self.write_one(desc, target_sites, &hds, loo.as_deref())?;
        }
        self.sink.flush().map_err(RemacError::OutputIo)?;
        if let Some(s) = self.emp_sink.as_mut() {
            s.flush().map_err(RemacError::OutputIo)?;
        }
        if let Some(s) = self.sites_sink.as_mut() {
            s.flush().map_err(RemacError::OutputIo)?;
        }
        Ok(())
    }

    /// Merge per-group spill files: reads one row per record from every
    /// temp in lockstep (all temps share the plan's record order) and
    /// concatenates the per-haplotype values in file order.
    pub fn merge_temp_files(
        &mut self,
        plan: &RecordPlan,
        target_sites: &[TargetVariant],
        mut temp_files: Vec<TempDosageReader>,
        mut temp_emp_files: Vec<TempDosageReader>,
    ) -> Result<()> {
        self.write_records(plan, target_sites, |desc| {
            let mut hds = Vec::new();
            for t in temp_files.iter_mut() {
                if !t.read_row_into(&mut hds)? {
                    return Err(RemacError::TempIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "temp file ended before record plan",
                    )));
                }
            }
            let loo = match (&desc.kind, temp_emp_files.is_empty()) {
                (RecordKind::Imputed { typed: Some(_), .. }, false) => {
                    let mut loo = Vec::new();
                    for t in temp_emp_files.iter_mut() {
                        if !t.read_row_into(&mut loo)? {
                            return Err(RemacError::TempIo(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "empirical temp file ended before record plan",
                            )));
                        }
                    }
                    Some(loo)
                }
                _ => None,
            };
            Ok((hds, loo))
        })
    }

    fn write_one(
        &mut self,
        desc: &RecordDesc,
        target_sites: &[TargetVariant],
        hds: &[f32],
        loo: Option<&[f32]>,
    ) -> Result<()> {
        let stats = record_stats(hds);
        let (flag, typed_idx) = match &desc.kind {
            RecordKind::Imputed { typed: Some(t), .. } => ("TYPED", Some(*t)),
            RecordKind::Imputed { typed: None, .. } => ("IMPUTED", None),
            RecordKind::TypedOnly { .. } => ("TYPED_ONLY", None),
        };

        if self.min_r2 >= 0.0
            && matches!(desc.kind, RecordKind::Imputed { .. })
            && stats.r2 < self.min_r2
        {
            return Ok(());
        }

        let mut info = format!(
            "AF={:.5};MAF={:.5};AVG_CS={:.5};R2={:.5}",
            stats.af, stats.maf, stats.avg_cs, stats.r2
        );
        info.push(';');
        info.push_str(flag);

        write_record(&mut self.sink, desc, &info, &self.fmt_fields, hds, &self.sample_ids)
            .map_err(RemacError::OutputIo)?;

        if let Some(sink) = self.sites_sink.as_mut() {
            write_sites_record(sink, desc, &info).map_err(RemacError::OutputIo)?;
        }

        if let (Some(t), Some(loo)) = (typed_idx, loo) {
            let er2 = empirical_r2(&target_sites[t].gt, loo);
            if let Some(er2) = er2 {
                self.er2_sum += er2 as f64;
                self.er2_n += 1;
            }
            if let Some(sink) = self.emp_sink.as_mut() {
                let mut emp_info = info.clone();
                if let Some(er2) = er2 {
                    emp_info = format!("{};ER2={:.5}", emp_info, er2);
                }
                write_record(
                    sink,
                    desc,
                    &emp_info,
                    &[FormatField::Hds],
                    loo,
                    &self.sample_ids,
                )
                .map_err(RemacError::OutputIo)?;
            }
        }

        Ok(())
    }

    /// Log and reset the chunk's mean empirical R2.
    pub fn finish_chunk(&mut self) {
        if self.er2_n > 0 {
            info!(
                mean_er2 = self.er2_sum / self.er2_n as f64,
                typed_sites = self.er2_n,
                "chunk empirical accuracy"
            );
        }
        self.er2_sum = 0.0;
        self.er2_n = 0;
    }
}

fn open_sink(path: &Path, format: OutputFormat) -> Result<Sink> {
    let file = File::create(path).map_err(RemacError::OutputIo)?;
    Ok(match format {
        OutputFormat::Vcf => Sink::Text(Box::new(BufWriter::new(file))),
        OutputFormat::VcfGz => Sink::Text(Box::new(bgzf_io::Writer::new(file))),
        OutputFormat::Sav => Sink::Binary(Box::new(bgzf_io::Writer::new(file))),
        OutputFormat::Usav => Sink::Binary(Box::new(BufWriter::new(file))),
    })
}

fn write_header(
    sink: &mut Sink,
    chrom: &str,
    fmt_fields: &[FormatField],
    sample_ids: &[String],
    empirical: bool,
) -> Result<()> {
    write_header_io(sink, chrom, fmt_fields, sample_ids, empirical).map_err(RemacError::OutputIo)
}

fn write_header_io(
    sink: &mut Sink,
    chrom: &str,
    fmt_fields: &[FormatField],
    sample_ids: &[String],
    empirical: bool,
) -> std::io::Result<()> {
    match sink {
        Sink::Text(w) => {
            writeln!(w, "##fileformat=VCFv4.2")?;
            writeln!(w, "##contig=<ID={}>", chrom)?;
            writeln!(w, "##INFO=<ID=AF,Number=1,Type=Float,Description=\"Estimated Alternate Allele Frequency\">")?;
            writeln!(w, "##INFO=<ID=MAF,Number=1,Type=Float,Description=\"Estimated Minor Allele Frequency\">")?;
            writeln!(w, "##INFO=<ID=AVG_CS,Number=1,Type=Float,Description=\"Average Call Score\">")?;
            writeln!(w, "##INFO=<ID=R2,Number=1,Type=Float,Description=\"Estimated Imputation Accuracy (R-square)\">")?;
            if empirical {
                writeln!(w, "##INFO=<ID=ER2,Number=1,Type=Float,Description=\"Empirical (Leave-One-Out) R-square\">")?;
            }
            writeln!(w, "##INFO=<ID=IMPUTED,Number=0,Type=Flag,Description=\"Marker was imputed\">")?;
            writeln!(w, "##INFO=<ID=TYPED,Number=0,Type=Flag,Description=\"Marker was genotyped and imputed\">")?;
            writeln!(w, "##INFO=<ID=TYPED_ONLY,Number=0,Type=Flag,Description=\"Marker was genotyped but not imputed\">")?;
            for f in fmt_fields {
                let line = match f {
                    FormatField::Gt => "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">",
                    FormatField::Hds => "##FORMAT=<ID=HDS,Number=.,Type=Float,Description=\"Estimated Haploid Alternate Allele Dosage\">",
                    FormatField::Ds => "##FORMAT=<ID=DS,Number=1,Type=Float,Description=\"Estimated Alternate Allele Dosage\">",
                    FormatField::Gp => "##FORMAT=<ID=GP,Number=G,Type=Float,Description=\"Estimated Posterior Genotype Probabilities\">",
                    FormatField::Sd => "##FORMAT=<ID=SD,Number=1,Type=Float,Description=\"Variance of Posterior Genotype Probabilities\">",
                };
                writeln!(w, "{}", line)?;
            }
            write!(w, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO")?;
            if !sample_ids.is_empty() {
                write!(w, "\tFORMAT")?;
                for id in sample_ids {
                    write!(w, "\t{}", id)?;
                }
            }
            writeln!(w)?;
            Ok(())
        }
        Sink::Binary(w) => {
            w.write_all(SAV_MAGIC)?;
            w.write_all(&[1u8])?;
            w.write_all(&(sample_ids.len() as u32).to_le_bytes())?;
            for id in sample_ids {
                w.write_all(&(id.len() as u32).to_le_bytes())?;
                w.write_all(id.as_bytes())?;
            }
            Ok(())
        }
    }
}

fn write_record(
    sink: &mut Sink,
    desc: &RecordDesc,
    info: &str,
    fmt_fields: &[FormatField],
    hds: &[f32],
    sample_ids: &[String],
) -> std::io::Result<()> {
    match sink {
        Sink::Text(w) => {
            let id = if desc.id.is_empty() { "." } else { &desc.id };
            write!(
                w,
                "{}\t{}\t{}\t{}\t{}\t.\tPASS\t{}",
                desc.chrom, desc.pos, id, desc.ref_allele, desc.alt_allele, info
            )?;
            if !sample_ids.is_empty() {
                let fmt: Vec<&str> = fmt_fields.iter().map(|f| f.name()).collect();
                write!(w, "\t{}", fmt.join(":"))?;
                let ploidy = hds.len() / sample_ids.len();
                for s in 0..sample_ids.len() {
                    let slots = &hds[s * ploidy..(s + 1) * ploidy];
                    // Drop end-of-vector padding for lower-ploidy samples.
                    let values: Vec<f32> =
                        slots.iter().copied().filter(|&d| !is_eov_f32(d)).collect();
                    write!(w, "\t")?;
                    write_sample_fields(w, fmt_fields, &values)?;
                }
            }
            writeln!(w)
        }
        Sink::Binary(w) => {
            w.write_all(&desc.pos.to_le_bytes())?;
            for s in [&desc.id, &desc.ref_allele, &desc.alt_allele] {
                w.write_all(&(s.len() as u32).to_le_bytes())?;
                w.write_all(s.as_bytes())?;
            }
            w.write_all(&(info.len() as u32).to_le_bytes())?;
            w.write_all(info.as_bytes())?;
            w.write_all(&(hds.len() as u32).to_le_bytes())?;
            for &d in hds {
                w.write_all(&d.to_le_bytes())?;
            }
            Ok(())
        }
    }
}

fn write_sites_record(sink: &mut Sink, desc: &RecordDesc, info: &str) -> std::io::Result<()> {
    match sink {
        Sink::Text(w) => {
            let id = if desc.id.is_empty() { "." } else { &desc.id };
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t.\tPASS\t{}",
                desc.chrom, desc.pos, id, desc.ref_allele, desc.alt_allele, info
            )
        }
        Sink::Binary(w) => {
            w.write_all(&desc.pos.to_le_bytes())?;
            for s in [&desc.id, &desc.ref_allele, &desc.alt_allele] {
                w.write_all(&(s.len() as u32).to_le_bytes())?;
                w.write_all(s.as_bytes())?;
            }
            w.write_all(&(info.len() as u32).to_le_bytes())?;
            w.write_all(info.as_bytes())?;
            w.write_all(&0u32.to_le_bytes())?;
            Ok(())
        }
    }
}

fn write_sample_fields(
    w: &mut impl Write,
    fmt_fields: &[FormatField],
    values: &[f32],
) -> std::io::Result<()> {
    for (k, field) in fmt_fields.iter().enumerate() {
        if k > 0 {
            write!(w, ":")?;
        }
        match field {
            FormatField::Gt => {
                for (i, &d) in values.iter().enumerate() {
                    if i > 0 {
                        write!(w, "|")?;
                    }
                    if is_missing_f32(d) {
                        write!(w, ".")?;
                    } else {
                        write!(w, "{}", u8::from(d > 0.5))?;
                    }
                }
            }
            FormatField::Hds => {
                for (i, &d) in values.iter().enumerate() {
                    if i > 0 {
                        write!(w, ",")?;
                    }
                    if is_missing_f32(d) {
                        write!(w, ".")?;
                    } else {
                        write!(w, "{:.3}", d)?;
                    }
                }
            }
            FormatField::Ds => {
                if values.iter().any(|&d| is_missing_f32(d)) {
                    write!(w, ".")?;
                } else {
                    let ds: f32 = values.iter().sum();
                    write!(w, "{:.3}", ds)?;
                }
            }
            FormatField::Gp => {
                if values.iter().any(|&d| is_missing_f32(d)) {
                    write!(w, ".")?;
                } else {
                    match values {
                        [d] => write!(w, "{:.3},{:.3}", 1.0 - d, d)?,
                        [d1, d2] => {
                            let p00 = (1.0 - d1) * (1.0 - d2);
                            let p01 = d1 * (1.0 - d2) + d2 * (1.0 - d1);
                            let p11 = d1 * d2;
                            write!(w, "{:.3},{:.3},{:.3}", p00, p01, p11)?;
                        }
                        _ => write!(w, ".")?,
                    }
                }
            }
            FormatField::Sd => {
                if values.iter().any(|&d| is_missing_f32(d)) {
                    write!(w, ".")?;
                } else {
                    let sd: f32 = values.iter().map(|&d| d * (1.0 - d)).sum();
                    write!(w, "{:.3}", sd)?;
                }
            }
        }
    }
    Ok(())
}

/// Map a target genotype vector to pass-through dosage values for a
/// haplotype range.
pub fn typed_only_row(gt: &[i8], range: std::ops::Range<usize>) -> Vec<f32> {
    gt[range]
        .iter()
        .map(|&g| match g {
            GT_EOV => eov_f32(),
            GT_MISSING => missing_f32(),
            g => g as f32,
        })
        .collect()
}
