//! # Variant Records
//!
//! Plain data for target variants and reference sites, plus the genotype and
//! dosage sentinel values shared across the crate.

/// Missing genotype sentinel (mirrors the BCF int8 missing value)
pub const GT_MISSING: i8 = i8::MIN;

/// End-of-vector genotype sentinel used to pad samples with lower ploidy
pub const GT_EOV: i8 = i8::MIN + 1;

/// Bit pattern of the float end-of-vector sentinel (BCF convention)
const F32_EOV_BITS: u32 = 0x7f80_0002;

/// Bit pattern of the float missing sentinel (BCF convention)
const F32_MISSING_BITS: u32 = 0x7f80_0001;

/// End-of-vector sentinel for dosage values
#[inline]
pub fn eov_f32() -> f32 {
    f32::from_bits(F32_EOV_BITS)
}

/// Missing sentinel for dosage values
#[inline]
pub fn missing_f32() -> f32 {
    f32::from_bits(F32_MISSING_BITS)
}

/// Sentinels carry distinct NaN payloads, so compare bits rather than values.
#[inline]
pub fn is_eov_f32(v: f32) -> bool {
    v.to_bits() == F32_EOV_BITS
}

#[inline]
pub fn is_missing_f32(v: f32) -> bool {
    v.to_bits() == F32_MISSING_BITS
}

/// A variant observed in the target panel.
///
/// One record per ALT allele; multi-allelic input sites are split at load
/// time with genotypes recoded to presence/absence of this ALT.
#[derive(Clone, Debug)]
pub struct TargetVariant {
    pub chrom: String,
    /// 1-based position
    pub pos: u32,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    /// True if the site exists in the target file
    pub in_target: bool,
    /// True if the site exists in the reference panel
    pub in_reference: bool,
    /// ALT allele frequency (from the reference once aligned)
    pub af: f32,
    /// HMM error parameter for this site
    pub err: f32,
    /// Switch probability to the next typed variant
    pub recom: f32,
    /// One allele per haplotype slot; {0,1} alleles, GT_MISSING, or GT_EOV
    pub gt: Vec<i8>,
}

/// Site-level metadata for a reference panel variant.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSiteInfo {
    pub chrom: String,
    pub pos: u32,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    /// Per-site error rate (NaN until known)
    pub err: f32,
    /// Per-site switch probability to the next variant (NaN until known)
    pub recom: f32,
    /// Centimorgan position (NaN until filled)
    pub cm: f64,
}

impl ReferenceSiteInfo {
    pub fn new(
        chrom: impl Into<String>,
        pos: u32,
        id: impl Into<String>,
        ref_allele: impl Into<String>,
        alt_allele: impl Into<String>,
        err: f32,
        recom: f32,
        cm: f64,
    ) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
            id: id.into(),
            ref_allele: ref_allele.into(),
            alt_allele: alt_allele.into(),
            err,
            recom,
            cm,
        }
    }
}

/// A reference variant inside a unique-haplotype block.
///
/// `gt` is indexed by unique-column position within the enclosing block, not
/// by expanded haplotype.
#[derive(Clone, Debug, Default)]
pub struct ReferenceVariant {
    pub site: ReferenceSiteInfo,
    /// ALT allele count over expanded haplotypes
    pub ac: usize,
    /// One allele per unique column
    pub gt: Vec<i8>,
}

impl ReferenceVariant {
    pub fn new(site: ReferenceSiteInfo, ac: usize, gt: Vec<i8>) -> Self {
        Self { site, ac, gt }
    }

    /// Two variants describe the same site when position and alleles agree.
    pub fn same_site(&self, other: &ReferenceVariant) -> bool {
        self.site.pos == other.site.pos
            && self.site.ref_allele == other.site.ref_allele
            && self.site.alt_allele == other.site.alt_allele
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_sentinels_are_distinct_nans() {
        assert!(eov_f32().is_nan());
        assert!(missing_f32().is_nan());
        assert!(is_eov_f32(eov_f32()));
        assert!(!is_eov_f32(missing_f32()));
        assert!(is_missing_f32(missing_f32()));
        assert!(!is_missing_f32(eov_f32()));
    }

    #[test]
    fn test_same_site() {
        let a = ReferenceVariant::new(
            ReferenceSiteInfo::new("chr1", 100, "rs1", "A", "T", 0.01, 0.0, f64::NAN),
            0,
            vec![0, 1],
        );
        let mut b = a.clone();
        assert!(a.same_site(&b));
        b.site.alt_allele = "G".to_string();
        assert!(!a.same_site(&b));
    }
}
