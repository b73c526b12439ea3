//! # Genetic Map Interpolation
//!
//! Convert physical positions (base pairs) to genetic distances
//! (centiMorgans) and genetic distances to haplotype switch probabilities.
//!
//! Two map-file layouts are understood:
//! - new format: three columns `chrom pos cM`, announced by a `#` header
//! - legacy format: four columns `chrom <skip> cM pos`

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::Result;

/// Convert genetic distance to switch probability: `p = 1 - e^(-cm/100)`
#[inline]
pub fn cm_to_switch_prob(cm: f64) -> f64 {
    1.0 - (-cm / 100.0).exp()
}

/// Convert genetic distance to switch probability with a decay scale:
/// `p = 1 - e^(-lambda * cm/100)`
#[inline]
pub fn cm_to_switch_prob_decay(cm: f64, decay_rate: f64) -> f64 {
    1.0 - (-decay_rate * cm / 100.0).exp()
}

/// Convert switch probability back to genetic distance:
/// `cm = 100 * ln(1/(1-p))`
#[inline]
pub fn switch_prob_to_cm(recom_prob: f64) -> f64 {
    100.0 * (1.0 / (1.0 - recom_prob)).ln()
}

/// Haldane's map function: meiotic recombination fraction for a distance
#[inline]
pub fn haldane(cm: f64) -> f64 {
    (1.0 - (-cm / 50.0).exp()) / 2.0
}

/// Inverse of Haldane's map function
#[inline]
pub fn haldane_inverse(recom_frac: f64) -> f64 {
    50.0 * (1.0 / (1.0 - 2.0 * recom_frac)).ln()
}

/// A single line entry from a genetic map file.
#[derive(Clone, Debug, Default)]
struct MapRecord {
    chrom: String,
    pos: u64,
    map_value: f64,
}

/// Forward-only reader and interpolator for genetic map files, bound to one
/// chromosome.
///
/// Maintains two buffered records and answers `interpolate_centimorgan(pos)`
/// by linear interpolation between them, advancing as queries advance.
/// Positions before the first record extrapolate from the first record's
/// bp-to-cM rate; positions past the last record extrapolate with the last
/// observed local rate. An unreadable, empty, or single-record file yields a
/// valid object that returns NaN.
pub struct GeneticMapFile {
    reader: Box<dyn BufRead + Send>,
    target_chrom: String,
    prev_rec: MapRecord,
    cur_rec: MapRecord,
    good: bool,
    new_format: bool,
}

impl GeneticMapFile {
    /// Open a genetic map file (plain or gzipped text) for one chromosome.
    pub fn new(path: &Path, chrom: &str) -> Result<Self> {
        let file = File::open(path)?;
        let gzipped = path
            .extension()
            .map(|e| e == "gz" || e == "bgz")
            .unwrap_or(false);
        let reader: Box<dyn BufRead + Send> = if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(Self::from_reader(reader, chrom))
    }

    /// Build from any line source. Used directly by tests.
    pub fn from_reader(reader: Box<dyn BufRead + Send>, chrom: &str) -> Self {
        let mut ret = Self {
            reader,
            target_chrom: chrom.to_string(),
            prev_rec: MapRecord::default(),
            cur_rec: MapRecord::default(),
            good: true,
            new_format: false,
        };
        ret.prime();
        ret
    }

    fn prime(&mut self) {
        // Format detection: a '#'-prefixed header announces the new
        // three-column layout. The header line itself is consumed.
        let mut first_line = String::new();
        let n = self.reader.read_line(&mut first_line).unwrap_or(0);
        if n == 0 {
            self.good = false;
            return;
        }

        let mut pending: Option<String> = None;
        if first_line.starts_with('#') {
            self.new_format = true;
        } else {
            pending = Some(first_line);
        }

        // Seek to the first two records on the target chromosome.
        let mut first: Option<MapRecord> = None;
        let mut second: Option<MapRecord> = None;
        loop {
            let line = match pending.take() {
                Some(l) => l,
                None => {
                    let mut buf = String::new();
                    match self.reader.read_line(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => buf,
                    }
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let rec = match self.parse_record(&line) {
                Some(r) => r,
                None => {
                    self.good = false;
                    return;
                }
            };
            if rec.chrom != self.target_chrom {
                if first.is_some() {
                    break; // ran off the end of the target chromosome
                }
                continue;
            }
            if first.is_none() {
                first = Some(rec);
            } else {
                second = Some(rec);
                break;
            }
        }

        match (first, second) {
            (Some(a), Some(b)) => {
                self.prev_rec = a;
                self.cur_rec = b;
            }
            _ => self.good = false,
        }
    }

    fn parse_record(&self, line: &str) -> Option<MapRecord> {
        let mut fields = line.split_whitespace();
        if self.new_format {
            let chrom = fields.next()?.to_string();
            let pos = fields.next()?.parse().ok()?;
            let map_value = fields.next()?.parse().ok()?;
            Some(MapRecord {
                chrom,
                pos,
                map_value,
            })
        } else {
            let chrom = fields.next()?.to_string();
            let _skip = fields.next()?;
            let map_value = fields.next()?.parse().ok()?;
            let pos = fields.next()?.parse().ok()?;
            Some(MapRecord {
                chrom,
                pos,
                map_value,
            })
        }
    }

    fn read_next(&mut self) -> Option<MapRecord> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            if line.trim().is_empty() {
                continue;
            }
            let rec = self.parse_record(&line)?;
            if rec.chrom != self.target_chrom {
                return None;
            }
            return Some(rec);
        }
    }

    /// Whether the map file was loaded and is usable.
    pub fn good(&self) -> bool {
        self.good
    }

    /// Interpolated centimorgan value for a basepair position.
    ///
    /// Queries must be non-decreasing; the buffered window only moves
    /// forward.
    pub fn interpolate_centimorgan(&mut self, variant_pos: u64) -> f64 {
        if !self.good {
            return f64::NAN;
        }

        if variant_pos < self.prev_rec.pos {
            // Before the first record: proportional to the first record's
            // overall bp-to-cM rate.
            let basepair_cm = self.prev_rec.map_value / self.prev_rec.pos as f64;
            return variant_pos as f64 * basepair_cm;
        }

        while variant_pos > self.cur_rec.pos {
            match self.read_next() {
                Some(rec) => {
                    debug_assert!(rec.pos > self.cur_rec.pos);
                    self.prev_rec = std::mem::replace(&mut self.cur_rec, rec);
                }
                None => {
                    // Past the last record: extrapolate at the last local rate.
                    let basepair_cm = (self.cur_rec.map_value - self.prev_rec.map_value)
                        / (self.cur_rec.pos - self.prev_rec.pos) as f64;
                    return self.cur_rec.map_value
                        + (variant_pos - self.cur_rec.pos) as f64 * basepair_cm;
                }
            }
        }

        let span = (self.cur_rec.pos - self.prev_rec.pos) as f64;
        let frac = (variant_pos - self.prev_rec.pos) as f64 / span;
        self.prev_rec.map_value + frac * (self.cur_rec.map_value - self.prev_rec.map_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn map_from(text: &str, chrom: &str) -> GeneticMapFile {
        GeneticMapFile::from_reader(Box::new(Cursor::new(text.to_string())), chrom)
    }

    #[test]
    fn test_switch_prob_round_trip() {
        for p in [0.001, 0.01, 0.1, 0.5, 0.89] {
            let cm = switch_prob_to_cm(p);
            assert!((cm_to_switch_prob(cm) - p).abs() < 1e-12);
        }
    }

    #[test]
    fn test_haldane_round_trip() {
        for r in [0.0, 0.05, 0.2, 0.39] {
            let cm = haldane_inverse(r);
            assert!((haldane(cm) - r).abs() < 1e-12);
        }
    }

    #[test]
    fn test_interpolation_new_format() {
        let mut map = map_from(
            "#chrom\tpos\tcM\nchr20 1000 0.0\nchr20 2000 1.0\nchr20 4000 2.0\n",
            "chr20",
        );
        assert!(map.good());
        assert!((map.interpolate_centimorgan(1500) - 0.5).abs() < 1e-9);
        assert!((map.interpolate_centimorgan(2000) - 1.0).abs() < 1e-9);
        assert!((map.interpolate_centimorgan(3000) - 1.5).abs() < 1e-9);
        // past the end: last local rate is 1 cM / 2000 bp
        assert!((map.interpolate_centimorgan(6000) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_legacy_format() {
        let mut map = map_from("chr20 . 0.0 1000\nchr20 . 1.0 2000\n", "chr20");
        assert!(map.good());
        assert!((map.interpolate_centimorgan(1500) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_before_first_record_extrapolates() {
        let mut map = map_from("chr20 . 2.0 2000\nchr20 . 3.0 3000\n", "chr20");
        // rate from origin: 2.0 cM over 2000 bp
        assert!((map.interpolate_centimorgan(1000) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_record_is_nan() {
        let mut map = map_from("chr20 . 0.0 1000\n", "chr20");
        assert!(!map.good());
        assert!(map.interpolate_centimorgan(1500).is_nan());
    }

    #[test]
    fn test_wrong_chromosome_is_nan() {
        let mut map = map_from("chr1 . 0.0 1000\nchr1 . 1.0 2000\n", "chr20");
        assert!(!map.good());
        assert!(map.interpolate_centimorgan(1500).is_nan());
    }
}
