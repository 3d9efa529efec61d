
/*!
The pairwise overlap interface used to place fragments, plus a banded dynamic-programming implementation of it.

Overlaps use a signed trace.
A negative entry `-k` places a base of B in a new gap of A immediately before (1-based) position `k` of A.
A positive entry `k` places a gap in B immediately before (1-based) position `k` of B.
Entries are listed in the order the alignment visits them.

# Example usage
```rust
use abacus_con::aligner::{AlignParams, BandedAligner, PairwiseAligner};

let a = b"ACGTACGTTGCAAGCT";
let b = b"ACGTTGCAAGCTTTAA";
let params = AlignParams { band_bgn: 0, band_end: 8, erate: 0.06, thresh: 1e-6, min_len: 10 };
let overlap = BandedAligner::default().compare(a, b, &params).unwrap();
assert_eq!(overlap.begpos, 4);
assert_eq!(overlap.endpos, 4);
assert!(overlap.trace.is_empty());
```
*/

use log::warn;

/// Parameters for a single overlap search
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignParams {
    /// Lowest allowed offset of B in A, negative when B starts first
    pub band_bgn: i64,
    /// Highest allowed offset of B in A
    pub band_end: i64,
    /// Maximum fraction of differences in the overlap
    pub erate: f64,
    /// Probability threshold for aligners that score overlaps statistically
    pub thresh: f64,
    /// Minimum overlap length
    pub min_len: usize
}

/// A pairwise overlap between two sequences
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overlap {
    /// Offset of the start of B in A, negative if B starts before A
    pub begpos: i64,
    /// Length of B past the end of A, negative if A extends past B
    pub endpos: i64,
    /// Signed indel positions
    pub trace: Vec<i64>,
    /// Number of differences in the overlap
    pub diffs: usize,
    /// Number of alignment columns in the overlap
    pub length: usize
}

/// Anything that can find an overlap between two sequences
pub trait PairwiseAligner {
    /// Searches for an overlap of `b` onto `a` within the parameter limits.
    /// Returns None if no acceptable overlap exists.
    /// # Arguments
    /// * `a` - the sequence being aligned to
    /// * `b` - the sequence being aligned
    /// * `params` - search limits
    fn compare(&self, a: &[u8], b: &[u8], params: &AlignParams) -> Option<Overlap>;
}

/// Converts an overlap found between two reverse-complemented sequences into one between the forward sequences.
/// # Arguments
/// * `alen` - length of A
/// * `blen` - length of B
/// * `overlap` - the overlap to convert in place
pub fn invert_trace(alen: usize, blen: usize, overlap: &mut Overlap) {
    let aend = alen as i64 + 2;
    let bend = blen as i64 + 2;
    overlap.trace.reverse();
    for t in overlap.trace.iter_mut() {
        *t = if *t < 0 { -(aend + *t) } else { bend - *t };
    }
    let begpos = overlap.begpos;
    overlap.begpos = -overlap.endpos;
    overlap.endpos = -begpos;
}

/// Converts an overlap of A onto B into the overlap of B onto A.
pub fn swap_overlap(overlap: &mut Overlap) {
    for t in overlap.trace.iter_mut() {
        *t = -*t;
    }
    overlap.begpos = -overlap.begpos;
    overlap.endpos = -overlap.endpos;
}

/// The largest dynamic programming matrix the banded aligner will allocate
const MAX_DP_CELLS: usize = 1 << 26;
const NEG_INF: i32 = i32::MIN / 2;

/// Traceback moves
#[derive(Clone, Copy, Debug, PartialEq)]
enum Move {
    None,
    Start,
    /// A base against B base
    Diag,
    /// A base against a gap in B
    Up,
    /// B base against a gap in A
    Left
}

/// Banded overlap aligner with free end gaps.
/// Cells are restricted to diagonals near the requested band, widened by the indel drift the error rate allows.
#[derive(Clone, Debug)]
pub struct BandedAligner {
    match_score: i32,
    mismatch_score: i32,
    gap_score: i32
}

impl Default for BandedAligner {
    fn default() -> Self {
        Self {
            match_score: 1,
            mismatch_score: -2,
            gap_score: -2
        }
    }
}

impl BandedAligner {
    /// Creates an aligner with custom scores.
    /// # Arguments
    /// * `match_score` - reward for two equal bases, must be positive
    /// * `mismatch_score` - penalty for two different bases, must be negative
    /// * `gap_score` - penalty for a base against a gap, must be negative
    pub fn new(match_score: i32, mismatch_score: i32, gap_score: i32) -> BandedAligner {
        BandedAligner { match_score, mismatch_score, gap_score }
    }
}

/// Case-insensitive equality where N never matches
fn bases_match(a: u8, b: u8) -> bool {
    let a = a.to_ascii_uppercase();
    a != b'N' && a == b.to_ascii_uppercase()
}

impl PairwiseAligner for BandedAligner {
    fn compare(&self, a: &[u8], b: &[u8], params: &AlignParams) -> Option<Overlap> {
        let alen = a.len() as i64;
        let blen = b.len() as i64;
        if alen == 0 || blen == 0 || params.band_bgn > params.band_end {
            return None;
        }

        // d = i - j is the diagonal, a path that starts on diagonal d drifts by at most the allowed indels
        let slack = (params.erate * alen.min(blen) as f64).ceil() as i64 + 2;
        let dlo = (params.band_bgn - slack).max(-blen);
        let dhi = (params.band_end + slack).min(alen);
        if dlo > dhi {
            return None;
        }
        let width = (dhi - dlo + 1) as usize;
        let rows = a.len() + 1;
        if rows.saturating_mul(width) > MAX_DP_CELLS {
            warn!("Overlap search of {}x{} with band width {width} is too large, skipping", a.len(), b.len());
            return None;
        }

        let mut moves = vec![Move::None; rows * width];
        let mut prev = vec![NEG_INF; width];
        let mut curr = vec![NEG_INF; width];
        let mut best: Option<(i32, usize, usize)> = None;

        for i in 0..rows {
            for k in (0..width).rev() {
                let d = dlo + k as i64;
                let j = i as i64 - d;
                if j < 0 || j > blen {
                    curr[k] = NEG_INF;
                    continue;
                }
                let j = j as usize;
                let mut score = NEG_INF;
                let mut mv = Move::None;
                if (i == 0 || j == 0) && d >= params.band_bgn && d <= params.band_end {
                    score = 0;
                    mv = Move::Start;
                }
                if i > 0 && j > 0 && prev[k] > NEG_INF {
                    let s = prev[k] + if bases_match(a[i - 1], b[j - 1]) { self.match_score } else { self.mismatch_score };
                    if s > score {
                        score = s;
                        mv = Move::Diag;
                    }
                }
                if i > 0 && k > 0 && prev[k - 1] > NEG_INF {
                    let s = prev[k - 1] + self.gap_score;
                    if s > score {
                        score = s;
                        mv = Move::Up;
                    }
                }
                if j > 0 && k + 1 < width && curr[k + 1] > NEG_INF {
                    let s = curr[k + 1] + self.gap_score;
                    if s > score {
                        score = s;
                        mv = Move::Left;
                    }
                }
                curr[k] = score;
                moves[i * width + k] = mv;

                if score > NEG_INF && (i == a.len() || j == b.len()) && best.map_or(true, |(s, _, _)| score > s) {
                    best = Some((score, i, j));
                }
            }
            std::mem::swap(&mut prev, &mut curr);
            curr.iter_mut().for_each(|c| *c = NEG_INF);
        }

        let (_score, end_i, end_j) = best?;

        // walk back to the start cell
        let mut ops = vec![];
        let (mut i, mut j) = (end_i, end_j);
        loop {
            let k = (i as i64 - j as i64 - dlo) as usize;
            match moves[i * width + k] {
                Move::Start => break,
                Move::Diag => { ops.push(Move::Diag); i -= 1; j -= 1; },
                Move::Up => { ops.push(Move::Up); i -= 1; },
                Move::Left => { ops.push(Move::Left); j -= 1; },
                Move::None => return None
            }
        }
        ops.reverse();

        let begpos = if i > 0 { i as i64 } else { -(j as i64) };
        let mut trace = vec![];
        let mut diffs = 0;
        for op in ops.iter() {
            match op {
                Move::Diag => {
                    if !bases_match(a[i], b[j]) {
                        diffs += 1;
                    }
                    i += 1;
                    j += 1;
                },
                Move::Up => {
                    trace.push(j as i64 + 1);
                    diffs += 1;
                    i += 1;
                },
                Move::Left => {
                    trace.push(-(i as i64 + 1));
                    diffs += 1;
                    j += 1;
                },
                _ => {}
            }
        }
        let length = ops.len();
        let endpos = if end_i == a.len() {
            blen - end_j as i64
        } else {
            -(alen - end_i as i64)
        };

        if length < params.min_len || diffs as f64 > params.erate * length as f64 {
            return None;
        }
        Some(Overlap { begpos, endpos, trace, diffs, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::workspace::reverse_complement;

    fn params(band_bgn: i64, band_end: i64) -> AlignParams {
        AlignParams { band_bgn, band_end, erate: 0.1, thresh: 1e-6, min_len: 10 }
    }

    #[test]
    fn test_exact_dovetail() {
        let a = b"AAAACCCCGGGGTTTTACGT";
        let b = b"GGGGTTTTACGTCATCAT";
        let overlap = BandedAligner::default().compare(a, b, &params(4, 12)).unwrap();
        assert_eq!(overlap.begpos, 8);
        assert_eq!(overlap.endpos, 6);
        assert_eq!(overlap.diffs, 0);
        assert_eq!(overlap.length, 12);
        assert!(overlap.trace.is_empty());

        // the band must contain the offset
        assert!(BandedAligner::default().compare(a, b, &params(-5, -1)).is_none());
    }

    #[test]
    fn test_containment_with_indels() {
        let a = b"TTTTTACGTACGGATCCATGCATGCAAAAA";
        // B drops the G at A position 11 and has an extra T after A position 16
        let b = b"ACGTACGATCCATTGCATGC";
        let overlap = BandedAligner::default().compare(a, b, &params(0, 10)).unwrap();
        assert_eq!(overlap.begpos, 5);
        assert!(overlap.endpos < 0);
        assert_eq!(overlap.diffs, 2);
        assert_eq!(overlap.trace.len(), 2);
        // one gap in B, one gap in A
        assert!(overlap.trace.iter().any(|&t| t > 0));
        assert!(overlap.trace.iter().any(|&t| t < 0));
    }

    #[test]
    fn test_negative_hang() {
        let a = b"GGGGTTTTACGTCATCAT";
        let b = b"AAAACCCCGGGGTTTTACGT";
        let overlap = BandedAligner::default().compare(a, b, &params(-10, 0)).unwrap();
        assert_eq!(overlap.begpos, -8);
        assert_eq!(overlap.endpos, -6);
    }

    #[test]
    fn test_too_many_errors() {
        let a = b"ACGTACGTACGTACGTACGT";
        let b = b"AGGTTCGAACCTAGGTTCGA";
        let mut p = params(-2, 2);
        p.erate = 0.02;
        assert!(BandedAligner::default().compare(a, b, &p).is_none());
    }

    #[test]
    fn test_invert_trace() {
        // an overlap found on the reverse complements maps back to the forward one
        let a = b"TTTTTACGTACGGATCCATGCATGCAAAAA".to_vec();
        let b = b"ACGTACGATCCATGCATGC".to_vec();
        let aligner = BandedAligner::default();
        let forward = aligner.compare(&a, &b, &params(0, 10)).unwrap();

        let ra = reverse_complement(&a);
        let rb = reverse_complement(&b);
        let ahang_tmp = a.len() as i64 - forward.begpos - b.len() as i64;
        let mut reverse = aligner.compare(&ra, &rb, &params(ahang_tmp - 6, ahang_tmp + 6)).unwrap();
        invert_trace(a.len(), b.len(), &mut reverse);
        assert_eq!(reverse.begpos, forward.begpos);
        assert_eq!(reverse.endpos, forward.endpos);
        assert_eq!(reverse.trace.len(), 1);
        assert_eq!(forward.trace.len(), 1);
        assert!(reverse.trace[0] > 0);
    }

    #[test]
    fn test_swap_overlap() {
        let mut overlap = Overlap { begpos: 3, endpos: -2, trace: vec![-5, 7], diffs: 2, length: 20 };
        swap_overlap(&mut overlap);
        assert_eq!(overlap.begpos, -3);
        assert_eq!(overlap.endpos, 2);
        assert_eq!(overlap.trace, vec![5, -7]);
    }
}
