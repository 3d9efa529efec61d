
/*!
Finds the overlap used to place a new fragment, escalating through progressively looser searches when the
expected overlap is not found near the estimated hang.
When the target is the consensus, the search runs on the ungapped consensus and the result is re-expressed
in gapped column coordinates so it can be applied directly.
*/

use log::{debug, trace, warn};
use simple_error::bail;

use crate::aligner::{invert_trace, swap_overlap, AlignParams, Overlap, PairwiseAligner};
use crate::apply_alignment::AlignTarget;
use crate::cns_config::AlignmentContext;
use crate::workspace::{reverse_complement, ConsensusWorkspace, FragmentId, FragmentKind};

/// Overlaps with a negative hang below this are never used unless negative hangs are allowed
const MAX_TOLERATED_NEG_HANG: i64 = -10;

/// The shape of an accepted overlap
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum OverlapKind {
    /// B extends past the end of A
    #[default]
    Dovetail,
    /// B ends inside A
    Containment
}

/// Which search found the overlap
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum AlignTrick {
    /// The default search
    #[default]
    None,
    /// Minimum overlap length was relaxed
    ThinOlap,
    /// Error rate was doubled
    HighErate,
    /// Band widened to twice the loose width
    Wide,
    /// Band widened to three times the loose width
    RealWide,
    /// Band widened to five times the loose width
    SuperWide,
    /// Found on the reverse complements
    Orientation,
    /// Found on the reverse complements with the sequences swapped
    OrientationAndSwap,
    /// Found with the sequences swapped
    Swap
}

/// An accepted overlap, ready to be applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlignmentTrace {
    /// Offset of B in the target, gapped when the target is the consensus
    pub ahang: i64,
    /// Signed indel positions in target coordinates
    pub trace: Vec<i64>,
    pub overlap_kind: OverlapKind,
    pub trick: AlignTrick,
    /// Differences reported by the aligner
    pub diffs: usize,
    /// Overlap length reported by the aligner
    pub length: usize
}

/// Alignment step over the ungapped sequences
#[derive(Clone, Copy, Debug, PartialEq)]
enum Step {
    Match,
    /// A base against a gap in B
    GapInB,
    /// B base against a gap in A
    GapInA
}

/// Re-expresses an overlap found against the ungapped consensus in gapped coordinates.
/// Consensus gap columns inside the overlap get B gaps, or absorb a B insertion when one falls there.
/// # Arguments
/// * `begpos` - ungapped hang of B
/// * `trace` - ungapped trace
/// * `gapped_index` - gapped position of each ungapped consensus base
/// * `gapped_len` - number of gapped consensus positions
/// * `blen` - length of B
fn gapped_overlap(begpos: i64, trace: &[i64], gapped_index: &[usize], gapped_len: usize, blen: usize) -> (i64, Vec<i64>) {
    let alen = gapped_index.len();
    let mut a = begpos.max(0) as usize;
    let mut b = (-begpos).max(0) as usize;

    // decode into explicit steps
    let mut steps = vec![];
    for &t in trace.iter() {
        if t < 0 {
            let stop = (-t - 1) as usize;
            while a < stop && a < alen && b < blen {
                steps.push(Step::Match);
                a += 1;
                b += 1;
            }
            steps.push(Step::GapInA);
            b += 1;
        } else if t > 0 {
            let stop = (t - 1) as usize;
            while b < stop && a < alen && b < blen {
                steps.push(Step::Match);
                a += 1;
                b += 1;
            }
            steps.push(Step::GapInB);
            a += 1;
        }
    }
    let remaining = blen.saturating_sub(b).min(alen.saturating_sub(a));
    steps.extend(std::iter::repeat(Step::Match).take(remaining));

    // re-encode against the gapped positions
    let gapped_at = |a: usize| gapped_index.get(a).copied().unwrap_or(gapped_len);
    let mut a = begpos.max(0) as usize;
    let mut gb = (-begpos).max(0) as usize;
    let ahang = if begpos >= 0 { gapped_at(a) as i64 } else { begpos };
    let mut ga = if begpos >= 0 { gapped_at(a) } else { 0 };
    let mut gapped_trace = vec![];
    for step in steps {
        match step {
            Step::GapInA => {
                if ga < gapped_at(a) {
                    // the consensus already has a gap column here
                    ga += 1;
                } else {
                    gapped_trace.push(-(ga as i64 + 1));
                }
                gb += 1;
            },
            Step::Match | Step::GapInB => {
                while ga < gapped_at(a) {
                    gapped_trace.push(gb as i64 + 1);
                    ga += 1;
                }
                if step == Step::Match {
                    gb += 1;
                } else {
                    gapped_trace.push(gb as i64 + 1);
                }
                ga += 1;
                a += 1;
            }
        }
    }
    (ahang, gapped_trace)
}

impl ConsensusWorkspace {
    /// Returns the ungapped sequence of an alignment target, and for the consensus the gapped position of each base.
    fn target_sequence(&self, target: AlignTarget) -> Result<(Vec<u8>, Option<(Vec<usize>, usize)>), Box<dyn std::error::Error>> {
        match target {
            AlignTarget::Fragment(fid) => Ok((self.fragment_sequence(fid)?, None)),
            AlignTarget::Consensus(bid) => {
                let mut sequence = vec![];
                let mut gapped_index = vec![];
                let mut gapped_len = 0;
                let mut current = Some(bid);
                while let Some(c) = current {
                    if gapped_len > self.num_beads() {
                        bail!("internal error: consensus chain starting at {bid:?} loops");
                    }
                    let symbol = self.bead_char(c)?;
                    if symbol != b'-' {
                        sequence.push(symbol);
                        gapped_index.push(gapped_len);
                    }
                    gapped_len += 1;
                    current = self.bead(c)?.next;
                }
                Ok((sequence, Some((gapped_index, gapped_len))))
            }
        }
    }

    /// Searches for the overlap of fragment `bfid` onto a target near an estimated hang.
    /// Searches widen in steps (thin overlaps, higher error rate, wider bands in merge context or for unitigs),
    /// then retry on the reverse complements and with the sequences swapped.
    /// Returns None when no acceptable overlap exists.
    /// # Arguments
    /// * `aligner` - the pairwise aligner
    /// * `target` - the already aligned sequence
    /// * `bfid` - the fragment being placed
    /// * `ahang` - estimated ungapped offset of B in the target
    /// # Errors
    /// * if the target or fragment cannot be read
    pub fn get_alignment_trace<A: PairwiseAligner>(&self, aligner: &A, target: AlignTarget, bfid: FragmentId, ahang: i64) -> Result<Option<AlignmentTrace>, Box<dyn std::error::Error>> {
        let config = self.config();
        let (a, gapped) = self.target_sequence(target)?;
        let b = self.fragment_sequence(bfid)?;
        let bfrag = self.fragment(bfid)?;
        let (alen, blen) = (a.len() as i64, b.len() as i64);

        let consensus_like = match target {
            AlignTarget::Consensus(_) => true,
            AlignTarget::Fragment(afid) => self.fragment(afid)?.kind.is_chunk()
        };
        let b_unitig = bfrag.kind == FragmentKind::Unitig;
        let widen = config.alignment_context == AlignmentContext::Merge || b_unitig;
        let has_n = a.contains(&b'N') || b.contains(&b'N');

        let dp_erate = config.dp_erate;
        let cns_erate = if consensus_like { 2.0 * dp_erate } else { dp_erate };
        let tight = config.tight_semi_bandwidth;
        let loose = config.loose_semi_bandwidth;
        let thin = config.dp_thin_min_length;
        let defaults = AlignParams {
            band_bgn: ahang - tight,
            band_end: ahang + tight,
            erate: if b_unitig { 2.0 * dp_erate } else { dp_erate },
            thresh: config.dp_thresh,
            min_len: config.dp_min_length
        };
        let bad_hang = |o: &Overlap| o.begpos < config.neg_ahang_cutoff && !config.allow_negative_hang;

        // forward searches, in order, with whether the result must also pass the consensus error rate
        let mut attempts = vec![
            (defaults, AlignTrick::None, false),
            (AlignParams { min_len: thin, ..defaults }, AlignTrick::ThinOlap, false)
        ];
        if has_n || b_unitig {
            attempts.push((AlignParams { erate: 2.0 * dp_erate, ..defaults }, AlignTrick::HighErate, false));
        }
        if widen {
            let band = |w: i64| (ahang - w * loose, ahang + w * loose);
            let (bgn, end) = band(2);
            attempts.push((AlignParams { band_bgn: bgn, band_end: end, erate: 2.0 * dp_erate, ..defaults }, AlignTrick::Wide, false));
            let (bgn, end) = band(3);
            attempts.push((AlignParams { band_bgn: bgn, band_end: end, erate: 2.0 * cns_erate, ..defaults }, AlignTrick::RealWide, true));
            let (bgn, end) = band(5);
            attempts.push((AlignParams { band_bgn: bgn, band_end: end, erate: 2.0 * cns_erate, ..defaults }, AlignTrick::SuperWide, true));
            let (bgn, end) = band(2);
            attempts.push((AlignParams { band_bgn: bgn, band_end: end, erate: 2.0 * cns_erate, min_len: thin, ..defaults }, AlignTrick::ThinOlap, true));
            attempts.push((AlignParams { band_bgn: -blen, band_end: alen, erate: 2.0 * cns_erate, min_len: thin, ..defaults }, AlignTrick::ThinOlap, true));
        }

        let mut found: Option<(Overlap, AlignTrick)> = None;
        for (params, trick, check_erate) in attempts.into_iter() {
            if let Some(o) = aligner.compare(&a, &b, &params) {
                if !check_erate || (o.diffs as f64) <= cns_erate * o.length as f64 {
                    found = Some((o, trick));
                    break;
                }
            }
        }

        if found.as_ref().map_or(true, |(o, _)| bad_hang(o)) {
            // a poor prefix may have hidden the overlap, search from the other end
            found = self.reverse_search(aligner, &a, &b, ahang, &defaults, widen, cns_erate);
        }

        if found.as_ref().map_or(true, |(o, _)| bad_hang(o)) {
            let bgn = ahang - 3 * loose;
            let end = alen - config.dp_min_length as i64;
            let params = AlignParams { band_bgn: -end, band_end: -bgn, ..defaults };
            found = aligner.compare(&b, &a, &params).map(|mut o| {
                swap_overlap(&mut o);
                (o, AlignTrick::Swap)
            });
        }

        let Some((overlap, trick)) = found else {
            warn!("Could not find overlap between {:?} and fragment {} (estimated ahang {ahang})", target, bfrag.ident);
            return Ok(None);
        };

        if overlap.begpos < 0 && bad_hang(&overlap) {
            if overlap.begpos < MAX_TOLERATED_NEG_HANG {
                debug!("Rejecting overlap of fragment {} with negative ahang {}", bfrag.ident, overlap.begpos);
                return Ok(None);
            }
            warn!("Using overlap of fragment {} with negative ahang {}", bfrag.ident, overlap.begpos);
        }
        let slip = (overlap.begpos - ahang).abs();
        if !widen && slip > tight {
            debug!("Rejecting overlap of fragment {} with slip {slip}", bfrag.ident);
            return Ok(None);
        }
        if trick != AlignTrick::None {
            debug!("Overlap of fragment {} found with {trick:?}: begpos={}, endpos={}, diffs={}/{}", bfrag.ident, overlap.begpos, overlap.endpos, overlap.diffs, overlap.length);
        }

        let overlap_kind = if overlap.endpos < 0 { OverlapKind::Containment } else { OverlapKind::Dovetail };
        let (ahang, trace) = match gapped {
            None => (overlap.begpos, overlap.trace),
            Some((gapped_index, gapped_len)) => {
                let ret = gapped_overlap(overlap.begpos, &overlap.trace, &gapped_index, gapped_len, b.len());
                trace!("Ungapped overlap at {} maps to gapped ahang {} with {} indels", overlap.begpos, ret.0, ret.1.len());
                ret
            }
        };
        Ok(Some(AlignmentTrace {
            ahang,
            trace,
            overlap_kind,
            trick,
            diffs: overlap.diffs,
            length: overlap.length
        }))
    }

    /// Searches the reverse complements, first near the hang estimated from the right end, then wider,
    /// then with the sequences swapped. A found overlap is mapped back to forward coordinates.
    #[allow(clippy::too_many_arguments)]
    fn reverse_search<A: PairwiseAligner>(&self, aligner: &A, a: &[u8], b: &[u8], ahang: i64, defaults: &AlignParams, widen: bool, cns_erate: f64) -> Option<(Overlap, AlignTrick)> {
        let config = self.config();
        let (alen, blen) = (a.len() as i64, b.len() as i64);
        let ra = reverse_complement(a);
        let rb = reverse_complement(b);
        let ahang_tmp = alen - ahang - blen;
        let tight = config.tight_semi_bandwidth;
        let loose = config.loose_semi_bandwidth;
        let wide_erate = if widen { 2.0 * cns_erate } else { defaults.erate };
        // in reversed coordinates the forward hang is the negated end position
        let good_end = |o: &Overlap| o.endpos <= -config.neg_ahang_cutoff;

        let bands = [
            (ahang_tmp - tight, ahang_tmp + tight, defaults.erate),
            (ahang_tmp - 2 * loose, ahang_tmp + 2 * loose, wide_erate),
            (-blen, alen, wide_erate)
        ];
        let mut found = None;
        for (band_bgn, band_end, erate) in bands {
            let params = AlignParams { band_bgn, band_end, erate, ..*defaults };
            if let Some(o) = aligner.compare(&ra, &rb, &params) {
                if good_end(&o) {
                    found = Some((o, AlignTrick::Orientation));
                    break;
                }
            }
        }
        if found.is_none() {
            let params = AlignParams {
                band_bgn: -ahang_tmp - 2 * loose,
                band_end: -ahang_tmp + 2 * loose,
                erate: wide_erate,
                ..*defaults
            };
            found = aligner.compare(&rb, &ra, &params).map(|mut o| {
                swap_overlap(&mut o);
                (o, AlignTrick::OrientationAndSwap)
            });
        }
        found.map(|(mut o, trick)| {
            invert_trace(a.len(), b.len(), &mut o);
            (o, trick)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::aligner::BandedAligner;
    use crate::base_call::CallMode;
    use crate::cns_config::ConsensusConfigBuilder;

    fn random_sequence(seed: u64, length: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..length).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
    }

    fn add(ws: &mut ConsensusWorkspace, ident: u64, seq: &[u8]) -> FragmentId {
        ws.append_fragment(ident, FragmentKind::Read, seq, &vec![30; seq.len()], false).unwrap()
    }

    #[test]
    fn test_gapped_overlap() {
        // gap column inside the overlap gives B a gap
        assert_eq!(gapped_overlap(2, &[], &[0, 1, 2, 4, 5, 6], 7, 3), (2, vec![2]));
        // leading gap column with a negative hang
        assert_eq!(gapped_overlap(-1, &[], &[1, 2, 3], 4, 3), (-1, vec![2]));
        // an insertion in B lands in the existing gap column
        assert_eq!(gapped_overlap(0, &[-3], &[0, 1, 3, 4], 5, 5), (0, vec![]));
        // a deletion in B keeps its position, shifted by the gap column
        assert_eq!(gapped_overlap(0, &[4], &[0, 2, 3, 4, 5], 6, 4), (0, vec![2, 4]));
    }

    #[test]
    fn test_dovetail_and_containment() {
        let mut ws = ConsensusWorkspace::default();
        let a = random_sequence(1, 40);
        let afid = add(&mut ws, 0, &a);

        let mut b = a[10..].to_vec();
        b.extend(random_sequence(2, 15));
        let bfid = add(&mut ws, 1, &b);
        let result = ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Fragment(afid), bfid, 12).unwrap().unwrap();
        assert_eq!(result.ahang, 10);
        assert!(result.trace.is_empty());
        assert_eq!(result.overlap_kind, OverlapKind::Dovetail);
        assert_eq!(result.trick, AlignTrick::None);

        let cfid = add(&mut ws, 2, &a[5..35]);
        let result = ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Fragment(afid), cfid, 5).unwrap().unwrap();
        assert_eq!(result.ahang, 5);
        assert_eq!(result.overlap_kind, OverlapKind::Containment);
    }

    #[test]
    fn test_negative_hang_gate() {
        let a = random_sequence(3, 40);
        let mut b = random_sequence(4, 20);
        b.extend_from_slice(&a[..30]);

        let mut ws = ConsensusWorkspace::default();
        let afid = add(&mut ws, 0, &a);
        let bfid = add(&mut ws, 1, &b);
        assert_eq!(ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Fragment(afid), bfid, -20).unwrap(), None);

        let config = ConsensusConfigBuilder::default().allow_negative_hang(true).build().unwrap();
        let mut ws = ConsensusWorkspace::new(config);
        let afid = add(&mut ws, 0, &a);
        let bfid = add(&mut ws, 1, &b);
        let result = ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Fragment(afid), bfid, -20).unwrap().unwrap();
        assert_eq!(result.ahang, -20);
        assert_eq!(result.overlap_kind, OverlapKind::Containment);
    }

    #[test]
    fn test_no_overlap() {
        let mut ws = ConsensusWorkspace::default();
        let afid = add(&mut ws, 0, &random_sequence(5, 40));
        let bfid = add(&mut ws, 1, &random_sequence(6, 40));
        assert_eq!(ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Fragment(afid), bfid, 10).unwrap(), None);
    }

    #[test]
    fn test_consensus_target() {
        let mut ws = ConsensusWorkspace::default();
        let a = random_sequence(7, 40);
        let afid = add(&mut ws, 0, &a);
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, afid, CallMode::Promote).unwrap();
        let first = ws.manode(mid).unwrap().first.unwrap();
        let call = ws.column(first).unwrap().call;

        let bfid = add(&mut ws, 1, &a[8..]);
        let result = ws.get_alignment_trace(&BandedAligner::default(), AlignTarget::Consensus(call), bfid, 8).unwrap().unwrap();
        assert_eq!(result.ahang, 8);
        assert!(result.trace.is_empty());
        assert_eq!(result.overlap_kind, OverlapKind::Dovetail);
    }
}
