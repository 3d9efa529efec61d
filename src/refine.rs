
/*!
Abacus refinement of a multi-alignment.
Candidate windows are cast into an abacus, shifted left and right (and, for windows that look like two alleles,
shifted per allele), and the best arrangement is written back into the bead graph.
*/

use log::{debug, trace, warn};
use simple_error::bail;

use crate::abacus::{Abacus, AbacusScore, Shift};
use crate::base_call::CallMode;
use crate::window::RefineLevel;
use crate::workspace::{BeadId, ColumnId, ConsensusWorkspace, ManodeId};

/// Summary of one refinement pass
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RefineOutcome {
    /// Number of windows found
    pub windows: usize,
    /// Number of windows that were refined
    pub refined: usize,
    /// Total drop in abacus score over all refined windows
    pub score_reduction: usize
}

/// An abacus with its scores
#[derive(Clone, Debug)]
struct Scored {
    abacus: Abacus,
    score: AbacusScore,
    gap_score: usize
}

impl Scored {
    fn new(abacus: Abacus, score: AbacusScore) -> Scored {
        let gap_score = abacus.affine_score();
        Scored { abacus, score, gap_score }
    }
}

/// Enumeration of the arrangements a window can end up with
#[derive(Clone, Copy, Debug, PartialEq)]
enum ShiftChoice {
    Original,
    Left,
    Right
}

/// Picks between the original, left-shifted and right-shifted arrangement.
/// The edit score decides first, then the number of columns, then the number of gap openings; left wins ties.
fn choose_shift(orig: &Scored, left: &Scored, right: &Scored) -> ShiftChoice {
    let pick = |prefer_left: bool| if prefer_left { ShiftChoice::Left } else { ShiftChoice::Right };
    let (o, l, r) = (&orig.score, &left.score, &right.score);
    if l.score < o.score || r.score < o.score {
        return pick(l.score <= r.score);
    }
    if l.score != o.score || r.score != o.score {
        return ShiftChoice::Original;
    }
    if l.columns < o.columns || r.columns < o.columns {
        return pick(l.columns <= r.columns);
    }
    if l.columns != o.columns || r.columns != o.columns {
        return ShiftChoice::Original;
    }
    if left.gap_score < orig.gap_score || right.gap_score < orig.gap_score {
        return pick(left.gap_score <= right.gap_score);
    }
    ShiftChoice::Original
}

impl ConsensusWorkspace {
    /// Rewrites the window of the bead graph so it matches the abacus.
    /// Returns false for an unshifted abacus, which leaves the graph untouched.
    /// # Errors
    /// * if a fragment row cannot be matched against its beads
    /// * if any link of the graph is broken
    pub fn apply_abacus(&mut self, abacus: &Abacus) -> Result<bool, Box<dyn std::error::Error>> {
        match (abacus.shift(), abacus.is_mixed()) {
            (Shift::Unshifted, false) => return Ok(false),
            (Shift::Right, _) => self.apply_abacus_right(abacus)?,
            _ => self.apply_abacus_left(abacus, abacus.content_range().start)?
        }
        Ok(true)
    }

    /// Walks the window left to right, the abacus content starts at column `offset`.
    fn apply_abacus_left(&mut self, abacus: &Abacus, offset: usize) -> Result<(), Box<dyn std::error::Error>> {
        let mut current = Some(abacus.start_column());
        for k in 0..abacus.window_width() {
            let Some(cid) = current else {
                bail!("internal error: abacus window at {:?} runs past the node end", abacus.start_column());
            };
            let mut next_bead = self.bead(self.column(cid)?.call)?.down;
            while let Some(bid) = next_bead {
                next_bead = self.apply_abacus_cell(abacus, bid, offset + k, true)?;
            }
            self.base_call(cid, CallMode::Probabilistic, None, None)?;
            current = self.column(cid)?.next;
        }
        Ok(())
    }

    /// Walks the window right to left against the right third of the abacus.
    fn apply_abacus_right(&mut self, abacus: &Abacus) -> Result<(), Box<dyn std::error::Error>> {
        let mut current = Some(abacus.end_column());
        for k in 0..abacus.window_width() {
            let Some(cid) = current else {
                bail!("internal error: abacus window at {:?} runs past the node start", abacus.end_column());
            };
            let mut next_bead = self.bead(self.column(cid)?.call)?.down;
            while let Some(bid) = next_bead {
                next_bead = self.apply_abacus_cell(abacus, bid, abacus.num_columns() - k - 1, false)?;
            }
            self.base_call(cid, CallMode::Probabilistic, None, None)?;
            current = self.column(cid)?.prev;
        }
        Ok(())
    }

    /// Makes bead `bid` agree with its abacus cell, returns the next bead down the column.
    fn apply_abacus_cell(&mut self, abacus: &Abacus, bid: BeadId, j: usize, leftward: bool) -> Result<Option<BeadId>, Box<dyn std::error::Error>> {
        let bead = *self.bead(bid)?;
        let Some(row) = bead.frag.and_then(|fid| abacus.row_of(fid)) else {
            return Ok(bead.down);
        };
        let entry = abacus.get(row, j);
        let c = self.bead_char(bid)?;

        if entry == b'n' {
            if c != b'-' {
                trace!("Bead {bid:?} holds {:?} where its row ended, leaving it", c as char);
                return Ok(bead.down);
            }
            let Some(up) = bead.up else {
                bail!("internal error: bead {bid:?} has nothing above it");
            };
            self.unalign_trailing_gap_beads(bid)?;
            return Ok(self.bead(up)?.down);
        }
        if entry == c {
            return Ok(bead.down);
        }

        let exch = if leftward {
            let exch = self.find_exchange_right(abacus, bid, entry)?;
            self.left_end_shift_bead(bid, exch)?;
            exch
        } else {
            let exch = self.find_exchange_left(abacus, bid, entry)?;
            self.right_end_shift_bead(exch, bid)?;
            exch
        };
        Ok(self.bead(exch)?.down)
    }

    /// Finds the next bead of the fragment holding `entry`, growing the fragment with gaps at the window end.
    fn find_exchange_right(&mut self, abacus: &Abacus, bid: BeadId, entry: u8) -> Result<BeadId, Box<dyn std::error::Error>> {
        let limit = self.num_beads() + abacus.num_columns();
        let mut exch = bid;
        let mut steps = 0;
        while self.bead_char(exch)? != entry {
            let bead = *self.bead(exch)?;
            let Some(ecol) = bead.column else {
                bail!("internal error: bead {exch:?} is not in a column");
            };
            if bead.next.is_none() {
                let gap = self.append_gap_bead(exch)?;
                match self.column(ecol)?.next {
                    Some(next) => {
                        self.align_bead(next, gap)?;
                    },
                    None => {
                        self.column_append(ecol, gap)?;
                    }
                }
            } else if ecol == abacus.end_column() {
                let gap = self.append_gap_bead(exch)?;
                self.column_append(ecol, gap)?;
            }
            exch = self.next_in_fragment(exch)?;
            steps += 1;
            if steps > limit {
                bail!("internal error: no bead matching {:?} after {bid:?}", entry as char);
            }
        }
        Ok(exch)
    }

    /// Mirror of [`ConsensusWorkspace::find_exchange_right`].
    fn find_exchange_left(&mut self, abacus: &Abacus, bid: BeadId, entry: u8) -> Result<BeadId, Box<dyn std::error::Error>> {
        let limit = self.num_beads() + abacus.num_columns();
        let mut exch = bid;
        let mut steps = 0;
        while self.bead_char(exch)? != entry {
            let bead = *self.bead(exch)?;
            let Some(ecol) = bead.column else {
                bail!("internal error: bead {exch:?} is not in a column");
            };
            if bead.prev.is_none() {
                let gap = self.prepend_gap_bead(exch)?;
                match self.column(ecol)?.prev {
                    Some(prev) => {
                        self.align_bead(prev, gap)?;
                    },
                    None => {
                        self.column_prepend(ecol, gap)?;
                    }
                }
            } else if ecol == abacus.start_column() {
                let Some(prev_bead) = bead.prev else {
                    bail!("internal error: bead {exch:?} lost its predecessor");
                };
                let gap = self.append_gap_bead(prev_bead)?;
                match self.column(ecol)?.prev {
                    Some(prev) => {
                        self.column_append(prev, gap)?;
                    },
                    None => {
                        self.column_prepend(ecol, gap)?;
                    }
                }
            }
            exch = self.prev_in_fragment(exch)?;
            steps += 1;
            if steps > limit {
                bail!("internal error: no bead matching {:?} before {bid:?}", entry as char);
            }
        }
        Ok(exch)
    }

    fn next_in_fragment(&self, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        match self.bead(bid)?.next {
            Some(n) => Ok(n),
            None => bail!("internal error: bead {bid:?} has no successor")
        }
    }

    fn prev_in_fragment(&self, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        match self.bead(bid)?.prev {
            Some(p) => Ok(p),
            None => bail!("internal error: bead {bid:?} has no predecessor")
        }
    }

    /// Refines the columns from `start` up to (excluding) `stab_bgn`.
    /// Returns the score reduction of the chosen arrangement.
    /// # Errors
    /// * if the window is invalid or the abacus cannot be applied
    pub fn refine_window(&mut self, start: ColumnId, stab_bgn: ColumnId) -> Result<usize, Box<dyn std::error::Error>> {
        let copy = self.create_abacus(start, Some(stab_bgn))?;

        let mut orig = copy.clone();
        orig.merge();
        let orig_score = orig.score();
        let orig = Scored::new(orig, orig_score);

        let mut left = copy.clone();
        let left_score = left.left_shift();
        let left = Scored::new(left, left_score);

        let mut right = copy;
        let right_score = right.right_shift();
        let right = Scored::new(right, right_score);

        trace!(
            "Window {start:?}: scores {}/{}/{}, columns {}/{}/{}, gaps {}/{}/{}",
            orig.score.score, left.score.score, right.score.score,
            orig.score.columns, left.score.columns, right.score.columns,
            orig.gap_score, left.gap_score, right.gap_score
        );

        let choice = choose_shift(&orig, &left, &right);
        let mut best = match choice {
            ShiftChoice::Original => orig.clone(),
            ShiftChoice::Left => left,
            ShiftChoice::Right => right
        };
        let score_reduction = orig.score.score.saturating_sub(best.score.score);

        if let Some(plan) = best.abacus.allele_template() {
            let mut mixed = best.abacus.clone();
            let mixed_score = mixed.mixed_shift(&plan);
            let mixed = Scored::new(mixed, mixed_score);
            let better = (mixed.gap_score, mixed.score.columns, mixed.score.score)
                < (best.gap_score, best.score.columns, best.score.score);
            if better {
                trace!("Window {start:?}: mixed shift wins with gap score {}", mixed.gap_score);
                best = mixed;
            }
        }

        self.apply_abacus(&best.abacus)?;
        Ok(score_reduction)
    }

    /// Runs one refinement pass of the given level over a whole node, then refreshes it.
    /// # Arguments
    /// * `mid` - the node to refine
    /// * `level` - which windows to look for
    /// # Errors
    /// * if the node is invalid or any window fails to apply
    pub fn abacus_refine(&mut self, mid: ManodeId, level: RefineLevel) -> Result<RefineOutcome, Box<dyn std::error::Error>> {
        let mut outcome = RefineOutcome::default();
        let Some(first) = self.manode(mid)?.first else {
            return Ok(outcome);
        };
        let max_iterations = self.config().max_refine_iterations;
        let max_window_width = self.config().max_window_width;

        let mut start = first;
        let mut iterations = 0;
        loop {
            if iterations >= max_iterations {
                warn!("Refinement of node {:?} stopped after {iterations} windows", mid);
                break;
            }
            iterations += 1;

            let scan = self.identify_window(start, level)?;
            if let Some(window) = scan.window {
                outcome.windows += 1;
                if self.column(window.start)?.prev.is_none() {
                    // room to maneuver at the left end of the node
                    let Some(first_bead) = self.bead(self.column(window.start)?.call)?.down else {
                        bail!("internal error: empty column {:?}", window.start);
                    };
                    let gap = self.append_gap_bead(first_bead)?;
                    self.column_append(window.start, gap)?;
                }
                if window.width < max_window_width {
                    outcome.score_reduction += self.refine_window(window.start, window.stab_bgn)?;
                    outcome.refined += 1;
                }
            }
            match scan.resume {
                Some(next) => start = next,
                None => break
            }
        }

        self.refresh(mid, CallMode::Probabilistic, false)?;
        debug!("{level:?} refinement of node {mid:?}: {outcome:?}");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::apply_alignment::AlignTarget;
    use crate::workspace::{FragmentId, FragmentKind};

    /// A TTT run read three times, the two short reads drop a different T
    fn homopolymer_layout() -> (ConsensusWorkspace, ManodeId, Vec<FragmentId>) {
        let mut ws = ConsensusWorkspace::default();
        let a = ws.append_fragment(1, FragmentKind::Read, b"ACGTTTACG", &[30; 9], false).unwrap();
        let r1 = ws.append_fragment(2, FragmentKind::Read, b"ACGTTACG", &[30; 8], false).unwrap();
        let r2 = ws.append_fragment(3, FragmentKind::Read, b"ACGTTACG", &[30; 8], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, a, CallMode::Plurality).unwrap();
        ws.apply_alignment(AlignTarget::Fragment(a), r1, 0, &[4]).unwrap();
        ws.apply_alignment(AlignTarget::Fragment(a), r2, 0, &[6]).unwrap();
        ws.refresh(mid, CallMode::Plurality, false).unwrap();
        (ws, mid, vec![a, r1, r2])
    }

    /// The characters stacked in a column, sorted
    fn stack(ws: &ConsensusWorkspace, cid: ColumnId) -> Vec<u8> {
        let mut chars: Vec<u8> = ws.column_beads(cid).unwrap()
            .into_iter()
            .map(|b| ws.bead_char(b).unwrap())
            .collect();
        chars.sort();
        chars
    }

    fn scored(score: usize, columns: usize, gap_score: usize) -> Scored {
        let mut abacus = crate::abacus::tests::from_rows(&[b"A"]);
        abacus.score();
        Scored { abacus, score: AbacusScore { score, columns }, gap_score }
    }

    #[test]
    fn test_choose_shift() {
        // lower score wins, left on ties
        assert_eq!(choose_shift(&scored(2, 3, 2), &scored(1, 3, 2), &scored(1, 3, 2)), ShiftChoice::Left);
        assert_eq!(choose_shift(&scored(2, 3, 2), &scored(2, 3, 2), &scored(1, 3, 2)), ShiftChoice::Right);
        // then fewer columns
        assert_eq!(choose_shift(&scored(2, 4, 2), &scored(2, 4, 2), &scored(2, 3, 2)), ShiftChoice::Right);
        // then fewer gap openings
        assert_eq!(choose_shift(&scored(2, 3, 3), &scored(2, 3, 2), &scored(2, 3, 2)), ShiftChoice::Left);
        // nothing better
        assert_eq!(choose_shift(&scored(2, 3, 2), &scored(2, 3, 2), &scored(2, 3, 2)), ShiftChoice::Original);
        assert_eq!(choose_shift(&scored(2, 3, 2), &scored(3, 2, 0), &scored(2, 3, 2)), ShiftChoice::Original);
    }

    #[test]
    fn test_apply_right_then_left() {
        let mut ws = ConsensusWorkspace::default();
        let a = ws.append_fragment(1, FragmentKind::Read, b"AACGT", &[30; 5], false).unwrap();
        let b = ws.append_fragment(2, FragmentKind::Read, b"ACGT", &[30; 4], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, a, CallMode::Plurality).unwrap();
        ws.apply_alignment(AlignTarget::Fragment(a), b, 0, &[2]).unwrap();
        let columns = ws.column_order(mid).unwrap();
        assert_eq!(stack(&ws, columns[1]), b"-A".to_vec());

        let mut abacus = ws.create_abacus(columns[0], Some(columns[3])).unwrap();
        abacus.right_shift();
        assert!(ws.apply_abacus(&abacus).unwrap());
        assert_eq!(stack(&ws, columns[0]), b"-A".to_vec());
        assert_eq!(stack(&ws, columns[1]), b"AA".to_vec());

        let mut abacus = ws.create_abacus(columns[0], Some(columns[3])).unwrap();
        abacus.left_shift();
        assert!(ws.apply_abacus(&abacus).unwrap());
        assert_eq!(stack(&ws, columns[0]), b"AA".to_vec());
        assert_eq!(stack(&ws, columns[1]), b"-A".to_vec());
        assert_eq!(stack(&ws, columns[2]), b"CC".to_vec());
    }

    #[test]
    fn test_unshifted_is_not_applied() {
        let (mut ws, mid, _) = homopolymer_layout();
        let columns = ws.column_order(mid).unwrap();
        let abacus = ws.create_abacus(columns[3], Some(columns[6])).unwrap();
        assert!(!ws.apply_abacus(&abacus).unwrap());
    }

    #[test]
    fn test_refine_window() {
        let (mut ws, mid, _) = homopolymer_layout();
        let columns = ws.column_order(mid).unwrap();
        let reduction = ws.refine_window(columns[3], columns[6]).unwrap();
        assert_eq!(reduction, 1);
        assert_eq!(stack(&ws, columns[3]), b"TTT".to_vec());
        assert_eq!(stack(&ws, columns[4]), b"TTT".to_vec());
        assert_eq!(stack(&ws, columns[5]), b"--T".to_vec());
    }

    #[test]
    fn test_abacus_refine_polyx() {
        let (mut ws, mid, _) = homopolymer_layout();
        let outcome = ws.abacus_refine(mid, RefineLevel::Polyx).unwrap();
        assert_eq!(outcome.windows, 1);
        assert_eq!(outcome.refined, 1);
        assert_eq!(outcome.score_reduction, 1);

        let columns = ws.column_order(mid).unwrap();
        assert_eq!(columns.len(), 9);
        assert_eq!(stack(&ws, columns[5]), b"--T".to_vec());
    }

    #[test]
    fn test_abacus_refine_nothing_to_do() {
        let mut ws = ConsensusWorkspace::default();
        let a = ws.append_fragment(1, FragmentKind::Read, b"ACGTACGT", &[30; 8], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, a, CallMode::Plurality).unwrap();
        ws.refresh(mid, CallMode::Plurality, false).unwrap();
        for level in [RefineLevel::Smooth, RefineLevel::Polyx, RefineLevel::Indel] {
            let outcome = ws.abacus_refine(mid, level).unwrap();
            assert_eq!(outcome, RefineOutcome::default());
        }
        let (consensus, _) = ws.consensus(mid).unwrap();
        assert_eq!(consensus, b"ACGTACGT".to_vec());
    }
}
