
/*!
Detection of the column windows that abacus refinement works on.
Windows are found by scanning the column calls left to right, the kind of window depends on the refinement level.
*/

use crate::base_count::BaseCount;
use crate::cns_config::{CNS_SEQUENCING_ERROR_EST, STAB_GAP_RATE, STAB_WIDTH};
use crate::workspace::{ColumnId, ConsensusWorkspace};

/// Enumeration of the refinement passes, from the cheapest to the most aggressive
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum RefineLevel {
    /// Runs of columns whose call is a gap
    #[default]
    Smooth,
    /// Homopolymer runs mixed with gap-called columns
    Polyx,
    /// Unstable regions, grown until a stable border of low mismatch and gap rate follows
    Indel
}

/// A run of columns selected for refinement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    /// First column of the window
    pub start: ColumnId,
    /// First column after the window
    pub stab_bgn: ColumnId,
    /// Number of columns in the window
    pub width: usize
}

/// Outcome of scanning one column for a window
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowScan {
    /// The window starting at or before the scanned column, if one qualified
    pub window: Option<Window>,
    /// Where the scan continues, None at the end of the node
    pub resume: Option<ColumnId>
}

/// Running sums over a block of columns
#[derive(Clone, Copy, Debug, Default)]
struct BlockStats {
    mismatches: usize,
    gaps: usize,
    bases: usize
}

impl BlockStats {
    fn add(&mut self, count: &BaseCount) {
        self.mismatches += count.mismatch();
        self.gaps += count.get(b'-');
        self.bases += count.depth();
    }

    fn remove(&mut self, count: &BaseCount) {
        self.mismatches = self.mismatches.saturating_sub(count.mismatch());
        self.gaps = self.gaps.saturating_sub(count.get(b'-'));
        self.bases = self.bases.saturating_sub(count.depth());
    }

    fn is_unstable(&self) -> bool {
        let bases = self.bases as f64;
        self.mismatches as f64 / bases > CNS_SEQUENCING_ERROR_EST || self.gaps as f64 / bases > STAB_GAP_RATE
    }
}

impl ConsensusWorkspace {
    /// Looks for a refinement window at column `start`.
    /// Windows never include the last column of the node.
    /// # Arguments
    /// * `start` - the candidate first column, a POLYX window may extend to the left of it
    /// * `level` - which kind of window to look for
    /// # Errors
    /// * if any column is invalid
    pub fn identify_window(&self, start: ColumnId, level: RefineLevel) -> Result<WindowScan, Box<dyn std::error::Error>> {
        let Some(next) = self.column(start)?.next else {
            return Ok(WindowScan { window: None, resume: None });
        };
        let (start, stab_bgn, width, qualifies) = match level {
            RefineLevel::Smooth => self.smooth_window(start, next)?,
            RefineLevel::Polyx => self.polyx_window(start, next)?,
            RefineLevel::Indel => self.indel_window(start, next)?
        };
        let window = qualifies.then_some(Window { start, stab_bgn, width });
        Ok(WindowScan { window, resume: Some(stab_bgn) })
    }

    fn call_char(&self, cid: ColumnId) -> Result<u8, Box<dyn std::error::Error>> {
        Ok(self.column_call(cid)?.0)
    }

    /// A run of gap calls of width at least 2.
    fn smooth_window(&self, start: ColumnId, mut stab: ColumnId) -> Result<(ColumnId, ColumnId, usize, bool), Box<dyn std::error::Error>> {
        let mut width = 1;
        if self.call_char(start)? != b'-' {
            return Ok((start, stab, width, false));
        }
        while self.call_char(stab)? == b'-' {
            let Some(next) = self.column(stab)?.next else {
                break;
            };
            stab = next;
            width += 1;
        }
        Ok((start, stab, width, width > 1))
    }

    /// A homopolymer run interrupted by gap calls, extended with trailing gap columns that lean towards the same base
    /// and with leading columns of the same base or gaps.
    fn polyx_window(&self, mut start: ColumnId, mut stab: ColumnId) -> Result<(ColumnId, ColumnId, usize, bool), Box<dyn std::error::Error>> {
        let mut width = 1;
        let poly = self.call_char(start)?;
        let mut gap_count = self.column(start)?.base_count.get(b'-');
        if poly == b'-' {
            return Ok((start, stab, width, false));
        }

        loop {
            let cb = self.call_char(stab)?;
            if cb != poly && cb != b'-' {
                break;
            }
            let column = self.column(stab)?;
            let Some(next) = column.next else {
                break;
            };
            gap_count += column.base_count.get(b'-');
            stab = next;
            width += 1;
        }
        if width <= 2 {
            return Ok((start, stab, width, false));
        }

        // trailing gap-called columns
        while self.call_char(stab)? == b'-' {
            let column = self.column(stab)?;
            if column.base_count.max_base(1, None) != poly {
                break;
            }
            let Some(next) = column.next else {
                break;
            };
            gap_count += column.base_count.get(b'-');
            stab = next;
            width += 1;
        }

        // leading columns
        while let Some(prev) = self.column(start)?.prev {
            let cb = self.call_char(prev)?;
            if cb != b'-' && cb != poly {
                break;
            }
            start = prev;
            gap_count += self.column(prev)?.base_count.get(b'-');
            width += 1;
        }

        let qualifies = self.column(start)?.prev.is_some() && gap_count > 0;
        Ok((start, stab, width, qualifies))
    }

    /// A mismatched column with gaps, grown to the right until the following block of columns is stable.
    fn indel_window(&self, start: ColumnId, first: ColumnId) -> Result<(ColumnId, ColumnId, usize, bool), Box<dyn std::error::Error>> {
        let start_count = self.column(start)?.base_count;
        if start_count.mismatch() == 0 || start_count.get(b'-') == 0 {
            return Ok((start, first, 1, false));
        }

        let mut stats = BlockStats::default();
        let mut stab = first;
        let mut stab_end = first;
        let mut stab_width = 0;
        while stab_width < STAB_WIDTH {
            let column = self.column(stab_end)?;
            let Some(next) = column.next else {
                break;
            };
            stats.add(&column.base_count);
            stab_end = next;
            stab_width += 1;
        }
        if stats.bases == 0 {
            return Ok((start, first, 1, false));
        }

        let mut width = 1;
        while stats.bases > 0 && stats.is_unstable() {
            let end_column = self.column(stab_end)?;
            let Some(next_end) = end_column.next else {
                break;
            };
            let Some(next_stab) = self.column(stab)?.next else {
                break;
            };
            stats.add(&end_column.base_count);
            stats.remove(&self.column(stab)?.base_count);
            stab_end = next_end;
            stab = next_stab;
            width += 1;
        }
        Ok((start, stab, width, width > 1))
    }
}
