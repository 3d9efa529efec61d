
/*!
Applies a pairwise overlap to the multi-alignment graph.
The new fragment (B) is walked in step with the sequence it was aligned to (A), aligning matched positions into existing columns,
giving B gap beads where A has gaps or deletions, and opening new columns where B has extra bases or extends past either end.
*/

use log::trace;
use simple_error::bail;

use crate::workspace::{BeadId, ColumnId, ConsensusWorkspace, FragmentId};

/// The sequence a new fragment was aligned against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlignTarget {
    /// The ungapped bases of a fragment that is already in the alignment
    Fragment(FragmentId),
    /// The gapped consensus of a node, starting at the given call bead
    Consensus(BeadId)
}

/// State of the lock-step walk over A and B
struct TraceWalker {
    /// A positions, one bead per position
    aindex: Vec<BeadId>,
    /// B bases
    bbeads: Vec<BeadId>,
    apos: usize,
    bpos: usize,
    last_a: Option<BeadId>,
    last_b: Option<BeadId>
}

fn column_of(ws: &ConsensusWorkspace, bid: BeadId) -> Result<ColumnId, Box<dyn std::error::Error>> {
    match ws.bead(bid)?.column {
        Some(cid) => Ok(cid),
        None => bail!("internal error: bead {bid:?} of the alignment target is not in a column")
    }
}

impl TraceWalker {
    fn check_bounds(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.apos >= self.aindex.len() || self.bpos >= self.bbeads.len() {
            bail!("alignment trace runs past the end of a sequence (apos={}, bpos={})", self.apos, self.bpos);
        }
        Ok(())
    }

    /// Aligns the next B base with the next A position.
    fn align_next(&mut self, ws: &mut ConsensusWorkspace) -> Result<(), Box<dyn std::error::Error>> {
        self.check_bounds()?;
        let abead = self.aindex[self.apos];
        let bbead = self.bbeads[self.bpos];
        let cid = column_of(ws, abead)?;
        ws.align_bead(cid, bbead)?;
        self.last_a = Some(abead);
        self.last_b = Some(bbead);
        self.apos += 1;
        self.bpos += 1;
        self.fill_a_gaps(ws, abead)
    }

    /// Gives B a gap against the next A position.
    fn skip_a(&mut self, ws: &mut ConsensusWorkspace) -> Result<(), Box<dyn std::error::Error>> {
        if self.apos >= self.aindex.len() {
            bail!("alignment trace runs past the end of the target (apos={})", self.apos);
        }
        let abead = self.aindex[self.apos];
        match self.last_b {
            Some(lb) => {
                let gap = ws.append_gap_bead(lb)?;
                let cid = column_of(ws, abead)?;
                ws.align_bead(cid, gap)?;
                self.last_b = Some(gap);
            },
            None => trace!("Deletion before the first aligned base at apos={}, skipping", self.apos)
        };
        self.last_a = Some(abead);
        self.apos += 1;
        self.fill_a_gaps(ws, abead)
    }

    /// Gives B a gap bead in every column where A has a gap bead, up to the next A position.
    fn fill_a_gaps(&mut self, ws: &mut ConsensusWorkspace, abead: BeadId) -> Result<(), Box<dyn std::error::Error>> {
        let next_a = self.aindex.get(self.apos).copied();
        let mut current = ws.bead(abead)?.next;
        while let Some(cid_bead) = current {
            if Some(cid_bead) == next_a {
                break;
            }
            if let Some(lb) = self.last_b {
                let gap = ws.append_gap_bead(lb)?;
                let cid = column_of(ws, cid_bead)?;
                ws.align_bead(cid, gap)?;
                self.last_b = Some(gap);
            }
            self.last_a = Some(cid_bead);
            current = ws.bead(cid_bead)?.next;
        }
        Ok(())
    }

    /// Places the next B base in a new column immediately before the next A position.
    fn insert_b(&mut self, ws: &mut ConsensusWorkspace) -> Result<(), Box<dyn std::error::Error>> {
        self.check_bounds()?;
        let anext = self.aindex[self.apos];
        let bbead = self.bbeads[self.bpos];
        match ws.bead(anext)?.prev {
            Some(prev) => {
                let cid = column_of(ws, prev)?;
                ws.column_append(cid, bbead)?
            },
            None => {
                let cid = column_of(ws, anext)?;
                ws.column_prepend(cid, bbead)?
            }
        };
        self.last_a = ws.bead(anext)?.prev;
        self.last_b = Some(bbead);
        self.bpos += 1;
        Ok(())
    }
}

impl ConsensusWorkspace {
    /// Aligns fragment `bfid` to an already aligned target using a pairwise overlap.
    /// Returns the last bead of B that was placed inside the overlap, if any.
    /// # Arguments
    /// * `target` - the sequence B was aligned against
    /// * `bfid` - the new fragment, which must not be aligned yet
    /// * `ahang` - offset of B's first base in the target, negative if B starts first
    /// * `trace` - signed indel positions of the overlap, in target coordinates
    /// # Errors
    /// * if the hang places B after the end of the target or before its start by more than B's length
    /// * if the trace runs past the end of either sequence
    /// * if any link of the graph is broken
    pub fn apply_alignment(&mut self, target: AlignTarget, bfid: FragmentId, ahang: i64, trace: &[i64]) -> Result<Option<BeadId>, Box<dyn std::error::Error>> {
        let (aindex, manode) = match target {
            AlignTarget::Fragment(afid) => {
                let frag = self.fragment(afid)?;
                let aindex: Vec<BeadId> = (0..frag.length()).filter_map(|i| frag.bead(i)).collect();
                (aindex, frag.manode)
            },
            AlignTarget::Consensus(bid) => {
                let mut aindex = vec![];
                let mut current = Some(bid);
                while let Some(c) = current {
                    if aindex.len() > self.num_beads() {
                        bail!("internal error: consensus chain starting at {bid:?} loops");
                    }
                    aindex.push(c);
                    current = self.bead(c)?.next;
                }
                let cid = column_of(self, bid)?;
                (aindex, self.column(cid)?.manode)
            }
        };
        let bfrag = self.fragment(bfid)?;
        let bbeads: Vec<BeadId> = (0..bfrag.length()).filter_map(|i| bfrag.bead(i)).collect();
        let (alen, blen) = (aindex.len() as i64, bbeads.len() as i64);
        if alen == 0 || ahang > alen || -ahang > blen {
            bail!("hang {ahang} is outside the target (target length {alen}, fragment length {blen})");
        }

        let apos = ahang.max(0) as usize;
        let mut walker = TraceWalker {
            apos,
            bpos: 0,
            last_a: None,
            last_b: None,
            aindex,
            bbeads
        };

        if ahang < 0 {
            let first_col = column_of(self, walker.aindex[0])?;
            while (walker.bpos as i64) < -ahang {
                self.column_prepend(first_col, walker.bbeads[walker.bpos])?;
                walker.bpos += 1;
            }
            walker.last_b = Some(walker.bbeads[walker.bpos - 1]);
        }
        walker.last_a = if apos == walker.aindex.len() {
            walker.aindex.last().copied()
        } else {
            self.bead(walker.aindex[apos])?.prev
        };

        for &t in trace.iter() {
            if t < 0 {
                // B base in a new column before A position -t
                let stop = (-t - 1) as usize;
                while walker.apos < stop {
                    walker.align_next(self)?;
                }
                walker.insert_b(self)?;
            } else if t > 0 {
                // gap in B before B position t
                let stop = (t - 1) as usize;
                while walker.bpos < stop {
                    walker.align_next(self)?;
                }
                walker.skip_a(self)?;
            }
        }

        let remaining = (walker.bbeads.len() - walker.bpos).min(walker.aindex.len() - walker.apos);
        for _ in 0..remaining {
            walker.align_next(self)?;
        }
        let last_placed = walker.last_b;

        if walker.bpos < walker.bbeads.len() {
            let Some(last_a) = walker.last_a else {
                bail!("internal error: fragment {bfid:?} overhangs a target it never touched");
            };
            let mut cid = column_of(self, last_a)?;
            // columns already right of the target get gaps first
            if let Some(mut lb) = walker.last_b {
                while let Some(next) = self.column(cid)?.next {
                    let gap = self.append_gap_bead(lb)?;
                    self.align_bead(next, gap)?;
                    lb = gap;
                    cid = next;
                }
            }
            while walker.bpos < walker.bbeads.len() {
                cid = self.column_append(cid, walker.bbeads[walker.bpos])?;
                walker.bpos += 1;
            }
        }

        self.fragment_mut(bfid)?.manode = manode;
        Ok(last_placed)
    }

    /// Re-applies a stored placement of fragment `bfid` against a gapped template fragment.
    /// The template's beads are consecutive, so no new columns are created.
    /// # Arguments
    /// * `template` - the aligned template, usually added with [`ConsensusWorkspace::append_template`]
    /// * `bfid` - the fragment being placed
    /// * `ahang` - gapped offset of B's first base in the template
    /// * `deltas` - for each gap in B, the number of B bases preceding it
    /// # Errors
    /// * if the placement runs past the end of the template
    /// * if a delta is larger than B or places a gap before B's first base
    pub fn apply_imp_alignment(&mut self, template: FragmentId, bfid: FragmentId, ahang: usize, deltas: &[usize]) -> Result<(), Box<dyn std::error::Error>> {
        let afrag = self.fragment(template)?.clone();
        let bfrag = self.fragment(bfid)?;
        let bbeads: Vec<BeadId> = (0..bfrag.length()).filter_map(|i| bfrag.bead(i)).collect();

        let template_column = |ws: &ConsensusWorkspace, apos: usize| -> Result<ColumnId, Box<dyn std::error::Error>> {
            let Some(abead) = afrag.bead(apos) else {
                bail!("placement of fragment {bfid:?} runs past the end of template {}", afrag.ident);
            };
            column_of(ws, abead)
        };

        let mut apos = ahang;
        let mut bpos = 0;
        let mut last_b: Option<BeadId> = None;
        for &d in deltas.iter() {
            if d > bbeads.len() {
                bail!("delta {d} is past the end of fragment {bfid:?}");
            }
            while bpos < d {
                let cid = template_column(self, apos)?;
                self.align_bead(cid, bbeads[bpos])?;
                last_b = Some(bbeads[bpos]);
                apos += 1;
                bpos += 1;
            }
            let Some(lb) = last_b else {
                bail!("delta {d} places a gap before the first base of fragment {bfid:?}");
            };
            let gap = self.append_gap_bead(lb)?;
            let cid = template_column(self, apos)?;
            self.align_bead(cid, gap)?;
            last_b = Some(gap);
            apos += 1;
        }
        while bpos < bbeads.len() {
            let cid = template_column(self, apos)?;
            self.align_bead(cid, bbeads[bpos])?;
            apos += 1;
            bpos += 1;
        }

        self.fragment_mut(bfid)?.manode = afrag.manode;
        Ok(())
    }
}
