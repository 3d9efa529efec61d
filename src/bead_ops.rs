
/*!
Bead-level primitives of the multi-alignment graph.
Every bead sits in two doubly linked lists: the horizontal chain of its fragment and the vertical stack of its column.
The functions here keep both lists and the column tallies consistent.
*/

use simple_error::bail;

use crate::cns_config::GAP_FALLBACK_QV;
use crate::workspace::{BeadId, ColumnId, ConsensusWorkspace, FragmentId};

impl ConsensusWorkspace {
    /// Splices a bead into a column directly under the call bead and counts it.
    /// # Arguments
    /// * `cid` - the column to add to
    /// * `bid` - the bead, which must not currently be aligned
    /// # Errors
    /// * if the column or bead does not exist, or the bead is already aligned
    pub fn align_bead(&mut self, cid: ColumnId, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let call = self.column(cid)?.call;
        if let Some(current) = self.bead(bid)?.column {
            bail!("internal error: bead {bid:?} is already aligned to column {current:?}");
        }
        let first = self.bead(call)?.down;
        let c = self.bead_char(bid)?;

        {
            let bead = self.bead_mut(bid)?;
            bead.up = Some(call);
            bead.down = first;
            bead.column = Some(cid);
        }
        if let Some(f) = first {
            self.bead_mut(f)?.up = Some(bid);
        }
        self.bead_mut(call)?.down = Some(bid);
        self.column_mut(cid)?.base_count.increment(c)?;
        Ok(bid)
    }

    /// Removes a bead from its column stack and un-counts it.
    /// Returns the bead that was above it, or None if the bead was not aligned.
    /// # Errors
    /// * if the bead or its column links are broken
    pub fn unalign_bead(&mut self, bid: BeadId) -> Result<Option<BeadId>, Box<dyn std::error::Error>> {
        let bead = *self.bead(bid)?;
        let Some(cid) = bead.column else {
            return Ok(None);
        };
        let Some(up) = bead.up else {
            bail!("internal error: aligned bead {bid:?} has nothing above it");
        };
        let c = self.bead_char(bid)?;

        self.bead_mut(up)?.down = bead.down;
        if let Some(d) = bead.down {
            self.bead_mut(d)?.up = Some(up);
        }
        self.column_mut(cid)?.base_count.decrement(c)?;
        let bead = self.bead_mut(bid)?;
        bead.up = None;
        bead.down = None;
        bead.column = None;
        Ok(Some(up))
    }

    /// Unlinks a bead from its fragment chain, joining its neighbors.
    /// Returns the bead that followed it.
    /// # Errors
    /// * if the bead or its neighbors do not exist
    pub fn remove_bead_from_fragment(&mut self, bid: BeadId) -> Result<Option<BeadId>, Box<dyn std::error::Error>> {
        let bead = *self.bead(bid)?;
        if let Some(n) = bead.next {
            self.bead_mut(n)?.prev = bead.prev;
        }
        if let Some(p) = bead.prev {
            self.bead_mut(p)?.next = bead.next;
        }
        let removed = self.bead_mut(bid)?;
        removed.prev = None;
        removed.next = None;
        Ok(bead.next)
    }

    /// Removes a whole fragment from the alignment.
    /// All beads are unaligned, gap beads are dropped from the chain, and the fragment is flagged as deleted.
    /// # Errors
    /// * if any link of the fragment is broken
    pub fn unalign_fragment(&mut self, fid: FragmentId) -> Result<(), Box<dyn std::error::Error>> {
        for bid in self.fragment_beads(fid)? {
            self.unalign_bead(bid)?;
            if self.bead_char(bid)? == b'-' {
                self.remove_bead_from_fragment(bid)?;
            }
        }
        let frag = self.fragment_mut(fid)?;
        frag.deleted = true;
        frag.manode = None;
        Ok(())
    }

    /// Removes the run of gap beads that `bid` belongs to at the end (or start) of its fragment.
    /// Returns the bead the run was anchored to.
    /// # Arguments
    /// * `bid` - a gap bead at the fragment border
    /// # Errors
    /// * if a non-gap bead would have to be removed
    /// * if the bead has no anchor at all
    pub fn unalign_trailing_gap_beads(&mut self, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let mut anchor = self.bead(bid)?.prev;
        let mut bead = bid;

        // walk to the end of the run
        while let Some(n) = self.bead(bead)?.next {
            if self.bead_char(n)? != b'-' {
                break;
            }
            bead = n;
        }

        let mut run = vec![];
        if let Some(n) = self.bead(bead)?.next {
            // the run is leading, it is anchored on the right
            anchor = Some(n);
            while let Some(p) = self.bead(bead)?.prev {
                if self.bead_char(p)? != b'-' {
                    break;
                }
                bead = p;
            }
            let mut current = bead;
            while current != n {
                run.push(current);
                current = self.bead(current)?.next.ok_or("internal error: broken gap run")?;
            }
        } else {
            // the run is trailing, it is anchored on the left
            let mut current = Some(bead);
            while let Some(c) = current {
                if Some(c) == anchor {
                    break;
                }
                run.push(c);
                current = self.bead(c)?.prev;
            }
        }

        let Some(anchor) = anchor else {
            bail!("internal error: gap run at bead {bid:?} has no anchor");
        };
        for b in run {
            if self.bead_char(b)? != b'-' {
                bail!("internal error: bead {b:?} in a trailing gap run is not a gap");
            }
            self.unalign_bead(b)?;
            self.remove_bead_from_fragment(b)?;
        }
        Ok(anchor)
    }

    /// Creates a gap bead immediately after `bid` in its fragment chain.
    /// The quality is the lesser of its neighbors, a zero quality is replaced by a small fallback.
    /// # Errors
    /// * if the bead does not exist
    pub fn append_gap_bead(&mut self, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let prev = *self.bead(bid)?;
        let mut qv = self.bead_qv(bid)?;
        if let Some(n) = prev.next {
            qv = qv.min(self.bead_qv(n)?);
            if qv == 0 {
                qv = GAP_FALLBACK_QV;
            }
        }
        let gap = self.new_bead(b'-', qv, prev.frag);
        {
            let bead = self.bead_mut(gap)?;
            bead.prev = Some(bid);
            bead.next = prev.next;
        }
        if let Some(n) = prev.next {
            self.bead_mut(n)?.prev = Some(gap);
        }
        self.bead_mut(bid)?.next = Some(gap);
        Ok(gap)
    }

    /// Creates a gap bead immediately before `bid` in its fragment chain.
    /// # Errors
    /// * if the bead does not exist
    pub fn prepend_gap_bead(&mut self, bid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let next = *self.bead(bid)?;
        let mut qv = self.bead_qv(bid)?;
        if let Some(p) = next.prev {
            qv = qv.min(self.bead_qv(p)?);
            if qv == 0 {
                qv = GAP_FALLBACK_QV;
            }
        }
        let gap = self.new_bead(b'-', qv, next.frag);
        {
            let bead = self.bead_mut(gap)?;
            bead.prev = next.prev;
            bead.next = Some(bid);
        }
        if let Some(p) = next.prev {
            self.bead_mut(p)?.next = Some(gap);
        }
        self.bead_mut(bid)?.prev = Some(gap);
        Ok(gap)
    }

    /// Swaps the positions of two beads of the same fragment, which may only be separated by gap beads.
    /// Both horizontal and vertical links are exchanged, as are the column tallies.
    /// Returns `rid`, which now sits where `lid` was.
    /// # Errors
    /// * if a non-gap bead lies between the two
    /// * if `rid` is not to the right of `lid`
    /// * if either bead is unaligned
    pub fn lateral_exchange_bead(&mut self, lid: BeadId, rid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let l = *self.bead(lid)?;
        let r = *self.bead(rid)?;
        let (Some(lcol), Some(rcol)) = (l.column, r.column) else {
            bail!("internal error: lateral exchange of unaligned beads {lid:?} and {rid:?}");
        };
        let lchar = self.bead_char(lid)?;
        let rchar = self.bead_char(rid)?;

        // only gaps may intervene
        let mut current = l.next;
        loop {
            match current {
                Some(c) if c == rid => break,
                Some(c) => {
                    if self.bead_char(c)? != b'-' {
                        bail!("internal error: lateral exchange across non-gap bead {c:?}");
                    }
                    current = self.bead(c)?.next;
                },
                None => bail!("internal error: bead {rid:?} does not follow {lid:?}")
            }
        }

        let adjacent = r.prev == Some(lid);
        {
            let rb = self.bead_mut(rid)?;
            rb.up = l.up;
            rb.down = l.down;
            rb.prev = l.prev;
            rb.next = if adjacent { Some(lid) } else { l.next };
            rb.column = Some(lcol);
        }
        {
            let lb = self.bead_mut(lid)?;
            lb.up = r.up;
            lb.down = r.down;
            lb.prev = if adjacent { Some(rid) } else { r.prev };
            lb.next = r.next;
            lb.column = Some(rcol);
        }
        if let Some(u) = l.up {
            self.bead_mut(u)?.down = Some(rid);
        }
        if let Some(d) = l.down {
            self.bead_mut(d)?.up = Some(rid);
        }
        if let Some(p) = l.prev {
            self.bead_mut(p)?.next = Some(rid);
        }
        if let Some(u) = r.up {
            self.bead_mut(u)?.down = Some(lid);
        }
        if let Some(d) = r.down {
            self.bead_mut(d)?.up = Some(lid);
        }
        if let Some(n) = r.next {
            self.bead_mut(n)?.prev = Some(lid);
        }
        if !adjacent {
            if let Some(n) = l.next {
                self.bead_mut(n)?.prev = Some(rid);
            }
            if let Some(p) = r.prev {
                self.bead_mut(p)?.next = Some(lid);
            }
        }

        let left_column = self.column_mut(lcol)?;
        left_column.base_count.decrement(lchar)?;
        left_column.base_count.increment(rchar)?;
        let right_column = self.column_mut(rcol)?;
        right_column.base_count.decrement(rchar)?;
        right_column.base_count.increment(lchar)?;
        Ok(rid)
    }

    /// Moves bead `eid` left to the position of `bid`.
    /// A non-gap `eid` is exchanged directly (everything in between must be gaps),
    /// while a gap `eid` is walked left one exchange at a time so the beads in between keep their order.
    /// Returns the bead now at the position of `bid`.
    /// # Errors
    /// * if an exchange fails
    pub fn left_end_shift_bead(&mut self, bid: BeadId, eid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let aid = self.bead(bid)?.prev;
        if self.bead_char(eid)? != b'-' {
            self.lateral_exchange_bead(bid, eid)?;
            return Ok(eid);
        }
        loop {
            let prev = self.bead(eid)?.prev;
            if prev == aid {
                break;
            }
            let Some(p) = prev else {
                bail!("internal error: left shift of {eid:?} ran off the fragment");
            };
            self.lateral_exchange_bead(p, eid)?;
        }
        Ok(eid)
    }

    /// Moves bead `bid` right to the position of `eid`, the mirror of [`ConsensusWorkspace::left_end_shift_bead`].
    /// Returns the bead now at the position of the original `bid`.
    /// # Errors
    /// * if an exchange fails
    pub fn right_end_shift_bead(&mut self, bid: BeadId, eid: BeadId) -> Result<BeadId, Box<dyn std::error::Error>> {
        let aid = self.bead(eid)?.next;
        if self.bead_char(bid)? != b'-' {
            self.lateral_exchange_bead(bid, eid)?;
            return Ok(eid);
        }
        let rid = self.bead(bid)?.next.ok_or("internal error: right shift of a terminal bead")?;
        loop {
            let next = self.bead(bid)?.next;
            if next == aid {
                break;
            }
            let Some(n) = next else {
                bail!("internal error: right shift of {bid:?} ran off the fragment");
            };
            self.lateral_exchange_bead(bid, n)?;
        }
        Ok(rid)
    }
}
