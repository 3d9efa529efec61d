
/*!
Column-level primitives of the multi-alignment graph.
Columns form a doubly linked list per multi-alignment node, and so do their call beads.
Inserting a column next to an existing one fills every fragment that spans the insertion point with a gap bead,
so each fragment keeps exactly one bead per column it covers.
*/

use simple_error::bail;

use crate::workspace::{BeadId, ColumnId, ConsensusWorkspace, ManodeId};

impl ConsensusWorkspace {
    /// Creates an unlinked column seeded with one bead, the call starts as `n` with quality 0.
    /// # Errors
    /// * if the bead does not exist or is already aligned
    pub fn create_column(&mut self, bid: BeadId) -> Result<ColumnId, Box<dyn std::error::Error>> {
        // make sure the seed is valid before allocating anything
        if self.bead(bid)?.column.is_some() {
            bail!("internal error: cannot seed a column with aligned bead {bid:?}");
        }
        let call = self.new_bead(b'n', 0, None);
        let cid = self.new_column(call);
        self.bead_mut(call)?.column = Some(cid);
        self.align_bead(cid, bid)?;
        Ok(cid)
    }

    /// Starts the column list of a node with a single column.
    /// # Errors
    /// * if the node or bead does not exist
    pub fn first_column(&mut self, mid: ManodeId, bid: BeadId) -> Result<ColumnId, Box<dyn std::error::Error>> {
        let cid = self.create_column(bid)?;
        {
            let column = self.column_mut(cid)?;
            column.manode = Some(mid);
            column.ma_index = 0;
        }
        self.add_column_to_manode(mid, cid)?;
        Ok(cid)
    }

    /// Inserts a new column seeded with `bid` immediately to the right of `cid`.
    /// Every bead of `cid` whose fragment continues past it (other than into `bid`) gets a gap bead in the new column.
    /// # Errors
    /// * if either id is invalid
    pub fn column_append(&mut self, cid: ColumnId, bid: BeadId) -> Result<ColumnId, Box<dyn std::error::Error>> {
        let new_cid = self.create_column(bid)?;
        let prev = *self.column(cid)?;
        let call = self.column(new_cid)?.call;
        let prev_call_next = self.bead(prev.call)?.next;

        {
            let column = self.column_mut(new_cid)?;
            column.next = prev.next;
            column.prev = Some(cid);
            column.manode = prev.manode;
            column.ma_index = prev.ma_index + 1;
        }
        {
            let call_bead = self.bead_mut(call)?;
            call_bead.next = prev_call_next;
            call_bead.prev = Some(prev.call);
        }
        self.column_mut(cid)?.next = Some(new_cid);
        self.bead_mut(prev.call)?.next = Some(call);
        if let Some(n) = prev.next {
            self.column_mut(n)?.prev = Some(new_cid);
        }
        if let Some(n) = prev_call_next {
            self.bead_mut(n)?.prev = Some(call);
        }

        for nid in self.column_beads(cid)? {
            let next = self.bead(nid)?.next;
            if next.is_some() && next != Some(bid) {
                let gap = self.append_gap_bead(nid)?;
                self.align_bead(new_cid, gap)?;
            }
        }

        if let Some(mid) = prev.manode {
            self.add_column_to_manode(mid, new_cid)?;
        }
        Ok(new_cid)
    }

    /// Inserts a new column seeded with `bid` immediately to the left of `cid`, the mirror of [`ConsensusWorkspace::column_append`].
    /// # Errors
    /// * if either id is invalid
    pub fn column_prepend(&mut self, cid: ColumnId, bid: BeadId) -> Result<ColumnId, Box<dyn std::error::Error>> {
        let new_cid = self.create_column(bid)?;
        let next = *self.column(cid)?;
        let call = self.column(new_cid)?.call;
        let next_call_prev = self.bead(next.call)?.prev;

        {
            let column = self.column_mut(new_cid)?;
            column.prev = next.prev;
            column.next = Some(cid);
            column.manode = next.manode;
            column.ma_index = next.ma_index - 1;
        }
        {
            let call_bead = self.bead_mut(call)?;
            call_bead.prev = next_call_prev;
            call_bead.next = Some(next.call);
        }
        self.column_mut(cid)?.prev = Some(new_cid);
        self.bead_mut(next.call)?.prev = Some(call);
        if let Some(p) = next.prev {
            self.column_mut(p)?.next = Some(new_cid);
        }
        if let Some(p) = next_call_prev {
            self.bead_mut(p)?.next = Some(call);
        }

        for nid in self.column_beads(cid)? {
            let prev = self.bead(nid)?.prev;
            if prev.is_some() && prev != Some(bid) {
                let gap = self.prepend_gap_bead(nid)?;
                self.align_bead(new_cid, gap)?;
            }
        }

        if let Some(mid) = next.manode {
            self.add_column_to_manode(mid, new_cid)?;
        }
        Ok(new_cid)
    }

    /// Registers a column with its node, updating the node ends.
    fn add_column_to_manode(&mut self, mid: ManodeId, cid: ColumnId) -> Result<(), Box<dyn std::error::Error>> {
        let column = *self.column(cid)?;
        let manode = self.manode_mut(mid)?;
        manode.columns.push(cid);
        if column.next.is_none() {
            manode.last = Some(cid);
        }
        if column.prev.is_none() {
            manode.first = Some(cid);
        }
        Ok(())
    }

    /// Tests whether column `cid` and its right neighbor can be merged, and merges them if so.
    /// Two columns are compatible when every fragment present in both has a gap in at least one of them.
    /// After a merge the right column holds only gaps.
    /// # Errors
    /// * if any link is broken
    pub fn merge_compatible(&mut self, cid: ColumnId) -> Result<bool, Box<dyn std::error::Error>> {
        let Some(merge_cid) = self.column(cid)?.next else {
            return Ok(false);
        };

        let beads = self.column_beads(cid)?;
        for &cbead in beads.iter() {
            let Some(mbead) = self.bead(cbead)?.next else {
                continue;
            };
            if self.bead_char(cbead)? != b'-' && self.bead_char(mbead)? != b'-' {
                return Ok(false);
            }
        }

        // pull bases from the right column into gaps on the left
        for &cbead in beads.iter() {
            let Some(mbead) = self.bead(cbead)?.next else {
                continue;
            };
            if self.bead_char(cbead)? == b'-' && self.bead_char(mbead)? != b'-' {
                self.left_end_shift_bead(cbead, mbead)?;
            }
        }

        // fragments that start in the right column move over directly
        let mut guard = 0;
        while !self.column(merge_cid)?.base_count.is_null() {
            guard += 1;
            if guard > self.num_beads() {
                bail!("internal error: merge of column {merge_cid:?} does not converge");
            }
            let mut moved = false;
            for mbead in self.column_beads(merge_cid)? {
                if self.bead_char(mbead)? != b'-' {
                    self.unalign_bead(mbead)?;
                    self.align_bead(cid, mbead)?;
                    moved = true;
                    break;
                }
            }
            if !moved {
                bail!("internal error: column {merge_cid:?} tally disagrees with its beads");
            }
        }
        Ok(true)
    }

    /// Removes a column that contains only gap beads, dropping those beads from their fragments.
    /// # Errors
    /// * if the column contains a non-gap bead
    pub fn remove_null_column(&mut self, nid: ColumnId) -> Result<(), Box<dyn std::error::Error>> {
        let column = *self.column(nid)?;
        if !column.base_count.is_null() {
            bail!("internal error: column {nid:?} is not null and cannot be removed");
        }
        for bid in self.column_beads(nid)? {
            self.remove_bead_from_fragment(bid)?;
            self.unalign_bead(bid)?;
        }
        self.remove_bead_from_fragment(column.call)?;
        if let Some(p) = column.prev {
            self.column_mut(p)?.next = column.next;
        }
        if let Some(n) = column.next {
            self.column_mut(n)?.prev = column.prev;
        }
        if let Some(mid) = column.manode {
            let manode = self.manode_mut(mid)?;
            if manode.first == Some(nid) {
                manode.first = column.next;
            }
            if manode.last == Some(nid) {
                manode.last = column.prev;
            }
            manode.columns.retain(|&c| c != nid);
        }
        let removed = self.column_mut(nid)?;
        removed.prev = None;
        removed.next = None;
        removed.manode = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::base_call::CallMode;
    use crate::workspace::{ConsensusWorkspace, FragmentKind};

    #[test]
    fn test_append_fills_gaps() {
        let mut ws = ConsensusWorkspace::default();
        let f1 = ws.append_fragment(1, FragmentKind::Read, b"ACGT", &[30; 4], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, f1, CallMode::Promote).unwrap();
        let columns = ws.column_order(mid).unwrap();
        assert_eq!(columns.len(), 4);

        // an insertion after C in a second read
        let f2 = ws.append_fragment(2, FragmentKind::Read, b"ACTGT", &[30; 5], false).unwrap();
        let frag2 = ws.fragment(f2).unwrap().clone();
        ws.align_bead(columns[0], frag2.bead(0).unwrap()).unwrap();
        ws.align_bead(columns[1], frag2.bead(1).unwrap()).unwrap();
        let new_cid = ws.column_append(columns[1], frag2.bead(2).unwrap()).unwrap();

        // the first read got a gap in the new column
        let f1_chain: Vec<u8> = ws.fragment_beads(f1).unwrap().iter().map(|&b| ws.bead_char(b).unwrap()).collect();
        assert_eq!(f1_chain, b"AC-GT".to_vec());
        let column = ws.column(new_cid).unwrap();
        assert_eq!(column.base_count.depth(), 2);
        assert_eq!(column.base_count.get(b'T'), 1);
        assert_eq!(column.base_count.get(b'-'), 1);
        assert_eq!(ws.column_order(mid).unwrap().len(), 5);
        assert_eq!(ws.column_order(mid).unwrap()[2], new_cid);
    }

    #[test]
    fn test_prepend() {
        let mut ws = ConsensusWorkspace::default();
        let f1 = ws.append_fragment(1, FragmentKind::Read, b"CGT", &[30; 3], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, f1, CallMode::Promote).unwrap();
        let columns = ws.column_order(mid).unwrap();

        let f2 = ws.append_fragment(2, FragmentKind::Read, b"ACG", &[30; 3], false).unwrap();
        let frag2 = ws.fragment(f2).unwrap().clone();
        let new_cid = ws.column_prepend(columns[0], frag2.bead(0).unwrap()).unwrap();
        ws.align_bead(columns[0], frag2.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[1], frag2.bead(2).unwrap()).unwrap();

        // f1 starts in the old first column, so nothing gets filled
        assert_eq!(ws.column(new_cid).unwrap().base_count.depth(), 1);
        assert_eq!(ws.manode(mid).unwrap().first, Some(new_cid));
        assert_eq!(ws.column_order(mid).unwrap().len(), 4);
    }

    #[test]
    fn test_merge_and_remove_null() {
        let mut ws = ConsensusWorkspace::default();
        let f1 = ws.append_fragment(1, FragmentKind::Read, b"ACGT", &[30; 4], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, f1, CallMode::Promote).unwrap();
        let columns = ws.column_order(mid).unwrap();

        // second read A C - G T, with an extra column between C and G where it has a T
        let f2 = ws.append_fragment(2, FragmentKind::Read, b"ACTGT", &[30; 5], false).unwrap();
        let frag2 = ws.fragment(f2).unwrap().clone();
        ws.align_bead(columns[0], frag2.bead(0).unwrap()).unwrap();
        ws.align_bead(columns[1], frag2.bead(1).unwrap()).unwrap();
        let ins = ws.column_append(columns[1], frag2.bead(2).unwrap()).unwrap();
        ws.align_bead(columns[2], frag2.bead(3).unwrap()).unwrap();
        ws.align_bead(columns[3], frag2.bead(4).unwrap()).unwrap();

        // C column and the insertion column are not compatible, the insertion and G are not either
        assert!(!ws.merge_compatible(columns[1]).unwrap());
        assert!(!ws.merge_compatible(ins).unwrap());
        // last column has nothing to merge with
        assert!(!ws.merge_compatible(columns[3]).unwrap());

        // a null column can be removed only when it is all gaps
        assert!(ws.remove_null_column(ins).is_err());
    }

    #[test]
    fn test_merge_compatible_columns() {
        let mut ws = ConsensusWorkspace::default();
        let f1 = ws.append_fragment(1, FragmentKind::Read, b"AT", &[30; 2], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, f1, CallMode::Promote).unwrap();
        let columns = ws.column_order(mid).unwrap();

        // read 2 = A C T with C in a new column; read 3 = A G T with G in another new column
        let f2 = ws.append_fragment(2, FragmentKind::Read, b"ACT", &[30; 3], false).unwrap();
        let frag2 = ws.fragment(f2).unwrap().clone();
        ws.align_bead(columns[0], frag2.bead(0).unwrap()).unwrap();
        let c2 = ws.column_append(columns[0], frag2.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[1], frag2.bead(2).unwrap()).unwrap();

        let f3 = ws.append_fragment(3, FragmentKind::Read, b"AGT", &[30; 3], false).unwrap();
        let frag3 = ws.fragment(f3).unwrap().clone();
        ws.align_bead(columns[0], frag3.bead(0).unwrap()).unwrap();
        let gap = ws.append_gap_bead(frag3.bead(0).unwrap()).unwrap();
        ws.align_bead(c2, gap).unwrap();
        let c3 = ws.column_append(c2, frag3.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[1], frag3.bead(2).unwrap()).unwrap();

        // c2 = [-, C, -] and c3 = [-, -, G] are compatible
        assert!(ws.merge_compatible(c2).unwrap());
        assert!(ws.column(c3).unwrap().base_count.is_null());
        assert_eq!(ws.column(c2).unwrap().base_count.get(b'C'), 1);
        assert_eq!(ws.column(c2).unwrap().base_count.get(b'G'), 1);

        ws.remove_null_column(c3).unwrap();
        assert_eq!(ws.column_order(mid).unwrap().len(), 3);
        for (f, expected) in [(f1, b"A-T".to_vec()), (f2, b"ACT".to_vec()), (f3, b"AGT".to_vec())] {
            let chain: Vec<u8> = ws.fragment_beads(f).unwrap().iter().map(|&b| ws.bead_char(b).unwrap()).collect();
            assert_eq!(chain, expected);
        }
    }
}
