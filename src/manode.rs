
/*!
Operations over a whole multi-alignment node: seeding, refreshing the calls, locating variable regions,
merging compatible columns, and extracting the final consensus and fragment placements.

# Example usage
```rust
use abacus_con::base_call::CallMode;
use abacus_con::workspace::{ConsensusWorkspace, FragmentKind};

let mut workspace = ConsensusWorkspace::default();
let fid = workspace.append_fragment(1, FragmentKind::Read, b"ACGT", &[30; 4], false).unwrap();
let mid = workspace.create_manode(1);
workspace.seed_with_fragment(mid, fid, CallMode::Promote).unwrap();
let (consensus, quality) = workspace.consensus(mid).unwrap();
assert_eq!(consensus, b"ACGT".to_vec());
assert_eq!(quality, b"NNNN".to_vec());
```
*/

use log::{debug, trace};
use rustc_hash::FxHashMap as HashMap;
use simple_error::bail;

use crate::allele::smoothen_variation;
use crate::base_call::CallMode;
use crate::cns_config::ZERO_PLUS;
use crate::workspace::{BeadId, ConsensusWorkspace, FragmentId, FragmentKind, ManodeId};

/// A region where the reads split into two alleles
#[derive(Clone, Debug, PartialEq)]
pub struct VarRegion {
    /// First gapped column of the region
    pub bgn: usize,
    /// One past the last gapped column of the region
    pub end: usize,
    /// Number of reads covering the region
    pub num_reads: usize,
    /// Number of reads assigned to the best allele
    pub nr_best_allele: usize,
    pub num_alleles: usize,
    /// Quality support of the other allele relative to the best one
    pub ratio: f64,
    /// Smoothing window used to detect the region
    pub window_size: usize,
    pub var_length: usize,
    /// Calls of the best allele, one per column
    pub best_sequence: Vec<u8>,
    /// Calls of the other allele, one per column
    pub alt_sequence: Vec<u8>
}

/// Summary counts gathered while refreshing a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlignmentStats {
    pub num_columns: usize,
    /// Columns called as a gap
    pub num_gaps: usize,
    /// Places where a read goes from a base into a gap
    pub num_runs_of_gaps: usize,
    /// Columns where the two alleles are called differently
    pub aa_mismatches: usize,
    /// Read bases that disagree with the call of their own allele
    pub fa_mismatches: usize
}

impl AlignmentStats {
    /// Adds the counts of another set of statistics to this one
    pub fn add(&mut self, other: &AlignmentStats) {
        self.num_columns += other.num_columns;
        self.num_gaps += other.num_gaps;
        self.num_runs_of_gaps += other.num_runs_of_gaps;
        self.aa_mismatches += other.aa_mismatches;
        self.fa_mismatches += other.fa_mismatches;
    }
}

/// Everything a refresh produces besides the updated calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshOutcome {
    pub variants: Vec<VarRegion>,
    pub stats: AlignmentStats
}

/// Final placement of one fragment in the consensus
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub ident: u64,
    pub kind: FragmentKind,
    /// Gapped start, larger than `gapped_end` when the fragment is reverse complemented
    pub gapped_bgn: usize,
    pub gapped_end: usize,
    /// Ungapped start, larger than `ungapped_end` when the fragment is reverse complemented
    pub ungapped_bgn: usize,
    pub ungapped_end: usize,
    pub complement: bool,
    pub contained: bool,
    /// Ungapped fragment offsets before which a gap was inserted
    pub deltas: Vec<usize>
}

impl ConsensusWorkspace {
    /// Builds the columns of an empty node from a single fragment, one column per base.
    /// # Arguments
    /// * `mid` - the node, which must be empty
    /// * `fid` - the seed fragment
    /// * `mode` - how the initial calls are made
    /// # Errors
    /// * if the node already has columns
    /// * if the fragment is already aligned
    pub fn seed_with_fragment(&mut self, mid: ManodeId, fid: FragmentId, mode: CallMode) -> Result<(), Box<dyn std::error::Error>> {
        if self.manode(mid)?.first.is_some() {
            bail!("internal error: node {mid:?} is already seeded");
        }
        let beads = self.fragment_beads(fid)?;
        let mut cid = self.first_column(mid, beads[0])?;
        for &bid in beads[1..].iter() {
            cid = self.column_append(cid, bid)?;
        }
        self.fragment_mut(fid)?.manode = Some(mid);
        self.refresh(mid, mode, false)?;
        Ok(())
    }

    /// Recalls every column of a node, renumbers the columns, and checks the column links.
    /// With allele splitting enabled and a probabilistic mode, variable regions are located and
    /// (if `make_variants` is set) recalled from the best allele and reported.
    /// # Arguments
    /// * `mid` - the node to refresh
    /// * `mode` - the call mode used for every column
    /// * `make_variants` - if true, variable regions are split into alleles and reported
    /// # Errors
    /// * if a column link is inconsistent
    pub fn refresh(&mut self, mid: ManodeId, mode: CallMode, make_variants: bool) -> Result<RefreshOutcome, Box<dyn std::error::Error>> {
        let columns = self.column_order(mid)?;
        let mut outcome = RefreshOutcome::default();
        let mut var = Vec::with_capacity(columns.len());
        let mut prev_bases: HashMap<FragmentId, u8> = HashMap::default();

        for (index, &cid) in columns.iter().enumerate() {
            let call = self.base_call(cid, mode, None, None)?;
            var.push(call.var);

            let column = self.column_mut(cid)?;
            column.ma_index = index as i64;
            column.manode = Some(mid);
            if index > 0 && column.prev != Some(columns[index - 1]) {
                bail!("internal error: column {cid:?} does not link back to {:?}", columns[index - 1]);
            }

            // a read that had a base in the previous column and a gap here starts a run of gaps
            let mut bases: HashMap<FragmentId, u8> = HashMap::default();
            for bid in self.column_beads(cid)? {
                let Some(fid) = self.bead(bid)?.frag else {
                    continue;
                };
                if self.fragment(fid)?.kind.is_read() {
                    let b = self.bead_char(bid)?;
                    if b == b'-' && prev_bases.get(&fid).map(|&p| p != b'-').unwrap_or(false) {
                        outcome.stats.num_runs_of_gaps += 1;
                    }
                    bases.insert(fid, b);
                }
            }
            prev_bases = bases;
            if call.base == b'-' {
                outcome.stats.num_gaps += 1;
            }
        }
        outcome.stats.num_columns = columns.len();
        self.manode_mut(mid)?.columns = columns.clone();

        let split_active = self.config().split_alleles && self.config().max_alleles >= 2;
        if !split_active || mode != CallMode::Probabilistic || !make_variants {
            return Ok(outcome);
        }

        let window = self.config().smooth_window;
        let svar = smoothen_variation(&var, window);
        let len = columns.len();
        let mut i = 0;
        while i < len {
            if svar[i] == 0.0 {
                i += 1;
                continue;
            }
            let mut beg = i;
            while beg < len && var[beg].abs() < ZERO_PLUS {
                beg += 1;
            }
            let mut vend = i;
            while vend < len && svar[vend] > ZERO_PLUS {
                vend += 1;
            }
            let next = vend.max(i + 1);
            let mut end = vend.min(len - 1);
            while end > beg && var[end] < ZERO_PLUS {
                end -= 1;
            }
            if beg >= len || beg > end || var[beg].abs() < ZERO_PLUS {
                i = next;
                continue;
            }

            let region = &columns[beg..=end];
            let mut clusters = self.collect_read_ids(region)?;
            for &cid in region.iter() {
                self.populate_dist_matrix(cid, &mut clusters)?;
            }
            clusters.cluster();
            let best = clusters.best_allele();
            let alt = 1 - best;

            let mut best_sequence = Vec::with_capacity(region.len());
            let mut alt_sequence = Vec::with_capacity(region.len());
            for &cid in region.iter() {
                let abase = self.base_call(cid, CallMode::Probabilistic, Some(&clusters), Some(alt))?.base;
                let cbase = self.base_call(cid, CallMode::Probabilistic, Some(&clusters), Some(best))?.base;
                if cbase != abase {
                    outcome.stats.aa_mismatches += 1;
                }
                for &fid in clusters.reads().iter() {
                    let Some(bid) = self.column_bead_of(cid, fid)? else {
                        continue;
                    };
                    let b = self.bead_char(bid)?;
                    let expected = if clusters.allele_of(fid) == Some(best) { cbase } else { abase };
                    if b != expected {
                        outcome.stats.fa_mismatches += 1;
                    }
                }
                best_sequence.push(cbase);
                alt_sequence.push(abase);
            }

            trace!("Variable region {beg}..={end} with {} reads", clusters.num_reads());
            outcome.variants.push(VarRegion {
                bgn: beg,
                end: end + 1,
                num_reads: clusters.num_reads(),
                nr_best_allele: clusters.nr_best_allele(),
                num_alleles: 2,
                ratio: clusters.ratio(),
                window_size: window,
                var_length: end + 1 - beg,
                best_sequence,
                alt_sequence
            });
            i = next;
        }
        debug!("Refresh of node {mid:?} found {} variable regions", outcome.variants.len());
        Ok(outcome)
    }

    /// Returns the gapped consensus and its quality string (`'0' + qv` per column).
    /// # Errors
    /// * if the column list is broken
    pub fn consensus(&self, mid: ManodeId) -> Result<(Vec<u8>, Vec<u8>), Box<dyn std::error::Error>> {
        let columns = self.column_order(mid)?;
        let mut sequence = Vec::with_capacity(columns.len());
        let mut quality = Vec::with_capacity(columns.len());
        for cid in columns {
            let (b, q) = self.column_call(cid)?;
            sequence.push(b);
            quality.push(b'0' + q);
        }
        Ok((sequence, quality))
    }

    /// Returns the consensus with gap columns removed, along with the numeric call qualities.
    /// # Errors
    /// * if the column list is broken
    pub fn ungapped_consensus(&self, mid: ManodeId) -> Result<(Vec<u8>, Vec<u8>), Box<dyn std::error::Error>> {
        let mut sequence = vec![];
        let mut quality = vec![];
        for cid in self.column_order(mid)? {
            let (b, q) = self.column_call(cid)?;
            if b != b'-' {
                sequence.push(b);
                quality.push(q);
            }
        }
        Ok((sequence, quality))
    }

    /// Lists, for each gap bead inside the fragment, the number of fragment bases that precede it.
    /// Gaps after the last base are not reported.
    /// # Errors
    /// * if the fragment chain is broken
    pub fn fragment_deltas(&self, fid: FragmentId) -> Result<Vec<usize>, Box<dyn std::error::Error>> {
        let length = self.fragment(fid)?.length();
        let mut deltas = vec![];
        let mut index = 0;
        for bid in self.fragment_beads(fid)? {
            if index >= length {
                break;
            }
            if self.bead_char(bid)? == b'-' {
                deltas.push(index);
            } else {
                index += 1;
            }
        }
        Ok(deltas)
    }

    /// Returns the placement of every live fragment of a node.
    /// The column indices must be current, i.e. this should follow a refresh.
    /// # Errors
    /// * if a fragment bead is not aligned to a column of this node
    pub fn positions(&self, mid: ManodeId) -> Result<Vec<Placement>, Box<dyn std::error::Error>> {
        // ungapped offset of every column
        let columns = self.column_order(mid)?;
        let mut ungapped = Vec::with_capacity(columns.len() + 1);
        let mut count = 0;
        for &cid in columns.iter() {
            ungapped.push(count);
            if self.column_call(cid)?.0 != b'-' {
                count += 1;
            }
        }
        ungapped.push(count);

        let mut ret = vec![];
        for fid in self.fragment_ids() {
            let frag = self.fragment(fid)?;
            if frag.deleted || frag.manode != Some(mid) {
                continue;
            }
            let (Some(first), Some(last)) = (frag.bead(0), frag.last_bead()) else {
                continue;
            };
            let column_index = |bid: BeadId| -> Result<usize, Box<dyn std::error::Error>> {
                let Some(cid) = self.bead(bid)?.column else {
                    bail!("internal error: bead {bid:?} of fragment {} is not aligned", frag.ident);
                };
                let index = self.column(cid)?.ma_index;
                if index < 0 || index as usize >= columns.len() || columns[index as usize] != cid {
                    bail!("internal error: column {cid:?} has a stale index");
                }
                Ok(index as usize)
            };
            let bgn = column_index(first)?;
            let end = column_index(last)? + 1;
            let (ubgn, uend) = (ungapped[bgn], ungapped[end]);
            let (gapped_bgn, gapped_end, ungapped_bgn, ungapped_end) = if frag.complement {
                (end, bgn, uend, ubgn)
            } else {
                (bgn, end, ubgn, uend)
            };
            ret.push(Placement {
                ident: frag.ident,
                kind: frag.kind,
                gapped_bgn,
                gapped_end,
                ungapped_bgn,
                ungapped_end,
                complement: frag.complement,
                contained: frag.contained,
                deltas: self.fragment_deltas(fid)?
            });
        }
        Ok(ret)
    }

    /// Merges every pair of compatible neighboring columns, drops the emptied columns, and refreshes the node.
    /// # Arguments
    /// * `mid` - the node to refine
    /// * `make_variants` - passed on to the final refresh
    /// # Errors
    /// * if any link is broken
    pub fn merge_refine(&mut self, mid: ManodeId, make_variants: bool) -> Result<RefreshOutcome, Box<dyn std::error::Error>> {
        let mut removed = 0;
        let mut current = self.manode(mid)?.first;
        while let Some(cid) = current {
            if self.merge_compatible(cid)? {
                while let Some(nid) = self.column(cid)?.next {
                    if !self.column(nid)?.base_count.is_null() {
                        break;
                    }
                    self.remove_null_column(nid)?;
                    removed += 1;
                    self.merge_compatible(cid)?;
                }
            }
            current = self.column(cid)?.next;
        }
        debug!("Merge refinement of node {mid:?} removed {removed} columns");
        self.refresh(mid, CallMode::Probabilistic, make_variants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cns_config::ConsensusConfigBuilder;

    /// Stacks equal-length reads into the columns of the first one
    fn stacked(ws: &mut ConsensusWorkspace, reads: &[(&[u8], u8)]) -> (ManodeId, Vec<FragmentId>) {
        let mid = ws.create_manode(1);
        let mut fids = vec![];
        for (i, &(seq, qv)) in reads.iter().enumerate() {
            let fid = ws.append_fragment(i as u64, FragmentKind::Read, seq, &vec![qv; seq.len()], false).unwrap();
            if i == 0 {
                ws.seed_with_fragment(mid, fid, CallMode::Promote).unwrap();
            } else {
                let columns = ws.column_order(mid).unwrap();
                for (p, &cid) in columns.iter().enumerate() {
                    let bid = ws.fragment(fid).unwrap().bead(p).unwrap();
                    ws.align_bead(cid, bid).unwrap();
                }
                ws.fragment_mut(fid).unwrap().manode = Some(mid);
            }
            fids.push(fid);
        }
        (mid, fids)
    }

    #[test]
    fn test_seed_and_consensus() {
        let mut ws = ConsensusWorkspace::default();
        let fid = ws.append_fragment(5, FragmentKind::Read, b"ACGT", &[10, 20, 30, 40], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, fid, CallMode::Promote).unwrap();
        let (seq, qual) = ws.consensus(mid).unwrap();
        assert_eq!(seq, b"ACGT".to_vec());
        assert_eq!(qual, b":DNX".to_vec());
        assert_eq!(ws.manode(mid).unwrap().columns.len(), 4);
        // seeding twice is an error
        assert!(ws.seed_with_fragment(mid, fid, CallMode::Promote).is_err());
    }

    #[test]
    fn test_refresh_stats() {
        let mut ws = ConsensusWorkspace::default();
        let (mid, _fids) = stacked(&mut ws, &[(b"ACGTA", 30), (b"ACGTA", 30)]);
        let columns = ws.column_order(mid).unwrap();

        // a third read with a run of two gaps
        let fid = ws.append_fragment(9, FragmentKind::Read, b"ATA", &[30; 3], false).unwrap();
        let frag = ws.fragment(fid).unwrap().clone();
        ws.align_bead(columns[0], frag.bead(0).unwrap()).unwrap();
        let g1 = ws.append_gap_bead(frag.bead(0).unwrap()).unwrap();
        ws.align_bead(columns[1], g1).unwrap();
        let g2 = ws.append_gap_bead(g1).unwrap();
        ws.align_bead(columns[2], g2).unwrap();
        ws.align_bead(columns[3], frag.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[4], frag.bead(2).unwrap()).unwrap();

        let outcome = ws.refresh(mid, CallMode::Probabilistic, false).unwrap();
        assert_eq!(outcome.stats.num_columns, 5);
        assert_eq!(outcome.stats.num_gaps, 0);
        assert_eq!(outcome.stats.num_runs_of_gaps, 1);
        assert!(outcome.variants.is_empty());
        assert_eq!(ws.consensus(mid).unwrap().0, b"ACGTA".to_vec());
        assert_eq!(ws.fragment_deltas(fid).unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_variant_region() {
        let config = ConsensusConfigBuilder::default().split_alleles(true).build().unwrap();
        let mut ws = ConsensusWorkspace::new(config);
        let (mid, _fids) = stacked(&mut ws, &[
            (b"ACGTA", 40),
            (b"ACGTA", 40),
            (b"ACGTA", 40),
            (b"ACTTA", 20),
            (b"ACTTA", 20),
            (b"ACTTA", 20)
        ]);
        let outcome = ws.refresh(mid, CallMode::Probabilistic, true).unwrap();
        assert_eq!(outcome.variants.len(), 1);
        let region = &outcome.variants[0];
        assert_eq!((region.bgn, region.end), (2, 3));
        assert_eq!(region.num_reads, 6);
        assert_eq!(region.nr_best_allele, 3);
        assert_eq!(region.var_length, 1);
        assert_eq!(region.best_sequence, b"G".to_vec());
        assert_eq!(region.alt_sequence, b"T".to_vec());
        assert!((region.ratio - 0.5).abs() < 1e-12);
        assert_eq!(outcome.stats.aa_mismatches, 1);
        assert_eq!(outcome.stats.fa_mismatches, 0);
        assert_eq!(ws.consensus(mid).unwrap().0, b"ACGTA".to_vec());

        // without variants requested nothing is reported
        let outcome = ws.refresh(mid, CallMode::Probabilistic, false).unwrap();
        assert!(outcome.variants.is_empty());
    }

    #[test]
    fn test_positions() {
        let mut ws = ConsensusWorkspace::default();
        let (mid, _fids) = stacked(&mut ws, &[(b"ACGTA", 30)]);
        let columns = ws.column_order(mid).unwrap();
        // a reverse complemented read covering columns 1..4, stored as CGT
        let fid = ws.append_fragment(7, FragmentKind::Read, b"ACG", &[30; 3], true).unwrap();
        for (p, &cid) in columns[1..4].iter().enumerate() {
            let bid = ws.fragment(fid).unwrap().bead(p).unwrap();
            ws.align_bead(cid, bid).unwrap();
        }
        ws.fragment_mut(fid).unwrap().manode = Some(mid);
        ws.refresh(mid, CallMode::Plurality, false).unwrap();

        let placements = ws.positions(mid).unwrap();
        assert_eq!(placements.len(), 2);
        let p = placements.iter().find(|p| p.ident == 7).unwrap();
        assert!(p.complement);
        assert_eq!((p.gapped_bgn, p.gapped_end), (4, 1));
        assert_eq!((p.ungapped_bgn, p.ungapped_end), (4, 1));
        assert!(p.deltas.is_empty());
    }

    #[test]
    fn test_merge_refine() {
        let mut ws = ConsensusWorkspace::default();
        let (mid, fids) = stacked(&mut ws, &[(b"AT", 30)]);
        let columns = ws.column_order(mid).unwrap();

        // A C T and A G T inserted as separate columns
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
        ws.column_append(c2, frag3.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[1], frag3.bead(2).unwrap()).unwrap();
        for f in [f2, f3] {
            ws.fragment_mut(f).unwrap().manode = Some(mid);
        }
        assert_eq!(ws.column_order(mid).unwrap().len(), 4);

        let outcome = ws.merge_refine(mid, false).unwrap();
        assert_eq!(outcome.stats.num_columns, 3);
        assert_eq!(ws.fragment_deltas(fids[0]).unwrap(), vec![1]);
        assert!(ws.fragment_deltas(f2).unwrap().is_empty());
        assert!(ws.fragment_deltas(f3).unwrap().is_empty());
    }
}
