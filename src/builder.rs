
/*!
Top-level construction of multi-alignments.
Fragments are placed one at a time against an anchor that was already placed, using the layout positions to estimate the overlap.
Once everything is placed the alignment goes through the abacus refinement passes, and the consensus and final positions are read out.
Typical usage:
```
use abacus_con::aligner::BandedAligner;
use abacus_con::builder::{FragmentInput, MultiAlignBuilder};
use abacus_con::cns_config::ConsensusConfigBuilder;

let config = ConsensusConfigBuilder::default()
    .dp_min_length(4)
    .dp_thin_min_length(4)
    .dp_erate(0.25)
    .build()
    .unwrap();
let mut builder = MultiAlignBuilder::with_config(BandedAligner::default(), config).unwrap();
let fragments = vec![
    FragmentInput::new(1, b"ACGTTGCA".to_vec(), vec![30; 8], 0, 8),
    FragmentInput::new(2, b"TTGCAAGG".to_vec(), vec![30; 8], 3, 11)
];
let result = builder.build_unitig(7, &fragments).unwrap();
assert_eq!(result.consensus, b"ACGTTGCAAGG".to_vec());
```
*/

use log::{debug, warn};
use rustc_hash::FxHashMap as HashMap;
use simple_error::bail;

use crate::aligner::{BandedAligner, PairwiseAligner};
use crate::alignment_trace::{AlignmentTrace, OverlapKind};
use crate::apply_alignment::AlignTarget;
use crate::base_call::CallMode;
use crate::cns_config::{AlignmentContext, ConsensusConfig};
use crate::manode::{AlignmentStats, Placement, RefreshOutcome, VarRegion};
use crate::refine::RefineOutcome;
use crate::window::RefineLevel;
use crate::workspace::{Component, ConsensusWorkspace, FragmentId, FragmentKind, ManodeId, UnitigKind};

/// A sequence to place into a unitig
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentInput {
    pub ident: u64,
    pub kind: FragmentKind,
    /// Bases in forward orientation
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    /// Estimated layout start, larger than `end` when the fragment is reverse complemented
    pub bgn: usize,
    pub end: usize,
    /// Identifier of the fragment this one is contained in
    pub container: Option<u64>
}

impl FragmentInput {
    /// Creates an uncontained read.
    pub fn new(ident: u64, sequence: Vec<u8>, quality: Vec<u8>, bgn: usize, end: usize) -> FragmentInput {
        FragmentInput {
            ident,
            kind: FragmentKind::Read,
            sequence,
            quality,
            bgn,
            end,
            container: None
        }
    }
}

/// A unitig to place into a contig, together with the reads it was built from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitigInput {
    pub ident: u64,
    pub unitig_kind: UnitigKind,
    /// Unitig consensus in forward orientation, ungapped
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    /// Estimated layout start in the contig, larger than `end` when reverse complemented
    pub bgn: usize,
    pub end: usize,
    /// Reads of the unitig, positioned in ungapped unitig coordinates
    pub components: Vec<Component>
}

/// A fragment with a stored placement against a gapped consensus
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeltaInput {
    pub ident: u64,
    pub kind: FragmentKind,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    /// Gapped start in the consensus, larger than `end` when reverse complemented
    pub bgn: usize,
    pub end: usize,
    pub contained: bool,
    /// For each gap inside the fragment, the number of fragment bases before it
    pub deltas: Vec<usize>
}

/// Everything produced by one build
#[derive(Clone, Debug, PartialEq)]
pub struct MultiAlignResult {
    /// The node holding the alignment, valid in the builder's workspace until the next build
    pub manode: ManodeId,
    /// Gapped consensus
    pub consensus: Vec<u8>,
    /// Quality characters of the gapped consensus
    pub quality: Vec<u8>,
    /// Placement of every read and guide
    pub placements: Vec<Placement>,
    /// Placement of every unitig, only filled for contigs
    pub unitig_placements: Vec<Placement>,
    /// Variable regions found in the final refresh, requires allele splitting
    pub variants: Vec<VarRegion>,
    /// Set if any fragment had to be placed without an overlap
    pub forced: bool,
    pub stats: AlignmentStats,
    /// Outcome of each refinement pass in the order they ran
    pub refinement: Vec<(RefineLevel, RefineOutcome)>
}

/// Ungapped layout interval with `bgn <= end`
#[derive(Clone, Copy, Debug, PartialEq)]
struct Interval {
    bgn: i64,
    end: i64
}

impl Interval {
    fn new(bgn: usize, end: usize) -> Interval {
        Interval {
            bgn: bgn.min(end) as i64,
            end: bgn.max(end) as i64
        }
    }
}

/// Builds unitig and contig multi-alignments with a pairwise aligner.
/// The workspace is reset at the start of every build, so only the latest result can be inspected through [`MultiAlignBuilder::workspace`].
#[derive(Debug)]
pub struct MultiAlignBuilder<A: PairwiseAligner> {
    workspace: ConsensusWorkspace,
    aligner: A
}

impl Default for MultiAlignBuilder<BandedAligner> {
    fn default() -> Self {
        Self::new(BandedAligner::default(), ConsensusConfig::default())
    }
}

impl<A: PairwiseAligner> MultiAlignBuilder<A> {
    /// Creates a builder without checking the config.
    pub fn new(aligner: A, config: ConsensusConfig) -> MultiAlignBuilder<A> {
        MultiAlignBuilder {
            workspace: ConsensusWorkspace::new(config),
            aligner
        }
    }

    /// Creates a builder.
    /// # Arguments
    /// * `aligner` - the pairwise aligner used to find overlaps
    /// * `config` - the configuration for every build
    /// # Errors
    /// * if the config is invalid
    pub fn with_config(aligner: A, config: ConsensusConfig) -> Result<MultiAlignBuilder<A>, Box<dyn std::error::Error>> {
        Ok(MultiAlignBuilder {
            workspace: ConsensusWorkspace::with_config(config)?,
            aligner
        })
    }

    /// Builds the consensus of a unitig from reads sorted by layout start.
    /// Each fragment is aligned to the consensus at its anchor: the container if it is contained, otherwise the
    /// nearest earlier fragment that is not contained. Anchors that fail are skipped in favor of earlier ones.
    /// # Arguments
    /// * `ident` - identifier of the unitig
    /// * `fragments` - the fragments, sorted by the lower of `bgn` and `end`
    /// # Errors
    /// * if there are no fragments, or a fragment sequence is invalid
    /// * if a fragment overlaps no earlier fragment and forced placement is disabled
    /// * if the alignment graph is inconsistent
    pub fn build_unitig(&mut self, ident: u64, fragments: &[FragmentInput]) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        if fragments.is_empty() {
            bail!("unitig {ident} has no fragments");
        }
        self.workspace.reset();

        let mut fids = Vec::with_capacity(fragments.len());
        let mut offsets = Vec::with_capacity(fragments.len());
        for f in fragments.iter() {
            let fid = self.workspace.append_fragment(f.ident, f.kind, &f.sequence, &f.quality, f.bgn > f.end)?;
            let frag = self.workspace.fragment_mut(fid)?;
            frag.container = f.container;
            frag.contained = f.container.is_some();
            fids.push(fid);
            offsets.push(Interval::new(f.bgn, f.end));
        }

        let mid = self.workspace.create_manode(ident);
        self.workspace.seed_with_fragment(mid, fids[0], CallMode::Plurality)?;
        let mut forced = false;
        for i in 1..fids.len() {
            forced |= self.place_in_unitig(&fids, &offsets, i)?;
        }
        self.workspace.refresh(mid, CallMode::Plurality, false)?;

        let (outcome, refinement) = if forced {
            warn!("Unitig {ident} contains forced placements, skipping refinement");
            (self.workspace.refresh(mid, CallMode::Probabilistic, true)?, vec![])
        } else {
            let mut refinement = vec![];
            for level in [RefineLevel::Smooth, RefineLevel::Polyx] {
                refinement.push((level, self.workspace.abacus_refine(mid, level)?));
                self.workspace.merge_refine(mid, false)?;
            }
            refinement.push((RefineLevel::Indel, self.workspace.abacus_refine(mid, RefineLevel::Indel)?));
            (self.workspace.merge_refine(mid, true)?, refinement)
        };
        self.finish(mid, outcome, forced, refinement)
    }

    /// Places fragment `i` of a unitig, returns true if the placement was forced.
    fn place_in_unitig(&mut self, fids: &[FragmentId], offsets: &[Interval], i: usize) -> Result<bool, Box<dyn std::error::Error>> {
        let config = self.workspace.config().clone();
        let bfid = fids[i];
        let (bident, container, contained) = {
            let frag = self.workspace.fragment(bfid)?;
            (frag.ident, frag.container, frag.contained)
        };

        let mut align_to = i as i64 - 1;
        let mut estimate: Option<(FragmentId, i64)> = None;
        let placed = loop {
            if contained {
                while align_to >= 0 {
                    let afrag = self.workspace.fragment(fids[align_to as usize])?;
                    if Some(afrag.ident) == container && afrag.container != Some(afrag.ident) {
                        break;
                    }
                    align_to -= 1;
                }
            } else {
                while align_to > 0 && self.workspace.fragment(fids[align_to as usize])?.contained {
                    align_to -= 1;
                }
            }
            if align_to < 0 {
                if contained && estimate.is_none() {
                    let cident = container.unwrap_or(bident);
                    if !config.allow_forced {
                        bail!("fragment {bident} is contained in {cident}, but no container is found upstream");
                    }
                    warn!("Fragment {bident} is contained in {cident}, but no container is found upstream");
                    estimate = Some((fids[0], offsets[i].bgn - offsets[0].bgn));
                }
                break None;
            }

            let a = align_to as usize;
            let afid = fids[a];
            let ahang = offsets[i].bgn - offsets[a].bgn;
            let ovl = offsets[a].end - offsets[i].bgn;
            estimate.get_or_insert((afid, ahang));
            if (ahang < config.neg_ahang_cutoff && !config.allow_negative_hang) || ovl < 0 {
                align_to -= 1;
                continue;
            }

            let target = self.consensus_target(afid)?;
            match self.workspace.get_alignment_trace(&self.aligner, target, bfid, ahang)? {
                Some(trace) => break Some((target, trace)),
                None => {
                    debug!("Fragment {bident} does not align to anchor {:?}, trying an earlier one", afid);
                    align_to -= 1;
                }
            }
        };

        match placed {
            Some((target, trace)) => {
                self.apply_trace(target, bfid, &trace, config.mark_contains)?;
                Ok(false)
            },
            None => {
                self.force_placement(bfid, estimate, config.allow_forced)?;
                Ok(true)
            }
        }
    }

    /// Builds the consensus of a contig from unitigs sorted by layout start.
    /// Unitigs are aligned to each other, and the reads of each unitig are aligned to it right after it is placed.
    /// # Arguments
    /// * `ident` - identifier of the contig
    /// * `unitigs` - the unitigs, sorted by the lower of `bgn` and `end`
    /// # Errors
    /// * if there are no unitigs, or a sequence is invalid
    /// * if a unitig overlaps no earlier unitig and forced placement is disabled
    /// * if the alignment graph is inconsistent
    pub fn build_contig(&mut self, ident: u64, unitigs: &[UnitigInput]) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        if unitigs.is_empty() {
            bail!("contig {ident} has no unitigs");
        }
        self.workspace.reset();

        let mut fids = Vec::with_capacity(unitigs.len());
        let mut offsets = Vec::with_capacity(unitigs.len());
        for u in unitigs.iter() {
            let fid = self.workspace.append_fragment(u.ident, FragmentKind::Unitig, &u.sequence, &u.quality, u.bgn > u.end)?;
            let frag = self.workspace.fragment_mut(fid)?;
            frag.unitig_kind = u.unitig_kind;
            frag.components = u.components.clone();
            fids.push(fid);
            offsets.push(Interval::new(u.bgn, u.end));
        }

        let mid = self.workspace.create_manode(ident);
        let mut placed: HashMap<u64, (FragmentId, i64)> = HashMap::default();
        self.workspace.seed_with_fragment(mid, fids[0], CallMode::Plurality)?;
        self.place_components(fids[0], &mut placed)?;
        let mut forced = false;
        for i in 1..fids.len() {
            forced |= self.place_in_contig(&fids, &offsets, i)?;
            self.place_components(fids[i], &mut placed)?;
        }
        self.workspace.refresh(mid, CallMode::Plurality, false)?;

        let mut refinement = vec![];
        refinement.push((RefineLevel::Smooth, self.workspace.abacus_refine(mid, RefineLevel::Smooth)?));
        self.workspace.merge_refine(mid, false)?;
        refinement.push((RefineLevel::Polyx, self.workspace.abacus_refine(mid, RefineLevel::Polyx)?));
        self.workspace.refresh(mid, CallMode::Plurality, false)?;
        refinement.push((RefineLevel::Indel, self.workspace.abacus_refine(mid, RefineLevel::Indel)?));
        let outcome = self.workspace.merge_refine(mid, true)?;
        self.finish(mid, outcome, forced, refinement)
    }

    /// Places unitig `i` of a contig, returns true if the placement was forced.
    /// Contained unitigs are skipped as anchors on the first sweep and tried on a second one.
    fn place_in_contig(&mut self, fids: &[FragmentId], offsets: &[Interval], i: usize) -> Result<bool, Box<dyn std::error::Error>> {
        let config = self.workspace.config().clone();
        let bfid = fids[i];
        let mut align_to = i as i64 - 1;
        let mut try_contained = false;
        let mut estimate: Option<(FragmentId, i64)> = None;
        let placed = loop {
            while align_to > 0 && !try_contained && self.workspace.fragment(fids[align_to as usize])?.contained {
                align_to -= 1;
            }
            if align_to < 0 {
                break None;
            }

            let a = align_to as usize;
            let afid = fids[a];
            let ovl = offsets[a].end - offsets[i].bgn;
            if ovl <= 0 {
                align_to -= 1;
                continue;
            }
            let ahang = offsets[i].bgn - offsets[a].bgn;
            estimate.get_or_insert((afid, ahang));
            let target = AlignTarget::Fragment(afid);
            if let Some(trace) = self.workspace.get_alignment_trace(&self.aligner, target, bfid, ahang)? {
                break Some((target, trace));
            }
            align_to -= 1;
            if align_to < 0 && !try_contained {
                try_contained = true;
                align_to = i as i64 - 1;
            }
        };

        match placed {
            Some((target, trace)) => {
                self.apply_trace(target, bfid, &trace, config.mark_contains)?;
                Ok(false)
            },
            None => {
                self.force_placement(bfid, estimate, config.allow_forced)?;
                Ok(true)
            }
        }
    }

    /// Aligns the reads of a placed unitig to it, or to their container when it was placed already.
    /// Reads that do not align are dropped from the contig.
    /// # Arguments
    /// * `ufid` - the unitig
    /// * `placed` - maps placed read identifiers to their fragment and start within the unitig
    fn place_components(&mut self, ufid: FragmentId, placed: &mut HashMap<u64, (FragmentId, i64)>) -> Result<(), Box<dyn std::error::Error>> {
        let (uident, ucomplement, ulen, components) = {
            let unitig = self.workspace.fragment(ufid)?;
            (unitig.ident, unitig.complement, unitig.length() as i64, unitig.components.clone())
        };
        for c in components.iter() {
            let bcomplement = c.bgn > c.end;
            let bfid = self.workspace.append_fragment(c.ident, c.kind, &c.sequence, &c.quality, bcomplement != ucomplement)?;
            let frag = self.workspace.fragment_mut(bfid)?;
            frag.container = c.container;
            frag.contained = c.container.is_some();

            // start of the read in the unitig as it is stored
            let (lo, hi) = (c.bgn.min(c.end) as i64, c.bgn.max(c.end) as i64);
            let start = if ucomplement { ulen - hi } else { lo };
            let (afid, ahang) = match c.container.and_then(|id| placed.get(&id).copied()) {
                Some((cfid, cstart)) => (cfid, start - cstart),
                None => (ufid, start)
            };

            let target = AlignTarget::Fragment(afid);
            match self.workspace.get_alignment_trace(&self.aligner, target, bfid, ahang)? {
                Some(trace) => {
                    self.workspace.apply_alignment(target, bfid, trace.ahang, &trace.trace)?;
                    placed.insert(c.ident, (bfid, start));
                },
                None => {
                    warn!("Could not align fragment {} to unitig {uident} (estimated ahang {ahang}), ejecting it", c.ident);
                    self.workspace.fragment_mut(bfid)?.deleted = true;
                }
            };
        }
        Ok(())
    }

    /// Rebuilds an alignment from a gapped consensus and stored fragment deltas, without running the aligner.
    /// The consensus only provides the column layout, it is removed again once every fragment is in place.
    /// # Arguments
    /// * `ident` - identifier of the multi-alignment
    /// * `consensus` - the stored gapped consensus
    /// * `quality` - one quality value per consensus symbol
    /// * `fragments` - stored placements against the gapped consensus
    /// # Errors
    /// * if there are no fragments, or a sequence is invalid
    /// * if a placement does not fit the consensus
    pub fn rebuild_from_deltas(&mut self, ident: u64, consensus: &[u8], quality: &[u8], fragments: &[DeltaInput]) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        if fragments.is_empty() {
            bail!("multi-alignment {ident} has no fragments to rebuild");
        }
        self.workspace.reset();

        let template = self.workspace.append_template(ident, consensus, quality)?;
        let mid = self.workspace.create_manode(ident);
        self.workspace.seed_with_fragment(mid, template, CallMode::Promote)?;
        for f in fragments.iter() {
            let fid = self.workspace.append_fragment(f.ident, f.kind, &f.sequence, &f.quality, f.bgn > f.end)?;
            self.workspace.fragment_mut(fid)?.contained = f.contained;
            self.workspace.apply_imp_alignment(template, fid, f.bgn.min(f.end), &f.deltas)?;
        }
        self.workspace.unalign_fragment(template)?;

        let mut removed = 0;
        for cid in self.workspace.column_order(mid)? {
            if self.workspace.column(cid)?.base_count.is_null() {
                self.workspace.remove_null_column(cid)?;
                removed += 1;
            }
        }
        debug!("Rebuilt {ident} from {} fragments, removed {removed} empty columns", fragments.len());

        let outcome = self.workspace.refresh(mid, CallMode::Probabilistic, true)?;
        self.finish(mid, outcome, false, vec![])
    }

    /// Merges already assembled multi-alignments into one by aligning their consensus sequences to each other.
    /// Alignments run in the merge context with negative hangs and public calls disabled, the builder config is
    /// restored afterwards. Each sequence is aligned to the nearest earlier one that is not contained, and
    /// the merged columns are called by plurality without further refinement.
    /// # Arguments
    /// * `ident` - identifier of the merged multi-alignment
    /// * `consensuses` - ungapped consensus sequences with their layout positions, sorted by the lower of `bgn` and `end`
    /// # Errors
    /// * if there are no sequences, or a sequence is invalid
    /// * if the layout positions of a sequence do not overlap its anchor
    /// * if a sequence does not align to its anchor
    pub fn merge(&mut self, ident: u64, consensuses: &[FragmentInput]) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        let saved = self.workspace.config().clone();
        {
            let config = self.workspace.config_mut();
            config.alignment_context = AlignmentContext::Merge;
            config.allow_negative_hang = false;
            config.call_public = false;
        }
        let result = self.merge_consensuses(ident, consensuses);
        *self.workspace.config_mut() = saved;
        result
    }

    fn merge_consensuses(&mut self, ident: u64, consensuses: &[FragmentInput]) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        if consensuses.is_empty() {
            bail!("merge {ident} has no multi-alignments");
        }
        self.workspace.reset();

        let mut fids = Vec::with_capacity(consensuses.len());
        let mut offsets = Vec::with_capacity(consensuses.len());
        for c in consensuses.iter() {
            let fid = self.workspace.append_fragment(c.ident, c.kind, &c.sequence, &c.quality, c.bgn > c.end)?;
            fids.push(fid);
            offsets.push(Interval::new(c.bgn, c.end));
        }

        let mid = self.workspace.create_manode(ident);
        self.workspace.seed_with_fragment(mid, fids[0], CallMode::Plurality)?;
        for i in 1..fids.len() {
            let bfid = fids[i];
            let mut align_to = i - 1;
            while align_to > 0 && self.workspace.fragment(fids[align_to])?.contained {
                align_to -= 1;
            }
            let afid = fids[align_to];
            let (aident, alen) = {
                let afrag = self.workspace.fragment(afid)?;
                (afrag.ident, afrag.length() as i64)
            };
            let (bident, blen) = {
                let bfrag = self.workspace.fragment(bfid)?;
                (bfrag.ident, bfrag.length() as i64)
            };

            let (a, b) = (offsets[align_to], offsets[i]);
            let ovl = a.end - b.bgn;
            if ovl <= 0 {
                bail!("positions of {aident} and {bident} do not overlap, cannot merge");
            }
            let ahang = if a.end > b.end {
                alen - blen - (a.end - b.end)
            } else {
                alen - ovl
            };

            let target = AlignTarget::Fragment(afid);
            let Some(trace) = self.workspace.get_alignment_trace(&self.aligner, target, bfid, ahang)? else {
                bail!("no overlap found between {aident} and {bident} (estimated ahang {ahang}), cannot merge");
            };
            self.apply_trace(target, bfid, &trace, true)?;
        }

        let outcome = self.workspace.refresh(mid, CallMode::Plurality, false)?;
        debug!("Merged {} multi-alignments into {ident}", consensuses.len());
        self.finish(mid, outcome, false, vec![])
    }

    /// Returns the call bead of the column holding the first base of an anchor.
    fn consensus_target(&self, afid: FragmentId) -> Result<AlignTarget, Box<dyn std::error::Error>> {
        let first = self.workspace.fragment(afid)?.first_bead();
        let Some(cid) = self.workspace.bead(first)?.column else {
            bail!("internal error: anchor fragment {afid:?} is not aligned");
        };
        Ok(AlignTarget::Consensus(self.workspace.column(cid)?.call))
    }

    fn apply_trace(&mut self, target: AlignTarget, bfid: FragmentId, trace: &AlignmentTrace, mark_contains: bool) -> Result<(), Box<dyn std::error::Error>> {
        if mark_contains && trace.overlap_kind == OverlapKind::Containment {
            self.workspace.fragment_mut(bfid)?.contained = true;
        }
        debug!("Placing fragment {} at ahang {} with {} indels ({:?})", self.workspace.fragment(bfid)?.ident, trace.ahang, trace.trace.len(), trace.overlap_kind);
        self.workspace.apply_alignment(target, bfid, trace.ahang, &trace.trace)?;
        Ok(())
    }

    /// Places a fragment against the nearest anchor at its layout offset, without indels.
    fn force_placement(&mut self, bfid: FragmentId, estimate: Option<(FragmentId, i64)>, allow_forced: bool) -> Result<(), Box<dyn std::error::Error>> {
        let bident = self.workspace.fragment(bfid)?.ident;
        let Some((afid, ahang)) = estimate else {
            bail!("no overlap found for fragment {bident}: no earlier fragment to align to");
        };
        let afrag = self.workspace.fragment(afid)?;
        if !allow_forced {
            bail!("no overlap found between fragment {} and fragment {bident} (estimated ahang {ahang})", afrag.ident);
        }
        let ahang = ahang.clamp(0, afrag.length() as i64);
        warn!("Forcing fragment {bident} onto fragment {} at ahang {ahang}", afrag.ident);
        self.workspace.apply_alignment(AlignTarget::Fragment(afid), bfid, ahang, &[])?;
        Ok(())
    }

    fn finish(&self, mid: ManodeId, outcome: RefreshOutcome, forced: bool, refinement: Vec<(RefineLevel, RefineOutcome)>) -> Result<MultiAlignResult, Box<dyn std::error::Error>> {
        let (consensus, quality) = self.workspace.consensus(mid)?;
        let (unitig_placements, placements): (Vec<Placement>, Vec<Placement>) = self.workspace.positions(mid)?
            .into_iter()
            .partition(|p| p.kind == FragmentKind::Unitig);
        Ok(MultiAlignResult {
            manode: mid,
            consensus,
            quality,
            placements,
            unitig_placements,
            variants: outcome.variants,
            forced,
            stats: outcome.stats,
            refinement
        })
    }

    // Getters
    pub fn workspace(&self) -> &ConsensusWorkspace {
        &self.workspace
    }

    pub fn aligner(&self) -> &A {
        &self.aligner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cns_config::ConsensusConfigBuilder;

    const TEMPLATE: &[u8] = b"ACGTTGCAAGGCTTACCGATGCATCGGATACCTGAAGTCC";

    fn short_read_config(allow_forced: bool) -> ConsensusConfig {
        ConsensusConfigBuilder::default()
            .dp_erate(0.25)
            .dp_min_length(4)
            .dp_thin_min_length(4)
            .allow_forced(allow_forced)
            .build()
            .unwrap()
    }

    fn builder(config: ConsensusConfig) -> MultiAlignBuilder<BandedAligner> {
        MultiAlignBuilder::with_config(BandedAligner::default(), config).unwrap()
    }

    fn read(ident: u64, seq: &[u8], bgn: usize, end: usize) -> FragmentInput {
        FragmentInput::new(ident, seq.to_vec(), vec![30; seq.len()], bgn, end)
    }

    #[test]
    fn test_single_insertion() {
        let mut builder = builder(short_read_config(false));
        let result = builder.build_unitig(1, &[read(1, b"ACGT", 0, 4), read(2, b"ACGGT", 0, 5)]).unwrap();
        assert!(!result.forced);
        assert_eq!(result.consensus.len(), 5);
        // one G against one gap is an even split, the lowest index tie break calls the gap
        let ungapped: Vec<u8> = result.consensus.iter().copied().filter(|&c| c != b'-').collect();
        assert_eq!(ungapped, b"ACGT".to_vec());
        assert_eq!(result.consensus.iter().filter(|&&c| c == b'-').count(), 1);
        assert!(result.consensus == b"AC-GT".to_vec() || result.consensus == b"ACG-T".to_vec());
        assert_eq!(result.placements.len(), 2);

        let ws = builder.workspace();
        let columns = ws.column_order(result.manode).unwrap();
        let gap_column = columns[result.consensus.iter().position(|&c| c == b'-').unwrap()];
        let counts = ws.column(gap_column).unwrap().base_count;
        assert_eq!((counts.get(b'G'), counts.get(b'-')), (1, 1));

        // only the shorter read carries the gap
        let shorter = result.placements.iter().find(|p| p.ident == 1).unwrap();
        let longer = result.placements.iter().find(|p| p.ident == 2).unwrap();
        assert_eq!(shorter.deltas.len(), 1);
        assert!(longer.deltas.is_empty());
        assert_eq!((longer.gapped_bgn, longer.gapped_end), (0, 5));
    }

    #[test]
    fn test_low_quality_mismatch() {
        let mut builder = builder(short_read_config(false));
        let mut quality = vec![30; 9];
        quality[4] = 10;
        let fragments = vec![
            read(1, b"AAACCCTTT", 0, 9),
            read(2, b"AAACCCTTT", 0, 9),
            FragmentInput::new(3, b"AAACGCTTT".to_vec(), quality, 0, 9)
        ];
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert_eq!(result.consensus, b"AAACCCTTT".to_vec());
        assert!(result.quality[4] < result.quality[3]);
        assert!(result.quality[4] < result.quality[5]);

        let ws = builder.workspace();
        let columns = ws.column_order(result.manode).unwrap();
        assert_eq!(columns.len(), 9);
        assert_eq!(ws.column(columns[4]).unwrap().base_count.mismatch(), 1);
        assert_eq!(ws.column(columns[3]).unwrap().base_count.mismatch(), 0);
    }

    #[test]
    fn test_dovetail_layout() {
        let mut builder = builder(short_read_config(false));
        let fragments = vec![
            read(1, &TEMPLATE[0..20], 0, 20),
            read(2, &TEMPLATE[10..30], 10, 30),
            read(3, &TEMPLATE[22..40], 22, 40)
        ];
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert_eq!(result.consensus, TEMPLATE.to_vec());
        let last = result.placements.iter().find(|p| p.ident == 3).unwrap();
        assert_eq!((last.ungapped_bgn, last.ungapped_end), (22, 40));
        assert!(result.refinement.iter().all(|(_, r)| r.refined == 0));
    }

    #[test]
    fn test_reverse_complement_read() {
        let mut builder = builder(short_read_config(false));
        let fragments = vec![
            read(1, &TEMPLATE[0..24], 0, 24),
            read(2, &crate::workspace::reverse_complement(&TEMPLATE[12..40]), 40, 12)
        ];
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert_eq!(result.consensus, TEMPLATE.to_vec());
        let rc = result.placements.iter().find(|p| p.ident == 2).unwrap();
        assert!(rc.complement);
        assert_eq!((rc.ungapped_bgn, rc.ungapped_end), (40, 12));
    }

    #[test]
    fn test_contained_read_uses_container() {
        let mut builder = builder(short_read_config(false));
        let mut inner = read(2, &TEMPLATE[4..16], 4, 16);
        inner.container = Some(1);
        let fragments = vec![
            read(1, &TEMPLATE[0..24], 0, 24),
            inner,
            read(3, &TEMPLATE[14..40], 14, 40)
        ];
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert_eq!(result.consensus, TEMPLATE.to_vec());
        let inner = result.placements.iter().find(|p| p.ident == 2).unwrap();
        assert!(inner.contained);
        assert_eq!((inner.ungapped_bgn, inner.ungapped_end), (4, 16));
    }

    #[test_log::test]
    fn test_missing_container() {
        let mut orphan = read(2, &TEMPLATE[4..16], 4, 16);
        orphan.container = Some(99);
        let fragments = vec![
            read(1, &TEMPLATE[0..24], 0, 24),
            read(3, &TEMPLATE[2..30], 2, 30),
            orphan
        ];
        let mut strict = builder(short_read_config(false));
        assert!(strict.build_unitig(1, &fragments).is_err());

        // with forcing the read is laid onto the first fragment at its layout offset
        let mut forcing = builder(short_read_config(true));
        let result = forcing.build_unitig(1, &fragments).unwrap();
        assert!(result.forced);
        assert_eq!(result.consensus, TEMPLATE[0..30].to_vec());
        let orphan = result.placements.iter().find(|p| p.ident == 2).unwrap();
        assert_eq!((orphan.ungapped_bgn, orphan.ungapped_end), (4, 16));
    }

    #[test]
    fn test_container_at_first_index() {
        // the container is the first fragment, behind an uncontained read that starts earlier than the contained one
        let mut inner = read(3, &TEMPLATE[6..18], 6, 18);
        inner.container = Some(1);
        let fragments = vec![
            read(1, &TEMPLATE[0..24], 0, 24),
            read(2, &TEMPLATE[3..36], 3, 36),
            inner
        ];
        let mut builder = builder(short_read_config(false));
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert!(!result.forced);
        assert_eq!(result.consensus, TEMPLATE[0..36].to_vec());
        let inner = result.placements.iter().find(|p| p.ident == 3).unwrap();
        assert!(inner.contained);
        assert_eq!((inner.ungapped_bgn, inner.ungapped_end), (6, 18));
    }

    #[test_log::test]
    fn test_forced_placement() {
        let config = ConsensusConfigBuilder::default()
            .dp_min_length(8)
            .dp_thin_min_length(8)
            .allow_forced(true)
            .build()
            .unwrap();
        let fragments = vec![read(1, b"ACGTACGTAC", 0, 10), read(2, b"GGGGGGGGGG", 5, 15)];
        let mut forced_builder = builder(config.clone());
        let result = forced_builder.build_unitig(1, &fragments).unwrap();
        assert!(result.forced);
        assert_eq!(result.consensus.len(), 15);
        assert!(result.refinement.is_empty());

        let mut strict = builder(ConsensusConfig { allow_forced: false, ..config });
        assert!(strict.build_unitig(1, &fragments).is_err());
    }

    #[test]
    fn test_heterozygous_insertion() {
        let config = ConsensusConfigBuilder::default()
            .split_alleles(true)
            .build()
            .unwrap();
        let plain = &TEMPLATE[0..32];
        let mut inserted = plain.to_vec();
        inserted.insert(16, b'T');
        let fragments: Vec<FragmentInput> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    read(i + 1, plain, 0, 32)
                } else {
                    read(i + 1, &inserted, 0, 33)
                }
            })
            .collect();

        let mut builder = builder(config);
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert!(!result.forced);
        assert_eq!(result.consensus.len(), 33);
        assert_eq!(result.variants.len(), 1);

        // every read covers the region and the alleles differ by a single base against a gap
        let region = &result.variants[0];
        assert_eq!((region.bgn, region.end), (16, 17));
        assert_eq!(region.num_reads, 6);
        assert_eq!(region.num_alleles, 2);
        assert_eq!(region.nr_best_allele, 3);
        assert_eq!(region.var_length, 1);
        let mut alleles = vec![region.best_sequence.clone(), region.alt_sequence.clone()];
        alleles.sort();
        assert_eq!(alleles, vec![b"-".to_vec(), b"T".to_vec()]);
    }

    fn contig(ident: u64, seq: &[u8], bgn: usize, end: usize) -> FragmentInput {
        FragmentInput {
            kind: FragmentKind::Contig,
            ..read(ident, seq, bgn, end)
        }
    }

    #[test]
    fn test_merge_contigs() {
        let config = ConsensusConfigBuilder::default()
            .dp_min_length(10)
            .dp_thin_min_length(10)
            .build()
            .unwrap();
        let mut builder = builder(config);
        let contigs = vec![
            contig(1, &TEMPLATE[0..28], 0, 28),
            contig(2, &crate::workspace::reverse_complement(&TEMPLATE[16..40]), 40, 16)
        ];
        let result = builder.merge(5, &contigs).unwrap();
        assert_eq!(result.consensus, TEMPLATE.to_vec());
        assert!(!result.forced);
        assert!(result.refinement.is_empty());
        assert_eq!(result.placements.len(), 2);
        let second = result.placements.iter().find(|p| p.ident == 2).unwrap();
        assert!(second.complement);
        assert_eq!((second.ungapped_bgn, second.ungapped_end), (40, 16));

        // the merge context only lasts for the call
        assert_eq!(builder.workspace().config().alignment_context, AlignmentContext::Unitig);

        // a single multi-alignment comes back as it was
        let result = builder.merge(5, &contigs[0..1]).unwrap();
        assert_eq!(result.consensus, TEMPLATE[0..28].to_vec());
    }

    #[test]
    fn test_merge_without_overlap() {
        let config = ConsensusConfigBuilder::default()
            .dp_min_length(10)
            .dp_thin_min_length(10)
            .build()
            .unwrap();
        let mut builder = builder(config);
        let contigs = vec![
            contig(1, &TEMPLATE[0..16], 0, 16),
            contig(2, &TEMPLATE[20..40], 20, 40)
        ];
        assert!(builder.merge(5, &contigs).is_err());
        assert!(builder.merge(5, &[]).is_err());
        assert_eq!(builder.workspace().config().alignment_context, AlignmentContext::Unitig);
    }

    #[test]
    fn test_empty_unitig() {
        let mut builder: MultiAlignBuilder<BandedAligner> = MultiAlignBuilder::default();
        assert!(builder.build_unitig(1, &[]).is_err());
        assert!(builder.build_contig(1, &[]).is_err());
    }

    fn component(ident: u64, bgn: usize, end: usize, seq: &[u8]) -> Component {
        Component {
            ident,
            kind: FragmentKind::Read,
            bgn,
            end,
            container: None,
            sequence: seq.to_vec(),
            quality: vec![30; seq.len()]
        }
    }

    #[test]
    fn test_contig_from_unitigs() {
        let config = ConsensusConfigBuilder::default()
            .dp_min_length(10)
            .dp_thin_min_length(10)
            .build()
            .unwrap();
        let mut builder = builder(config);
        let unitigs = vec![
            UnitigInput {
                ident: 100,
                unitig_kind: UnitigKind::Unique,
                sequence: TEMPLATE[0..30].to_vec(),
                quality: vec![40; 30],
                bgn: 0,
                end: 30,
                components: vec![
                    component(1, 0, 20, &TEMPLATE[0..20]),
                    component(2, 10, 30, &TEMPLATE[10..30])
                ]
            },
            UnitigInput {
                ident: 200,
                unitig_kind: UnitigKind::Unique,
                sequence: TEMPLATE[15..40].to_vec(),
                quality: vec![40; 25],
                bgn: 15,
                end: 40,
                components: vec![
                    component(3, 0, 20, &TEMPLATE[15..35]),
                    component(4, 10, 25, &TEMPLATE[25..40])
                ]
            }
        ];
        let result = builder.build_contig(9, &unitigs).unwrap();
        assert!(!result.forced);
        assert_eq!(result.consensus, TEMPLATE.to_vec());
        assert_eq!(result.placements.len(), 4);
        assert_eq!(result.unitig_placements.len(), 2);

        let second = result.unitig_placements.iter().find(|p| p.ident == 200).unwrap();
        assert_eq!((second.ungapped_bgn, second.ungapped_end), (15, 40));
        let r3 = result.placements.iter().find(|p| p.ident == 3).unwrap();
        assert_eq!((r3.ungapped_bgn, r3.ungapped_end), (15, 35));
        let r4 = result.placements.iter().find(|p| p.ident == 4).unwrap();
        assert_eq!((r4.ungapped_bgn, r4.ungapped_end), (25, 40));
    }

    #[test]
    fn test_rebuild_from_deltas() {
        let mut builder: MultiAlignBuilder<BandedAligner> = MultiAlignBuilder::default();
        let delta_read = |ident: u64, seq: &[u8], deltas: Vec<usize>| DeltaInput {
            ident,
            kind: FragmentKind::Read,
            sequence: seq.to_vec(),
            quality: vec![30; seq.len()],
            bgn: 0,
            end: 5,
            contained: false,
            deltas
        };
        let fragments = vec![
            delta_read(1, b"ACGT", vec![3]),
            delta_read(2, b"ACGGT", vec![]),
            delta_read(3, b"ACGGT", vec![])
        ];
        let result = builder.rebuild_from_deltas(5, b"ACG-T", &[30; 5], &fragments).unwrap();
        assert_eq!(result.consensus, b"ACGGT".to_vec());
        assert_eq!(result.placements.len(), 3);
        let gapped = result.placements.iter().find(|p| p.ident == 1).unwrap();
        assert_eq!(gapped.deltas, vec![3]);
        assert!(result.unitig_placements.is_empty());
    }

    #[test]
    fn test_rebuild_drops_template_only_columns() {
        let mut builder: MultiAlignBuilder<BandedAligner> = MultiAlignBuilder::default();
        let fragments = vec![DeltaInput {
            ident: 1,
            kind: FragmentKind::Read,
            sequence: b"CGT".to_vec(),
            quality: vec![30; 3],
            bgn: 1,
            end: 4,
            contained: false,
            deltas: vec![]
        }];
        let result = builder.rebuild_from_deltas(5, b"ACGTA", &[30; 5], &fragments).unwrap();
        assert_eq!(result.consensus, b"CGT".to_vec());
        let p = &result.placements[0];
        assert_eq!((p.gapped_bgn, p.gapped_end), (0, 3));
    }

    #[derive(Debug, serde::Deserialize)]
    struct LayoutRecord {
        ident: u64,
        bgn: usize,
        end: usize,
        sequence: String,
        quality: String
    }

    /// Loads a layout test from a csv file.
    /// Expected columns are "ident", "bgn", "end", "sequence", and "quality" (one character per base, offset from '0').
    /// The row with ident 0 is the expected consensus, all other rows are reads in layout order.
    /// Returns a tuple of (expected consensus, reads).
    fn load_layout_csv(filename: &std::path::Path) -> (Vec<u8>, Vec<FragmentInput>) {
        let mut expected = None;
        let mut fragments = vec![];
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(filename)
            .unwrap();
        for row in csv_reader.deserialize() {
            let record: LayoutRecord = row.unwrap();
            let sequence = record.sequence.as_bytes().to_vec();
            if record.ident == 0 {
                expected = Some(sequence);
                continue;
            }
            let quality: Vec<u8> = record.quality.bytes().map(|q| q - b'0').collect();
            fragments.push(FragmentInput::new(record.ident, sequence, quality, record.bgn, record.end));
        }
        (expected.unwrap(), fragments)
    }

    #[test_log::test]
    fn test_csv_layout_001() {
        let (expected, fragments) = load_layout_csv(&std::path::PathBuf::from("./tests/layout_001.csv"));
        let config = ConsensusConfigBuilder::default()
            .dp_erate(0.1)
            .dp_min_length(12)
            .dp_thin_min_length(10)
            .build()
            .unwrap();
        let mut builder = builder(config);
        let result = builder.build_unitig(1, &fragments).unwrap();
        assert!(!result.forced);
        assert_eq!(result.consensus, expected);
        assert_eq!(result.placements.len(), 4);

        // the low quality mismatch in the last read is outvoted but lowers the call quality
        assert!(result.quality[36] < result.quality[35]);
        let rc = result.placements.iter().find(|p| p.ident == 3).unwrap();
        assert!(rc.complement);
        assert_eq!((rc.ungapped_bgn, rc.ungapped_end), (40, 16));
    }
}
