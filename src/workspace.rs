
/*!
This module provides the [`ConsensusWorkspace`], which owns every arena used while building a multi-alignment.
Beads, columns, fragments, and multi-alignment nodes refer to each other through typed indices into these arenas.
A workspace is reused between independent builds by calling [`ConsensusWorkspace::reset`].

# Example usage
```rust
use abacus_con::workspace::{ConsensusWorkspace, FragmentKind};

let mut workspace = ConsensusWorkspace::default();
let fid = workspace.append_fragment(1, FragmentKind::Read, b"ACGT", &[30; 4], false).unwrap();
assert_eq!(workspace.fragment(fid).unwrap().length(), 4);
assert_eq!(workspace.fragment_sequence(fid).unwrap(), b"ACGT".to_vec());
```
*/

use rand::rngs::StdRng;
use rand::SeedableRng;
use simple_error::bail;

use crate::base_count::{base_to_index, BaseCount};
use crate::cns_config::{ConsensusConfig, TieBreak, CNS_MAX_QV};

/// Index of a bead in the bead arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeadId(pub usize);

/// Index of a column in the column arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(pub usize);

/// Index of a fragment in the fragment arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub usize);

/// Index of a multi-alignment node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManodeId(pub usize);

/// The type of sequence a fragment carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// A sequencing read, the only kind that votes in probabilistic base calls
    #[default]
    Read,
    /// A non-read sequence (e.g. a finished clone), used only when no read covers a column
    Guide,
    /// A previously assembled unitig consensus
    Unitig,
    /// A previously assembled contig consensus
    Contig
}

impl FragmentKind {
    pub fn is_read(&self) -> bool {
        matches!(self, FragmentKind::Read)
    }

    /// Unitigs and contigs are consensus sequences themselves
    pub fn is_chunk(&self) -> bool {
        matches!(self, FragmentKind::Unitig | FragmentKind::Contig)
    }
}

/// Classification of a unitig, controls whether it can stand in for reads as a surrogate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnitigKind {
    #[default]
    Unique,
    Rock,
    Stone,
    Pebble,
    Singleton,
    Other
}

impl UnitigKind {
    /// Surrogate unitigs may provide the call when no read covers a column
    pub fn is_surrogate(&self) -> bool {
        matches!(self, UnitigKind::Stone | UnitigKind::Pebble | UnitigKind::Other)
    }
}

/// Storage for characters and their qualities, addressed by stable offsets.
#[derive(Clone, Debug, Default)]
pub struct SequenceArena {
    bases: Vec<u8>,
    quals: Vec<u8>
}

impl SequenceArena {
    /// Appends a symbol, returning its offset
    pub fn push(&mut self, base: u8, qv: u8) -> usize {
        self.bases.push(base);
        self.quals.push(qv);
        self.bases.len() - 1
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    fn clear(&mut self) {
        self.bases.clear();
        self.quals.clear();
    }
}

/// One aligned character occurrence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bead {
    /// Offset into the sequence arena
    pub soffset: usize,
    /// Owning fragment, None for column call beads
    pub frag: Option<FragmentId>,
    /// Previous bead of the same fragment (or previous call bead)
    pub prev: Option<BeadId>,
    /// Next bead of the same fragment (or next call bead)
    pub next: Option<BeadId>,
    /// Bead above in the column
    pub up: Option<BeadId>,
    /// Bead below in the column
    pub down: Option<BeadId>,
    /// The column this bead is aligned to
    pub column: Option<ColumnId>
}

/// One vertical slice of the multi-alignment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Column {
    /// The bead holding the consensus call, head of the vertical bead list
    pub call: BeadId,
    pub prev: Option<ColumnId>,
    pub next: Option<ColumnId>,
    /// Position in the owning node, only valid right after a refresh
    pub ma_index: i64,
    /// Tally of the beads below the call
    pub base_count: BaseCount,
    /// Owning multi-alignment node
    pub manode: Option<ManodeId>
}

/// Placement of a sub-fragment inside a unitig or contig fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    /// External identifier
    pub ident: u64,
    /// Sequence type
    pub kind: FragmentKind,
    /// Ungapped start in the parent, larger than `end` when reverse complemented
    pub bgn: usize,
    /// Ungapped end in the parent
    pub end: usize,
    /// External identifier of the containing component, if any
    pub container: Option<u64>,
    /// Raw bases in forward orientation
    pub sequence: Vec<u8>,
    /// Raw qualities in forward orientation
    pub quality: Vec<u8>
}

/// A participating sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    /// External identifier
    pub ident: u64,
    pub kind: FragmentKind,
    pub unitig_kind: UnitigKind,
    /// True if the stored sequence is the reverse complement of the input
    pub complement: bool,
    /// External identifier of the declared container
    pub container: Option<u64>,
    /// Set when an alignment showed this fragment is contained in its anchor
    pub contained: bool,
    /// Set when the fragment was removed from the alignment
    pub deleted: bool,
    /// Owning multi-alignment node
    pub manode: Option<ManodeId>,
    /// Ungapped length
    length: usize,
    /// First of `length` consecutive beads holding the ungapped sequence
    first_bead: BeadId,
    /// Offset of the sequence in the sequence arena
    sequence: usize,
    /// Sub-fragments placed within this one
    pub components: Vec<Component>
}

impl Fragment {
    // Getters
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn first_bead(&self) -> BeadId {
        self.first_bead
    }

    /// Returns the bead holding ungapped position `i`
    pub fn bead(&self, i: usize) -> Option<BeadId> {
        if i < self.length {
            Some(BeadId(self.first_bead.0 + i))
        } else {
            None
        }
    }

    /// Returns the bead holding the last ungapped position
    pub fn last_bead(&self) -> Option<BeadId> {
        self.length.checked_sub(1).and_then(|i| self.bead(i))
    }
}

/// An ordered multi-alignment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MANode {
    /// External identifier of the unitig or contig being built
    pub ident: u64,
    pub first: Option<ColumnId>,
    pub last: Option<ColumnId>,
    /// Column order, only valid right after a refresh
    pub columns: Vec<ColumnId>
}

/// Owns every arena used while building multi-alignments.
#[derive(Debug)]
pub struct ConsensusWorkspace {
    /// Run configuration
    config: ConsensusConfig,
    /// Characters and qualities
    sequences: SequenceArena,
    beads: Vec<Bead>,
    columns: Vec<Column>,
    fragments: Vec<Fragment>,
    manodes: Vec<MANode>,
    /// Random source for tie-breaking, None when ties go to the lowest index
    rng: Option<StdRng>
}

impl Default for ConsensusWorkspace {
    fn default() -> Self {
        Self::new(ConsensusConfig::default())
    }
}

impl ConsensusWorkspace {
    /// Creates an empty workspace.
    /// # Arguments
    /// * `config` - the configuration for all builds in this workspace
    pub fn new(config: ConsensusConfig) -> ConsensusWorkspace {
        let rng = match config.tie_break {
            TieBreak::LowestIndex => None,
            TieBreak::Seeded(seed) => Some(StdRng::seed_from_u64(seed))
        };
        ConsensusWorkspace {
            config,
            sequences: Default::default(),
            beads: vec![],
            columns: vec![],
            fragments: vec![],
            manodes: vec![],
            rng
        }
    }

    /// Creates an empty workspace after checking the configuration.
    /// # Arguments
    /// * `config` - the configuration for all builds in this workspace
    /// # Errors
    /// * if more than two alleles are requested
    /// * if the refinement budget is zero
    pub fn with_config(config: ConsensusConfig) -> Result<ConsensusWorkspace, Box<dyn std::error::Error>> {
        if config.max_alleles > 2 {
            bail!("max_alleles must be at most 2, got {}", config.max_alleles);
        }
        if config.max_refine_iterations == 0 {
            bail!("max_refine_iterations must be positive");
        }
        Ok(Self::new(config))
    }

    /// Empties all arenas while keeping their capacity, and re-seeds the tie-breaking RNG.
    pub fn reset(&mut self) {
        self.sequences.clear();
        self.beads.clear();
        self.columns.clear();
        self.fragments.clear();
        self.manodes.clear();
        if let TieBreak::Seeded(seed) = self.config.tie_break {
            self.rng = Some(StdRng::seed_from_u64(seed));
        }
    }

    /// Adds a fragment and allocates one bead per base.
    /// Bases are upper-cased and qualities are capped at the max quality.
    /// # Arguments
    /// * `ident` - external identifier
    /// * `kind` - the sequence type
    /// * `bases` - the raw sequence in forward orientation
    /// * `quals` - one quality value per base
    /// * `complement` - if true, the reverse complement is stored
    /// # Errors
    /// * if the sequence is empty, contains non-ACGTN symbols, or has a mismatched quality length
    pub fn append_fragment(&mut self, ident: u64, kind: FragmentKind, bases: &[u8], quals: &[u8], complement: bool) -> Result<FragmentId, Box<dyn std::error::Error>> {
        if bases.is_empty() {
            bail!("fragment {ident} has an empty sequence");
        }
        if bases.len() != quals.len() {
            bail!("fragment {ident} has {} bases but {} qualities", bases.len(), quals.len());
        }
        let mut seq: Vec<(u8, u8)> = Vec::with_capacity(bases.len());
        for (&b, &q) in bases.iter().zip(quals.iter()) {
            let upper = b.to_ascii_uppercase();
            match base_to_index(upper) {
                Some(i) if i > 0 => seq.push((upper, q.min(CNS_MAX_QV))),
                _ => bail!("fragment {ident} contains unsupported symbol {:?}", b as char)
            };
        }
        if complement {
            seq.reverse();
            for (b, _q) in seq.iter_mut() {
                *b = complement_base(*b);
            }
        }
        Ok(self.push_fragment(ident, kind, &seq, complement))
    }

    /// Adds a gapped consensus (e.g. a previously built contig) as a template fragment.
    /// Gap symbols are kept as beads, so stored deltas can be applied against its gapped coordinates.
    /// # Arguments
    /// * `ident` - external identifier
    /// * `bases` - the gapped consensus
    /// * `quals` - one quality value per symbol
    /// # Errors
    /// * if the sequence is empty, contains non-ACGTN- symbols, or has a mismatched quality length
    pub fn append_template(&mut self, ident: u64, bases: &[u8], quals: &[u8]) -> Result<FragmentId, Box<dyn std::error::Error>> {
        if bases.is_empty() {
            bail!("template {ident} has an empty sequence");
        }
        if bases.len() != quals.len() {
            bail!("template {ident} has {} bases but {} qualities", bases.len(), quals.len());
        }
        let mut seq: Vec<(u8, u8)> = Vec::with_capacity(bases.len());
        for (&b, &q) in bases.iter().zip(quals.iter()) {
            let upper = b.to_ascii_uppercase();
            if base_to_index(upper).is_none() {
                bail!("template {ident} contains unsupported symbol {:?}", b as char);
            }
            seq.push((upper, q.min(CNS_MAX_QV)));
        }
        Ok(self.push_fragment(ident, FragmentKind::Contig, &seq, false))
    }

    /// Allocates the beads and record of a validated fragment.
    fn push_fragment(&mut self, ident: u64, kind: FragmentKind, seq: &[(u8, u8)], complement: bool) -> FragmentId {
        let fid = FragmentId(self.fragments.len());
        let first_bead = BeadId(self.beads.len());
        let sequence = self.sequences.len();
        let length = seq.len();
        for (i, &(b, q)) in seq.iter().enumerate() {
            let soffset = self.sequences.push(b, q);
            self.beads.push(Bead {
                soffset,
                frag: Some(fid),
                prev: if i > 0 { Some(BeadId(first_bead.0 + i - 1)) } else { None },
                next: if i + 1 < length { Some(BeadId(first_bead.0 + i + 1)) } else { None },
                up: None,
                down: None,
                column: None
            });
        }
        self.fragments.push(Fragment {
            ident,
            kind,
            unitig_kind: UnitigKind::default(),
            complement,
            container: None,
            contained: false,
            deleted: false,
            manode: None,
            length,
            first_bead,
            sequence,
            components: vec![]
        });
        fid
    }

    /// Creates a new, empty multi-alignment node.
    pub fn create_manode(&mut self, ident: u64) -> ManodeId {
        self.manodes.push(MANode { ident, ..Default::default() });
        ManodeId(self.manodes.len() - 1)
    }

    /// Allocates a bead that is not linked to anything yet.
    pub(crate) fn new_bead(&mut self, base: u8, qv: u8, frag: Option<FragmentId>) -> BeadId {
        let soffset = self.sequences.push(base, qv);
        self.beads.push(Bead { soffset, frag, prev: None, next: None, up: None, down: None, column: None });
        BeadId(self.beads.len() - 1)
    }

    /// Allocates a column around an already allocated call bead.
    pub(crate) fn new_column(&mut self, call: BeadId) -> ColumnId {
        self.columns.push(Column {
            call,
            prev: None,
            next: None,
            ma_index: -1,
            base_count: BaseCount::default(),
            manode: None
        });
        ColumnId(self.columns.len() - 1)
    }

    /// Returns the ungapped sequence of a fragment, as stored (i.e. after any complementing).
    /// # Errors
    /// * if the fragment does not exist
    pub fn fragment_sequence(&self, fid: FragmentId) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let frag = self.fragment(fid)?;
        Ok(self.sequences.bases[frag.sequence..frag.sequence + frag.length].to_vec())
    }

    /// Returns the ungapped qualities of a fragment, as stored.
    /// # Errors
    /// * if the fragment does not exist
    pub fn fragment_quality(&self, fid: FragmentId) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let frag = self.fragment(fid)?;
        Ok(self.sequences.quals[frag.sequence..frag.sequence + frag.length].to_vec())
    }

    /// Walks the bead chain of a fragment starting at its first base, gap beads included.
    /// # Errors
    /// * if the fragment or any bead does not exist
    /// * if the chain is longer than the bead arena (i.e. it loops)
    pub fn fragment_beads(&self, fid: FragmentId) -> Result<Vec<BeadId>, Box<dyn std::error::Error>> {
        let mut ret = vec![];
        let mut current = Some(self.fragment(fid)?.first_bead);
        while let Some(bid) = current {
            if ret.len() > self.beads.len() {
                bail!("internal error: bead chain of fragment {fid:?} loops");
            }
            ret.push(bid);
            current = self.bead(bid)?.next;
        }
        Ok(ret)
    }

    /// Returns the beads stacked in a column from top to bottom, excluding the call.
    /// # Errors
    /// * if the column or any bead does not exist
    pub fn column_beads(&self, cid: ColumnId) -> Result<Vec<BeadId>, Box<dyn std::error::Error>> {
        let column = self.column(cid)?;
        let mut ret = Vec::with_capacity(column.base_count.depth());
        let mut current = self.bead(column.call)?.down;
        while let Some(bid) = current {
            if ret.len() > self.beads.len() {
                bail!("internal error: bead stack of column {cid:?} loops");
            }
            ret.push(bid);
            current = self.bead(bid)?.down;
        }
        Ok(ret)
    }

    /// Walks the columns of a node from first to last.
    /// # Errors
    /// * if the node or any column does not exist
    pub fn column_order(&self, mid: ManodeId) -> Result<Vec<ColumnId>, Box<dyn std::error::Error>> {
        let mut ret = vec![];
        let mut current = self.manode(mid)?.first;
        while let Some(cid) = current {
            if ret.len() > self.columns.len() {
                bail!("internal error: column list of node {mid:?} loops");
            }
            ret.push(cid);
            current = self.column(cid)?.next;
        }
        Ok(ret)
    }

    /// Returns the character of a bead.
    /// # Errors
    /// * if the bead does not exist
    pub fn bead_char(&self, bid: BeadId) -> Result<u8, Box<dyn std::error::Error>> {
        let soffset = self.bead(bid)?.soffset;
        Ok(self.sequences.bases[soffset])
    }

    /// Returns the quality value of a bead.
    /// # Errors
    /// * if the bead does not exist
    pub fn bead_qv(&self, bid: BeadId) -> Result<u8, Box<dyn std::error::Error>> {
        let soffset = self.bead(bid)?.soffset;
        Ok(self.sequences.quals[soffset])
    }

    /// Overwrites the character and quality of a bead, used for call beads.
    /// # Errors
    /// * if the bead does not exist
    pub(crate) fn set_bead_symbol(&mut self, bid: BeadId, base: u8, qv: u8) -> Result<(), Box<dyn std::error::Error>> {
        let soffset = self.bead(bid)?.soffset;
        self.sequences.bases[soffset] = base;
        self.sequences.quals[soffset] = qv;
        Ok(())
    }

    /// Returns the column call character and quality.
    /// # Errors
    /// * if the column or its call bead does not exist
    pub fn column_call(&self, cid: ColumnId) -> Result<(u8, u8), Box<dyn std::error::Error>> {
        let call = self.column(cid)?.call;
        Ok((self.bead_char(call)?, self.bead_qv(call)?))
    }

    /// Returns the fragment that owns a bead.
    /// # Errors
    /// * if the bead does not exist or is a call bead
    pub fn bead_fragment(&self, bid: BeadId) -> Result<&Fragment, Box<dyn std::error::Error>> {
        match self.bead(bid)?.frag {
            Some(fid) => self.fragment(fid),
            None => bail!("internal error: bead {bid:?} has no fragment")
        }
    }

    pub fn bead(&self, bid: BeadId) -> Result<&Bead, Box<dyn std::error::Error>> {
        match self.beads.get(bid.0) {
            Some(b) => Ok(b),
            None => bail!("internal error: bead {bid:?} does not exist")
        }
    }

    pub(crate) fn bead_mut(&mut self, bid: BeadId) -> Result<&mut Bead, Box<dyn std::error::Error>> {
        match self.beads.get_mut(bid.0) {
            Some(b) => Ok(b),
            None => bail!("internal error: bead {bid:?} does not exist")
        }
    }

    pub fn column(&self, cid: ColumnId) -> Result<&Column, Box<dyn std::error::Error>> {
        match self.columns.get(cid.0) {
            Some(c) => Ok(c),
            None => bail!("internal error: column {cid:?} does not exist")
        }
    }

    pub(crate) fn column_mut(&mut self, cid: ColumnId) -> Result<&mut Column, Box<dyn std::error::Error>> {
        match self.columns.get_mut(cid.0) {
            Some(c) => Ok(c),
            None => bail!("internal error: column {cid:?} does not exist")
        }
    }

    pub fn fragment(&self, fid: FragmentId) -> Result<&Fragment, Box<dyn std::error::Error>> {
        match self.fragments.get(fid.0) {
            Some(f) => Ok(f),
            None => bail!("internal error: fragment {fid:?} does not exist")
        }
    }

    pub(crate) fn fragment_mut(&mut self, fid: FragmentId) -> Result<&mut Fragment, Box<dyn std::error::Error>> {
        match self.fragments.get_mut(fid.0) {
            Some(f) => Ok(f),
            None => bail!("internal error: fragment {fid:?} does not exist")
        }
    }

    pub fn manode(&self, mid: ManodeId) -> Result<&MANode, Box<dyn std::error::Error>> {
        match self.manodes.get(mid.0) {
            Some(m) => Ok(m),
            None => bail!("internal error: multi-alignment node {mid:?} does not exist")
        }
    }

    pub(crate) fn manode_mut(&mut self, mid: ManodeId) -> Result<&mut MANode, Box<dyn std::error::Error>> {
        match self.manodes.get_mut(mid.0) {
            Some(m) => Ok(m),
            None => bail!("internal error: multi-alignment node {mid:?} does not exist")
        }
    }

    /// Mutable access to the config, used to switch contexts between builds
    pub(crate) fn config_mut(&mut self) -> &mut ConsensusConfig {
        &mut self.config
    }

    /// Random source for tie-breaking, None means lowest index wins
    pub(crate) fn rng(&mut self) -> Option<&mut StdRng> {
        self.rng.as_mut()
    }

    // Getters
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn num_beads(&self) -> usize {
        self.beads.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragment_ids(&self) -> impl Iterator<Item = FragmentId> {
        (0..self.fragments.len()).map(FragmentId)
    }
}

/// Complement of a single base, anything else is returned unchanged.
pub fn complement_base(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        b'a' => b't',
        b'c' => b'g',
        b'g' => b'c',
        b't' => b'a',
        other => other
    }
}

/// Reverse complement of a sequence.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement_base(b)).collect()
}
