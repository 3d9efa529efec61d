
/*!
Contains configuration information for the multi-alignment consensus engine.
Typical usage is to the use the builder to construct the config, e.g.
```
use abacus_con::cns_config::{ConsensusConfig, ConsensusConfigBuilder, TieBreak};
let config: ConsensusConfig = ConsensusConfigBuilder::default()
    .split_alleles(true)
    .tie_break(TieBreak::Seeded(42))
    .build()
    .unwrap();
```
*/

/// The highest quality value a consensus call can get
pub const CNS_MAX_QV: u8 = 60;
/// The lowest quality value a consensus call can get
pub const CNS_MIN_QV: u8 = 0;
/// Quality assigned to a gap bead whose neighbors carry the zero quality sentinel
pub const GAP_FALLBACK_QV: u8 = 5;
/// A base needs more than this summed quality (or a second observation) to count towards variation
pub const MIN_QV_FOR_VARIATION: u32 = 22;
/// Quality charged to a gap that is part of a longer run of gaps when comparing reads
pub const QV_FOR_MULTI_GAP: u32 = 14;
/// Penalty multiplier for a base that disagrees with a candidate call
pub const TAU_MISMATCH: f64 = 0.25;
/// Prior weight of each candidate call (gap then ACGT) for a haploid sample, uniform so it cancels in normalization
pub const COMP_BIAS: [f64; 5] = [0.2; 5];
/// Expected per-base sequencing error, used to detect unstable columns
pub const CNS_SEQUENCING_ERROR_EST: f64 = 0.02;
/// Gap-rate above which a trailing column block is considered unstable
pub const STAB_GAP_RATE: f64 = 0.25;
/// Number of columns in the stable border that terminates an INDEL window
pub const STAB_WIDTH: usize = 6;
/// Length of the exact substring used to find where two alleles diverge
pub const MSTRING_SIZE: usize = 3;
/// Maximum allowed shift of an allele interface before it is ignored
pub const MAX_SIZE_OF_ADJUSTED_REGION: usize = 5;
/// Numerical tolerance for probability comparisons
pub const ZERO_PLUS: f64 = 1e-9;

/// Enumeration of the policies for breaking exact ties between candidate calls.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum TieBreak {
    /// Always picks the candidate with the lowest alphabet index (non-gap preferred)
    #[default]
    LowestIndex,
    /// Picks uniformly at random from the tied candidates using a seeded RNG
    Seeded(u64)
}

/// The context an alignment is being built in, this controls how aggressive the aligner retries get.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum AlignmentContext {
    /// Reads aligned into a unitig
    #[default]
    Unitig,
    /// Unitigs aligned into a contig
    Contig,
    /// Merging previously built multi-alignments, allows the widest searches
    Merge
}

/**
Contains configuration information for the multi-alignment consensus engine.
Typical usage is to the use the builder to construct the config, e.g.
```
use abacus_con::cns_config::{ConsensusConfig, ConsensusConfigBuilder, TieBreak};
let config: ConsensusConfig = ConsensusConfigBuilder::default()
    .split_alleles(true)
    .tie_break(TieBreak::Seeded(42))
    .build()
    .unwrap();
```
*/
#[derive(derive_builder::Builder, Clone, Debug)]
#[builder(default)]
pub struct ConsensusConfig {
    /// If true, reads in variable regions are clustered into two alleles and the consensus follows the best one
    pub split_alleles: bool,
    /// Width of the window used to smooth the per-column variation signal
    pub smooth_window: usize,
    /// Maximum number of alleles to separate, only two are currently supported
    pub max_alleles: usize,
    /// Policy for breaking exact ties in base calls
    pub tie_break: TieBreak,
    /// The context we are aligning in
    pub alignment_context: AlignmentContext,
    /// If true, a fragment that cannot be aligned is forced into place instead of failing the build
    pub allow_forced: bool,
    /// If true, overlaps with a large negative hang are accepted
    pub allow_negative_hang: bool,
    /// If true, fragments whose alignment is a containment get marked as contained
    pub mark_contains: bool,
    /// If true, the call of a guide sequence overrides the computed call when they disagree
    pub call_public: bool,
    /// Maximum number of windows a single refinement pass will examine
    pub max_refine_iterations: usize,
    /// Windows at least this wide are never refined
    pub max_window_width: usize,
    /// Default error rate allowed by the pairwise aligner
    pub dp_erate: f64,
    /// Probability threshold handed to the pairwise aligner
    pub dp_thresh: f64,
    /// Minimum overlap length handed to the pairwise aligner
    pub dp_min_length: usize,
    /// Minimum overlap length used when looking for thin overlaps
    pub dp_thin_min_length: usize,
    /// Half-width of the band around the expected offset for the first attempts
    pub tight_semi_bandwidth: i64,
    /// Base half-width for the widened bands
    pub loose_semi_bandwidth: i64,
    /// Overlaps starting further left than this are rejected unless negative hangs are allowed
    pub neg_ahang_cutoff: i64
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            // allele splitting is opt-in
            split_alleles: false,
            // 11 columns
            smooth_window: 11,
            // only diploid separation is supported
            max_alleles: 2,
            // deterministic output by default
            tie_break: TieBreak::LowestIndex,
            // most builds are reads into unitigs
            alignment_context: AlignmentContext::Unitig,
            // unplaceable fragments fail the build
            allow_forced: false,
            // reject overlaps that start well before the anchor
            allow_negative_hang: false,
            // record containments found while aligning
            mark_contains: true,
            // trust the computed call
            call_public: false,
            // windows examined per refinement pass
            max_refine_iterations: 1_000_000,
            // widest window that gets refined
            max_window_width: 100,
            // aligner settings
            dp_erate: 0.06,
            dp_thresh: 1e-6,
            dp_min_length: 30,
            dp_thin_min_length: 10,
            tight_semi_bandwidth: 6,
            loose_semi_bandwidth: 100,
            neg_ahang_cutoff: -5
        }
    }
}
