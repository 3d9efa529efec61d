/*!
# abacus_con
This library builds multi-sequence consensus for genome assembly: reads are aligned into a unitig, or unitigs into a contig, one overlap at a time.
The resulting multi-alignment is then cleaned up by abacus refinement, which re-places gaps inside small windows of columns to remove the
artifacts left by pairwise alignment.

Key benefits:
* Quality-aware probabilistic base calls, with optional splitting of reads into two alleles in variable regions
* Pluggable pairwise aligner, with a banded overlap aligner provided
* Reproducible output, ties are broken by a fixed rule or a seeded generator

Performance notes:
* Each build works in a single workspace that is reset and reused, so one builder should be used per thread
* Refinement windows are bounded in width and the number of windows per pass is capped

# Example usage
```rust
use abacus_con::builder::MultiAlignBuilder;
use abacus_con::aligner::BandedAligner;
use abacus_con::example_gen::generate_layout;

// ten error-free reads tiled over a random template
let (template, layout) = generate_layout(400, 10, 100, 0.0, 0);

let mut builder: MultiAlignBuilder<BandedAligner> = Default::default();
let result = builder.build_unitig(1, &layout).unwrap();
assert_eq!(result.consensus, template);
assert_eq!(result.placements.len(), 10);
```
*/

/// Abacus snapshots of column windows and the gap shifts explored on them
pub mod abacus;
/// Pairwise overlap aligner interface and a banded implementation
pub mod aligner;
/// Overlap search with progressively looser retries
pub mod alignment_trace;
/// Clustering of reads into alleles in variable regions
pub mod allele;
/// Integration of pairwise overlaps into the multi-alignment
pub mod apply_alignment;
/// Column base calling
pub mod base_call;
/// Per-column symbol tallies
pub mod base_count;
/// Low-level bead operations
pub mod bead_ops;
/// Top-level unitig and contig construction, rebuilding and merging
pub mod builder;
/// Configuration for the consensus engine
pub mod cns_config;
/// Low-level column operations
pub mod column_ops;
/// Utility for generating examples
pub mod example_gen;
/// Multi-alignment node maintenance and result extraction
pub mod manode;
/// Applying abacus results back to the alignment
pub mod refine;
/// Detection of refinement windows
pub mod window;
/// Arenas holding beads, columns, fragments and nodes
pub mod workspace;
