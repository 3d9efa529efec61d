
/*!
Separation of the reads covering a variable region into two alleles.
Reads are compared column by column through a quality-weighted distance matrix,
the two most distant reads seed the alleles, and every other read joins the closer seed.
*/

use log::trace;
use rustc_hash::FxHashMap as HashMap;

use crate::cns_config::{QV_FOR_MULTI_GAP, ZERO_PLUS};
use crate::workspace::{ColumnId, ConsensusWorkspace, FragmentId};

/// Smooths a per-column signal with a box filter of the given width.
/// The window starts `window / 2` columns to the left and is clipped at both ends, but the sum is always divided by the full width.
/// # Arguments
/// * `var` - the raw signal
/// * `window` - the filter width, 0 leaves the signal unchanged
pub fn smoothen_variation(var: &[f64], window: usize) -> Vec<f64> {
    if window == 0 {
        return var.to_vec();
    }
    let dim = var.len();
    (0..dim)
        .map(|i| {
            let beg = i.saturating_sub(window / 2);
            let end = (beg + window).min(dim);
            var[beg..end].iter().sum::<f64>() / window as f64
        })
        .collect()
}

/// The reads of one variable region and their allele assignment
#[derive(Clone, Debug, Default)]
pub struct ReadClusters {
    /// Reads in discovery order
    reads: Vec<FragmentId>,
    /// Position of each read in `reads`
    index: HashMap<FragmentId, usize>,
    /// Allele of each read
    alleles: Vec<usize>,
    /// Summed evidence quality of each read over the region
    sum_qvs: Vec<u32>,
    /// Pairwise distances, -1 where two reads never share a column
    dist_matrix: Vec<Vec<i64>>,
    best_allele: usize,
    nr_best_allele: usize,
    /// Quality of the other allele relative to the best one
    ratio: f64
}

impl ReadClusters {
    /// Creates an empty clustering for the given reads.
    pub fn new(reads: Vec<FragmentId>) -> ReadClusters {
        let nr = reads.len();
        let index = reads.iter().enumerate().map(|(i, &f)| (f, i)).collect();
        ReadClusters {
            reads,
            index,
            alleles: vec![0; nr],
            sum_qvs: vec![0; nr],
            dist_matrix: vec![vec![-1; nr]; nr],
            best_allele: 0,
            nr_best_allele: nr,
            ratio: 0.0
        }
    }

    /// Creates a clustering from an already computed distance matrix and per-read support.
    /// # Arguments
    /// * `reads` - the reads, in matrix order
    /// * `dist_matrix` - square matrix of pairwise distances
    /// * `support` - the evidence each read carries, used to pick the best allele
    pub fn from_distances(reads: Vec<FragmentId>, dist_matrix: Vec<Vec<i64>>, support: Vec<u32>) -> ReadClusters {
        let mut clusters = ReadClusters::new(reads);
        clusters.dist_matrix = dist_matrix;
        clusters.sum_qvs = support;
        clusters
    }

    /// Splits the reads between two alleles and picks the one with more quality support.
    pub fn cluster(&mut self) {
        let nr = self.reads.len();
        if nr <= 1 {
            self.best_allele = 0;
            self.alleles.iter_mut().for_each(|a| *a = 0);
            self.nr_best_allele = nr;
            self.ratio = 0.0;
            return;
        }

        // the most distant pair seeds the two alleles
        let mut largest = -100;
        let (mut seed0, mut seed1) = (0, 1);
        for i in 0..nr {
            for j in (i + 1)..nr {
                if largest < self.dist_matrix[i][j] {
                    largest = self.dist_matrix[i][j];
                    seed0 = i;
                    seed1 = j;
                }
            }
        }
        self.alleles[seed0] = 0;
        self.alleles[seed1] = 1;
        for i in 0..nr {
            if i == seed0 || i == seed1 {
                continue;
            }
            self.alleles[i] = if self.dist_matrix[i][seed0] < self.dist_matrix[i][seed1] { 0 } else { 1 };
        }

        let mut sums = [0u32; 2];
        let mut counts = [0usize; 2];
        for (&allele, &qv) in self.alleles.iter().zip(self.sum_qvs.iter()) {
            sums[allele] += qv;
            counts[allele] += 1;
        }
        self.best_allele = if sums[0] as f64 > sums[1] as f64 + ZERO_PLUS { 0 } else { 1 };
        let other = 1 - self.best_allele;
        self.ratio = if sums[self.best_allele] > 0 {
            sums[other] as f64 / sums[self.best_allele] as f64
        } else {
            0.0
        };
        self.nr_best_allele = counts[self.best_allele];
        trace!("Clustered {nr} reads: allele sums {sums:?}, best allele {}", self.best_allele);
    }

    /// Returns the allele of a read, None if the read is not part of this region.
    pub fn allele_of(&self, fid: FragmentId) -> Option<usize> {
        self.index.get(&fid).map(|&i| self.alleles[i])
    }

    /// Distance between two reads, -1 if they never overlapped
    pub fn distance(&self, a: FragmentId, b: FragmentId) -> Option<i64> {
        let i = *self.index.get(&a)?;
        let j = *self.index.get(&b)?;
        Some(self.dist_matrix[i][j])
    }

    // Getters
    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn reads(&self) -> &[FragmentId] {
        &self.reads
    }

    pub fn alleles(&self) -> &[usize] {
        &self.alleles
    }

    pub fn best_allele(&self) -> usize {
        self.best_allele
    }

    pub fn nr_best_allele(&self) -> usize {
        self.nr_best_allele
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

impl ConsensusWorkspace {
    /// Collects the distinct reads with a non-N bead in any of the given columns, in column order.
    /// # Errors
    /// * if any column or bead is invalid
    pub fn collect_read_ids(&self, columns: &[ColumnId]) -> Result<ReadClusters, Box<dyn std::error::Error>> {
        let mut reads = vec![];
        let mut seen = rustc_hash::FxHashSet::default();
        for &cid in columns.iter() {
            for bid in self.column_beads(cid)? {
                if self.bead_char(bid)? == b'N' {
                    continue;
                }
                let Some(fid) = self.bead(bid)?.frag else {
                    continue;
                };
                if self.fragment(fid)?.kind.is_read() && seen.insert(fid) {
                    reads.push(fid);
                }
            }
        }
        Ok(ReadClusters::new(reads))
    }

    /// Adds the evidence of one column to the read distance matrix and the per-read quality sums.
    /// A base contributes its quality, an isolated gap the lower quality of its neighbors, and a gap within a run a fixed value.
    /// Two reads that disagree in the column move apart by the sum of their qualities.
    /// # Errors
    /// * if the column or any bead is invalid
    pub fn populate_dist_matrix(&self, cid: ColumnId, clusters: &mut ReadClusters) -> Result<(), Box<dyn std::error::Error>> {
        let nr = clusters.num_reads();
        let mut present: Vec<Option<(u8, u32)>> = vec![None; nr];
        for bid in self.column_beads(cid)? {
            let bead = *self.bead(bid)?;
            let Some(fid) = bead.frag else {
                continue;
            };
            if !self.fragment(fid)?.kind.is_read() {
                continue;
            }
            let Some(&i) = clusters.index.get(&fid) else {
                continue;
            };
            let base = self.bead_char(bid)?;
            let qv = self.bead_qv(bid)? as u32;
            present[i] = Some((base, qv));
            if base != b'-' {
                clusters.sum_qvs[i] += qv;
            } else if let (Some(p), Some(n)) = (bead.prev, bead.next) {
                if self.bead_char(p)? == b'-' || self.bead_char(n)? == b'-' {
                    clusters.sum_qvs[i] += QV_FOR_MULTI_GAP;
                } else {
                    clusters.sum_qvs[i] += self.bead_qv(p)?.min(self.bead_qv(n)?) as u32;
                }
            }
        }

        for i in 0..nr {
            let Some((base_i, qv_i)) = present[i] else {
                continue;
            };
            for j in (i + 1)..nr {
                let Some((base_j, qv_j)) = present[j] else {
                    continue;
                };
                let delta = if base_i == base_j { 0 } else { (qv_i + qv_j) as i64 };
                for (a, b) in [(i, j), (j, i)] {
                    let d = &mut clusters.dist_matrix[a][b];
                    *d = (*d).max(0) + delta;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::base_call::CallMode;
    use crate::workspace::{FragmentKind, ManodeId};

    /// Stacks equal-length reads into the columns of the first one
    fn stacked(reads: &[(&[u8], u8)]) -> (ConsensusWorkspace, ManodeId, Vec<FragmentId>) {
        let mut ws = ConsensusWorkspace::default();
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
            }
            fids.push(fid);
        }
        (ws, mid, fids)
    }

    #[test]
    fn test_smoothen_variation() {
        let var = vec![0.0, 0.0, 1.0, 0.0, 0.0];
        let smooth = smoothen_variation(&var, 3);
        assert!((smooth[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((smooth[2] - 1.0 / 3.0).abs() < 1e-12);
        assert!((smooth[3] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(smooth[0], 0.0);
        assert_eq!(smooth[4], 0.0);
        // window 0 is the identity
        assert_eq!(smoothen_variation(&var, 0), var);
    }

    #[test]
    fn test_two_alleles() {
        let (ws, mid, fids) = stacked(&[
            (b"AAA", 40),
            (b"AAA", 40),
            (b"ACA", 20),
            (b"ACA", 20)
        ]);
        let columns = ws.column_order(mid).unwrap();
        let mut clusters = ws.collect_read_ids(&columns).unwrap();
        assert_eq!(clusters.num_reads(), 4);
        for &cid in columns.iter() {
            ws.populate_dist_matrix(cid, &mut clusters).unwrap();
        }
        assert_eq!(clusters.distance(fids[0], fids[1]), Some(0));
        assert_eq!(clusters.distance(fids[0], fids[2]), Some(60));
        clusters.cluster();

        let a0 = clusters.allele_of(fids[0]).unwrap();
        assert_eq!(clusters.allele_of(fids[1]), Some(a0));
        assert_eq!(clusters.allele_of(fids[2]), Some(1 - a0));
        assert_eq!(clusters.allele_of(fids[3]), Some(1 - a0));
        assert_eq!(clusters.best_allele(), a0);
        assert_eq!(clusters.nr_best_allele(), 2);
        assert!((clusters.ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_read() {
        let (ws, mid, fids) = stacked(&[(b"ACGT", 30)]);
        let columns = ws.column_order(mid).unwrap();
        let mut clusters = ws.collect_read_ids(&columns).unwrap();
        clusters.cluster();
        assert_eq!(clusters.best_allele(), 0);
        assert_eq!(clusters.allele_of(fids[0]), Some(0));
        assert_eq!(clusters.ratio(), 0.0);
    }

    #[test]
    fn test_gap_quality_in_runs() {
        let (mut ws, mid, fids) = stacked(&[(b"ACGTA", 30)]);
        let columns = ws.column_order(mid).unwrap();
        // second read A - - T A with qualities 10 and 20 around the gaps
        let fid = ws.append_fragment(9, FragmentKind::Read, b"ATA", &[10, 20, 30], false).unwrap();
        let frag = ws.fragment(fid).unwrap().clone();
        ws.align_bead(columns[0], frag.bead(0).unwrap()).unwrap();
        let g1 = ws.append_gap_bead(frag.bead(0).unwrap()).unwrap();
        ws.align_bead(columns[1], g1).unwrap();
        let g2 = ws.append_gap_bead(g1).unwrap();
        ws.align_bead(columns[2], g2).unwrap();
        ws.align_bead(columns[3], frag.bead(1).unwrap()).unwrap();
        ws.align_bead(columns[4], frag.bead(2).unwrap()).unwrap();

        let mut clusters = ws.collect_read_ids(&columns[1..3]).unwrap();
        assert_eq!(clusters.num_reads(), 2);
        ws.populate_dist_matrix(columns[1], &mut clusters).unwrap();
        // the gap sits in a run so it gets the fixed value, the read base its own quality
        let i = clusters.reads().iter().position(|&f| f == fid).unwrap();
        assert_eq!(clusters.sum_qvs[i], QV_FOR_MULTI_GAP);
        let g1_qv = ws.bead_qv(g1).unwrap() as i64;
        assert_eq!(clusters.distance(fid, fids[0]), Some(30 + g1_qv));
    }
}
