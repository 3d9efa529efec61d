
/*!
Consensus base calling for a single column.
The probabilistic mode scores each candidate symbol against the quality-weighted read evidence,
optionally restricted to the reads of one allele.
*/

use itertools::Itertools;
use log::trace;

use crate::allele::ReadClusters;
use crate::base_count::{base_to_index, correct_prob, error_prob, resolve_tie, ALPHABET, GAP_INDEX, N_INDEX};
use crate::cns_config::{CNS_MAX_QV, CNS_MIN_QV, COMP_BIAS, GAP_FALLBACK_QV, MIN_QV_FOR_VARIATION, TAU_MISMATCH, ZERO_PLUS};
use crate::workspace::{BeadId, ColumnId, ConsensusWorkspace, FragmentKind};

/// Enumeration of the ways a column call can be computed
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum CallMode {
    /// Copies the symbol and quality of the topmost bead, used when seeding from a single fragment
    Promote,
    /// Majority vote over every bead, quality 0
    Plurality,
    /// Quality-weighted likelihood over the read evidence
    #[default]
    Probabilistic
}

/// The result of calling one column
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaseCallOutcome {
    /// The called symbol, this may differ from what was written if the call targeted a non-best allele
    pub base: u8,
    /// Quality of the call
    pub qv: u8,
    /// Number of beads that disagree with the call
    pub score: usize,
    /// Fraction of the trusted read quality that does not support the call, 0 means no variation
    pub var: f64
}

/// Bead evidence gathered from one column
#[derive(Default)]
struct ColumnEvidence {
    best_reads: Vec<(usize, u8)>,
    other_reads: Vec<(usize, u8)>,
    /// (symbol index, quality, is unitig, is surrogate)
    guides: Vec<(usize, u8, bool, bool)>,
    best_count: [usize; 6],
    best_qv_sum: [u32; 6],
    other_count: [usize; 6],
    guide_count: [usize; 6],
    /// Number of non-unitig beads
    frag_cov: usize,
    /// First base of a non-unitig guide
    public_base: Option<u8>
}

/// Multiplies the candidate likelihoods by one observation.
fn update_tau(tau: &mut [f64; 5], index: usize, qv: u8) {
    let qv = if qv == 0 { GAP_FALLBACK_QV } else { qv };
    for (bi, t) in tau.iter_mut().enumerate() {
        if bi == index {
            *t *= correct_prob(qv);
        } else {
            *t *= TAU_MISMATCH * error_prob(qv);
        }
    }
}

impl ConsensusWorkspace {
    /// Computes the consensus call of a column and writes it into the call bead.
    /// # Arguments
    /// * `cid` - the column to call
    /// * `mode` - how to compute the call
    /// * `clusters` - the allele assignment of the reads in the current region, if any
    /// * `target` - restrict the evidence to the reads of this allele, None to use every read
    /// # Errors
    /// * if the column or any bead in it is invalid
    /// * if the column is empty and the mode is `Promote`
    pub fn base_call(&mut self, cid: ColumnId, mode: CallMode, clusters: Option<&ReadClusters>, target: Option<usize>) -> Result<BaseCallOutcome, Box<dyn std::error::Error>> {
        match mode {
            CallMode::Promote => self.promote_call(cid),
            CallMode::Plurality => self.plurality_call(cid),
            CallMode::Probabilistic => self.probabilistic_call(cid, clusters, target)
        }
    }

    fn promote_call(&mut self, cid: ColumnId) -> Result<BaseCallOutcome, Box<dyn std::error::Error>> {
        let call = self.column(cid)?.call;
        let Some(top) = self.bead(call)?.down else {
            simple_error::bail!("internal error: cannot promote a call in empty column {cid:?}");
        };
        let base = self.bead_char(top)?;
        let qv = self.bead_qv(top)?;
        self.set_bead_symbol(call, base, qv)?;
        Ok(BaseCallOutcome { base, qv, score: 0, var: 0.0 })
    }

    fn plurality_call(&mut self, cid: ColumnId) -> Result<BaseCallOutcome, Box<dyn std::error::Error>> {
        let column = *self.column(cid)?;
        let counts = *column.base_count.counts();
        let max_count = counts.iter().copied().max().unwrap_or(0);
        let mut candidates: Vec<usize> = (0..ALPHABET.len())
            .filter(|&i| counts[i] == max_count)
            .collect();
        if candidates.len() > 1 {
            // a tie is never broken towards a gap
            candidates.retain(|&i| i != GAP_INDEX);
        }
        let index = resolve_tie(&candidates, self.rng());
        let base = ALPHABET[index];
        self.set_bead_symbol(column.call, base, 0)?;
        let score = column.base_count.depth() - counts[index];
        Ok(BaseCallOutcome { base, qv: 0, score, var: 0.0 })
    }

    /// Sorts the beads of a column into best-allele reads, other reads, and guides.
    fn gather_evidence(&self, cid: ColumnId, clusters: Option<&ReadClusters>, target: Option<usize>) -> Result<ColumnEvidence, Box<dyn std::error::Error>> {
        let split_active = self.config().split_alleles && self.config().max_alleles >= 2;
        let mut evidence = ColumnEvidence::default();
        for bid in self.column_beads(cid)? {
            let base = self.bead_char(bid)?;
            if base == b'N' {
                continue;
            }
            let index = base_to_index(base).ok_or("internal error: bead symbol outside the alphabet")?;
            let qv = self.bead_qv(bid)?;
            let Some(fid) = self.bead(bid)?.frag else {
                simple_error::bail!("internal error: call bead {bid:?} stacked inside column {cid:?}");
            };
            let frag = self.fragment(fid)?;

            if frag.kind.is_read() {
                let is_best = match target {
                    None => true,
                    Some(_) if !split_active => true,
                    Some(t) => clusters
                        .map(|c| c.num_reads() > 0 && c.allele_of(fid) == Some(t))
                        .unwrap_or(false)
                };
                if is_best {
                    evidence.best_count[index] += 1;
                    evidence.best_qv_sum[index] += qv as u32;
                    evidence.best_reads.push((index, qv));
                } else {
                    evidence.other_count[index] += 1;
                    evidence.other_reads.push((index, qv));
                }
            } else {
                let is_unitig = frag.kind == FragmentKind::Unitig;
                evidence.guide_count[index] += 1;
                evidence.guides.push((index, qv, is_unitig, frag.unitig_kind.is_surrogate()));
                if !is_unitig && evidence.public_base.is_none() {
                    evidence.public_base = Some(base.to_ascii_uppercase());
                }
            }

            if frag.kind != FragmentKind::Unitig {
                evidence.frag_cov += 1;
            }
        }
        Ok(evidence)
    }

    fn probabilistic_call(&mut self, cid: ColumnId, clusters: Option<&ReadClusters>, target: Option<usize>) -> Result<BaseCallOutcome, Box<dyn std::error::Error>> {
        let evidence = self.gather_evidence(cid, clusters, target)?;

        let mut tau = [1.0f64; 5];
        let mut last_qv = 0u8;
        let mut used_surrogate = false;
        let reads = if !evidence.best_reads.is_empty() { &evidence.best_reads } else { &evidence.other_reads };
        for &(index, qv) in reads.iter() {
            update_tau(&mut tau, index, qv);
            last_qv = if qv == 0 { GAP_FALLBACK_QV } else { qv };
        }
        if reads.is_empty() {
            // no read covers this column, fall back on the other sequences
            for &(index, qv, is_unitig, is_surrogate) in evidence.guides.iter() {
                if is_unitig && !is_surrogate {
                    continue;
                }
                used_surrogate = true;
                update_tau(&mut tau, index, qv);
                last_qv = if qv == 0 { GAP_FALLBACK_QV } else { qv };
            }
        }

        let weighted: Vec<f64> = tau.iter()
            .zip(COMP_BIAS.iter())
            .map(|(&t, &bias)| t * bias)
            .collect();
        let normalize: f64 = weighted.iter().sum();
        let cw: Vec<f64> = weighted.iter()
            .map(|&t| if normalize > 0.0 { t / normalize } else { t })
            .collect();

        let mut max_ind = GAP_INDEX;
        let mut max_cw = 0.0;
        let mut tied: Vec<usize> = vec![];
        for (bi, &w) in cw.iter().enumerate() {
            if w > max_cw + ZERO_PLUS {
                max_ind = bi;
                max_cw = w;
                tied.clear();
            } else if (w - max_cw).abs() < ZERO_PLUS {
                tied.push(bi);
            }
        }
        if max_cw.abs() < ZERO_PLUS {
            max_ind = GAP_INDEX;
        } else if !tied.is_empty() {
            let candidates: Vec<usize> = tied.into_iter()
                .chain(std::iter::once(max_ind))
                .sorted_unstable()
                .dedup()
                .collect();
            max_ind = resolve_tie(&candidates, self.rng());
            max_cw = cw[max_ind];
        }

        let mut base = ALPHABET[max_ind];
        let mut qv = if (max_cw - 1.0).abs() < ZERO_PLUS {
            CNS_MAX_QV
        } else {
            let q = if evidence.frag_cov != 1 || used_surrogate {
                (-10.0 * (1.0 - max_cw).log10()).round()
            } else {
                last_qv as f64
            };
            q.clamp(CNS_MIN_QV as f64, CNS_MAX_QV as f64) as u8
        };

        if self.config().call_public {
            if let Some(public) = evidence.public_base {
                if public != base {
                    trace!("Column {cid:?}: public call {} overrides {}", public as char, base as char);
                    base = public;
                    qv = 0;
                }
            }
        }

        let write = match (target, clusters) {
            (None, _) | (_, None) => true,
            (Some(t), Some(c)) => c.best_allele() == t
        };
        if write {
            let call = self.column(cid)?.call;
            self.set_bead_symbol(call, base, qv)?;
        }

        let mut score = 0;
        let mut sum_qv_all = 0u32;
        let mut sum_qv_cbase = 0u32;
        let b_read_count: usize = evidence.best_count[..N_INDEX].iter().sum();
        for bi in 0..N_INDEX {
            if bi != max_ind {
                score += evidence.best_count[bi] + evidence.other_count[bi] + evidence.guide_count[bi];
            }
            // a base counts towards variation if it is confirmed or of high enough quality
            if evidence.best_count[bi] > 1 || evidence.best_qv_sum[bi] > MIN_QV_FOR_VARIATION {
                sum_qv_all += evidence.best_qv_sum[bi];
                if ALPHABET[bi] == base {
                    sum_qv_cbase = evidence.best_qv_sum[bi];
                }
            }
        }
        let var = if b_read_count == 1 || sum_qv_all == 0 {
            0.0
        } else {
            1.0 - sum_qv_cbase as f64 / sum_qv_all as f64
        };

        Ok(BaseCallOutcome { base, qv, score, var })
    }

    /// Returns the bead of fragment `fid` in column `cid`, if it has one.
    /// # Errors
    /// * if the column is invalid
    pub fn column_bead_of(&self, cid: ColumnId, fid: crate::workspace::FragmentId) -> Result<Option<BeadId>, Box<dyn std::error::Error>> {
        for bid in self.column_beads(cid)? {
            if self.bead(bid)?.frag == Some(fid) {
                return Ok(Some(bid));
            }
        }
        Ok(None)
    }
}
