
use rand::rngs::StdRng;
use rand::Rng;
use simple_error::bail;

use crate::cns_config::CNS_MAX_QV;

/// The alphabet in index order, gap first and the ambiguity code last
pub const ALPHABET: [u8; 6] = *b"-ACGTN";
/// Index of the gap symbol
pub const GAP_INDEX: usize = 0;
/// Index of the ambiguity symbol
pub const N_INDEX: usize = 5;

/// Converts a symbol into its alphabet index, returns None for anything outside `-ACGTN` (case-insensitive).
pub fn base_to_index(c: u8) -> Option<usize> {
    match c.to_ascii_uppercase() {
        b'-' => Some(0),
        b'A' => Some(1),
        b'C' => Some(2),
        b'G' => Some(3),
        b'T' => Some(4),
        b'N' => Some(5),
        _ => None
    }
}

/// Probability that a base with quality `qv` is wrong, capped at the max quality.
pub fn error_prob(qv: u8) -> f64 {
    let q = qv.min(CNS_MAX_QV) as f64;
    10f64.powf(-q / 10.0)
}

/// Probability that a base with quality `qv` is correct.
pub fn correct_prob(qv: u8) -> f64 {
    1.0 - error_prob(qv)
}

/// Picks one candidate from a non-empty list of tied alphabet indices.
/// Without an RNG the first candidate wins, otherwise it is a uniform draw.
/// # Arguments
/// * `candidates` - the tied indices, in ascending order
/// * `rng` - optional random source
pub fn resolve_tie(candidates: &[usize], rng: Option<&mut StdRng>) -> usize {
    match (candidates.len(), rng) {
        (0, _) => GAP_INDEX,
        (1, _) | (_, None) => candidates[0],
        (n, Some(r)) => candidates[r.gen_range(0..n)]
    }
}

/// Running tally of the symbols stacked in one column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BaseCount {
    /// Total number of beads counted
    depth: usize,
    /// Count per alphabet index
    count: [usize; 6]
}

impl BaseCount {
    /// Adds one observation of `c`.
    /// # Errors
    /// * if `c` is not part of the alphabet
    pub fn increment(&mut self, c: u8) -> Result<(), Box<dyn std::error::Error>> {
        let Some(index) = base_to_index(c) else {
            bail!("internal error: cannot count symbol {:?}", c as char);
        };
        self.count[index] += 1;
        self.depth += 1;
        Ok(())
    }

    /// Removes one observation of `c`.
    /// # Errors
    /// * if `c` is not part of the alphabet
    /// * if there is no observation of `c` to remove
    pub fn decrement(&mut self, c: u8) -> Result<(), Box<dyn std::error::Error>> {
        let Some(index) = base_to_index(c) else {
            bail!("internal error: cannot count symbol {:?}", c as char);
        };
        if self.count[index] == 0 || self.depth == 0 {
            bail!("internal error: base count underflow for {:?}", c as char);
        }
        self.count[index] -= 1;
        self.depth -= 1;
        Ok(())
    }

    /// Returns the most frequent symbol among indices `start..N`, ambiguity codes never win.
    /// Exact ties prefer a real base over a gap, then follow the tie policy carried by `rng`.
    /// # Arguments
    /// * `start` - 0 to allow a gap call, 1 to only consider bases
    /// * `rng` - optional random source for tie-breaking
    pub fn max_base(&self, start: usize, rng: Option<&mut StdRng>) -> u8 {
        let start = start.min(N_INDEX - 1);
        let max_count = (start..N_INDEX).map(|i| self.count[i]).max().unwrap_or(0);
        let mut candidates: Vec<usize> = (start..N_INDEX)
            .filter(|&i| self.count[i] == max_count)
            .collect();
        if candidates.len() > 1 && candidates[0] == GAP_INDEX {
            candidates.remove(0);
        }
        ALPHABET[resolve_tie(&candidates, rng)]
    }

    /// Number of beads that disagree with the majority symbol.
    pub fn mismatch(&self) -> usize {
        let max_count = (0..N_INDEX).map(|i| self.count[i]).max().unwrap_or(0);
        self.depth - max_count.min(self.depth)
    }

    // Getters
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the count for symbol `c`, 0 if the symbol is not in the alphabet.
    pub fn get(&self, c: u8) -> usize {
        base_to_index(c).map(|i| self.count[i]).unwrap_or(0)
    }

    pub fn counts(&self) -> &[usize; 6] {
        &self.count
    }

    /// True if every counted bead is a gap.
    pub fn is_null(&self) -> bool {
        self.depth == self.count[GAP_INDEX]
    }
}
