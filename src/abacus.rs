
/*!
Dense scratch copies of a window of the multi-alignment, used to try alternative gap placements.
An abacus has one row per fragment present in the window and three times the window width in columns.
The window itself is copied into the middle third, the outer thirds start as gaps so that a shift can slide
every base all the way to one side. Cells where a fragment has no bead hold `n`.
*/

use log::trace;
use rustc_hash::FxHashMap as HashMap;
use simple_error::bail;
use std::ops::Range;

use crate::allele::ReadClusters;
use crate::base_count::{base_to_index, ALPHABET, N_INDEX};
use crate::cns_config::{MAX_SIZE_OF_ADJUSTED_REGION, MSTRING_SIZE};
use crate::workspace::{ColumnId, ConsensusWorkspace, FragmentId};

/// Largest left interface adjustment that is still trusted
const MAX_LEFT_ADJUSTMENT: i64 = 5;
/// Windows whose most distant pair of rows differ in fewer cells are not split into alleles
const MIN_ALLELE_DISTANCE: i64 = 3;

/// Which third of the abacus holds the content
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Shift {
    /// Content is in the middle third, as copied
    #[default]
    Unshifted,
    /// Content was pushed into the left third
    Left,
    /// Content was pushed into the right third
    Right
}

/// Result of scoring an abacus
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AbacusScore {
    /// Number of non-gap cells disagreeing with their column call
    pub score: usize,
    /// Number of non-null columns
    pub columns: usize
}

/// The shifting plan for the short allele of a window with two alleles
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlleleTemplate {
    /// Allele of each row
    pub alleles: Vec<usize>,
    /// The allele whose consensus has the most gaps, only its rows are shifted
    pub short_allele: usize,
    /// Last abacus column of the left-shifting part, -1 if there is none
    pub lpos: i64,
    /// First abacus column of the right-shifting part, -1 if there is none
    pub rpos: i64,
    /// Call per abacus column the short allele is shifted against
    pub template: Vec<u8>
}

#[derive(Clone, Debug)]
pub struct Abacus {
    /// First column of the window
    start_column: ColumnId,
    /// Last column of the window
    end_column: ColumnId,
    /// Number of window columns
    window_width: usize,
    /// Fragment of each row
    fragments: Vec<FragmentId>,
    row_index: HashMap<FragmentId, usize>,
    /// Row-major cells, `rows * 3 * window_width`
    cells: Vec<u8>,
    /// Column calls, `n` for null columns
    calls: Vec<u8>,
    shift: Shift,
    /// Set once the short allele of a split window was shifted
    mixed: bool
}

impl Abacus {
    /// Creates an abacus with empty rows, the middle third is `n` and the flanks are gaps.
    fn new(start_column: ColumnId, end_column: ColumnId, window_width: usize, fragments: Vec<FragmentId>) -> Abacus {
        let row_index = fragments.iter().enumerate().map(|(i, &f)| (f, i)).collect();
        let num_columns = 3 * window_width;
        let mut cells = vec![b'-'; fragments.len() * num_columns];
        for row in cells.chunks_mut(num_columns) {
            row[window_width..2 * window_width].fill(b'n');
        }
        Abacus {
            start_column,
            end_column,
            window_width,
            fragments,
            row_index,
            cells,
            calls: vec![b'n'; num_columns],
            shift: Shift::Unshifted,
            mixed: false
        }
    }

    pub fn get(&self, i: usize, j: usize) -> u8 {
        self.cells[i * self.num_columns() + j]
    }

    fn set(&mut self, i: usize, j: usize, c: u8) {
        let num_columns = self.num_columns();
        self.cells[i * num_columns + j] = c;
    }

    /// Returns one full row
    pub fn row(&self, i: usize) -> &[u8] {
        let num_columns = self.num_columns();
        &self.cells[i * num_columns..(i + 1) * num_columns]
    }

    /// The abacus columns holding the content for the current shift
    pub fn content_range(&self) -> Range<usize> {
        let w = self.window_width;
        match self.shift {
            Shift::Left => 0..w,
            Shift::Unshifted => w..2 * w,
            Shift::Right => 2 * w..3 * w
        }
    }

    /// Scores the abacus and stores the majority call of every column.
    /// A gap next to an `n` cell is treated as `n`, so fragment ends are not charged.
    pub fn score(&mut self) -> AbacusScore {
        let num_columns = self.num_columns();
        let mut counts = vec![[0usize; 6]; num_columns];
        for i in 0..self.num_rows() {
            for (j, count) in counts.iter_mut().enumerate() {
                let mut b = self.get(i, j);
                if b == b'-' && j > 0 && j + 1 < num_columns
                    && (self.get(i, j - 1) == b'n' || self.get(i, j + 1) == b'n') {
                    b = b'n';
                }
                count[base_to_index(b).unwrap_or(N_INDEX)] += 1;
            }
        }

        let mut result = AbacusScore::default();
        for (j, count) in counts.iter().enumerate() {
            let depth: usize = count.iter().sum();
            if count[0] + count[N_INDEX] == depth {
                self.calls[j] = b'n';
                continue;
            }
            result.columns += 1;
            let max_count = count[..N_INDEX].iter().copied().max().unwrap_or(0);
            // ties prefer a base over a gap, then the lowest index
            let call = (1..N_INDEX).find(|&k| count[k] == max_count).unwrap_or(0);
            self.calls[j] = ALPHABET[call];
            result.score += depth - count[call] - count[N_INDEX];
        }
        result
    }

    /// Counts the gap runs opened inside the content third, the tie-breaker between equal scores.
    pub fn affine_score(&self) -> usize {
        let range = self.content_range();
        (0..self.num_rows())
            .map(|i| {
                let row = &self.row(i)[range.clone()];
                let mut in_gap = false;
                let mut opened = 0;
                for &b in row {
                    if b != b'-' {
                        in_gap = false;
                    } else if !in_gap {
                        in_gap = true;
                        opened += 1;
                    }
                }
                opened
            })
            .sum()
    }

    /// Sweeps left to right and merges each column into its right neighbor when no row has a base in both.
    /// Returns the number of merged column pairs.
    pub fn merge(&mut self) -> usize {
        let num_columns = self.num_columns();
        let rows = self.num_rows();

        // trailing columns that are all gaps are left alone
        let mut last_non_null = num_columns - 1;
        for j in (1..num_columns).rev() {
            if (0..rows).any(|i| self.get(i, j) != b'-') {
                break;
            }
            last_non_null = j;
        }

        let mut merged = 0;
        for j in 0..last_non_null {
            let mut merge_ok = true;
            let mut next_column_good = false;
            for i in 0..rows {
                let (b, m) = (self.get(i, j), self.get(i, j + 1));
                if b != b'-' && m != b'-' && (b != b'n' || m != b'n') {
                    merge_ok = false;
                    break;
                }
                if m != b'-' && m != b'n' {
                    next_column_good = true;
                }
            }
            if !(merge_ok && next_column_good) {
                continue;
            }
            merged += 1;
            for i in 0..rows {
                let (b, m) = (self.get(i, j), self.get(i, j + 1));
                if b != b'-' && b != b'n' {
                    self.set(i, j, m);
                    self.set(i, j + 1, b);
                }
            }
        }
        merged
    }

    /// Moves the base at `(i, j)` as far left as the gaps allow, onto the first column whose call it agrees with.
    /// Columns without a call adopt the base.
    fn place_left(&mut self, i: usize, j: usize, lower: usize) {
        let c = self.get(i, j);
        if c == b'-' {
            return;
        }
        let mut ccol = j;
        while ccol > lower && self.get(i, ccol - 1) == b'-' {
            ccol -= 1;
        }
        for pcol in ccol..j {
            let call = self.calls[pcol];
            if call != b'n' && call != c && c != b'n' {
                continue;
            }
            if call == b'n' {
                self.calls[pcol] = c;
            }
            if self.calls[pcol] == c || c == b'n' {
                self.set(i, j, b'-');
                self.set(i, pcol, c);
                break;
            }
        }
        if self.get(i, j) != b'-' {
            self.calls[j] = c;
        }
    }

    /// Mirror of [`Abacus::place_left`], `upper` is exclusive.
    fn place_right(&mut self, i: usize, j: usize, upper: usize) {
        let c = self.get(i, j);
        if c == b'-' {
            return;
        }
        let mut ccol = j;
        while ccol + 1 < upper && self.get(i, ccol + 1) == b'-' {
            ccol += 1;
        }
        for pcol in ((j + 1)..=ccol).rev() {
            let call = self.calls[pcol];
            if call != b'n' && call != c && c != b'n' {
                continue;
            }
            if call == b'n' {
                self.calls[pcol] = c;
            }
            if self.calls[pcol] == c || c == b'n' {
                self.set(i, j, b'-');
                self.set(i, pcol, c);
                break;
            }
        }
        if self.get(i, j) != b'-' {
            self.calls[j] = c;
        }
    }

    /// Pushes every base of the window into the left third, then merges and scores.
    pub fn left_shift(&mut self) -> AbacusScore {
        self.calls.fill(b'n');
        let w = self.window_width;
        for j in w..2 * w {
            for i in 0..self.num_rows() {
                self.place_left(i, j, 0);
            }
        }
        self.merge();
        self.shift = Shift::Left;
        self.score()
    }

    /// Pushes every base of the window into the right third, then merges and scores.
    pub fn right_shift(&mut self) -> AbacusScore {
        self.calls.fill(b'n');
        let w = self.window_width;
        let num_columns = self.num_columns();
        for j in (w..2 * w).rev() {
            for i in 0..self.num_rows() {
                self.place_right(i, j, num_columns);
            }
        }
        self.merge();
        self.shift = Shift::Right;
        self.score()
    }

    /// Shifts only the rows of the short allele against a template, left of `lpos` to the left and right of `rpos` to the right.
    /// The content stays in its current third.
    pub fn mixed_shift(&mut self, plan: &AlleleTemplate) -> AbacusScore {
        let range = self.content_range();
        for j in range.clone() {
            self.calls[j] = plan.template.get(j).copied().unwrap_or(b'n');
        }
        let short_rows: Vec<usize> = (0..self.num_rows())
            .filter(|&i| plan.alleles.get(i) == Some(&plan.short_allele))
            .collect();

        if plan.lpos >= range.start as i64 {
            let last = (plan.lpos as usize).min(range.end - 1);
            for j in range.start..=last {
                for &i in short_rows.iter() {
                    self.place_left(i, j, range.start);
                }
            }
        }
        let stop = if plan.rpos > 0 { plan.rpos as usize } else { range.end };
        for j in ((stop + 1)..range.end).rev() {
            for &i in short_rows.iter() {
                self.place_right(i, j, range.end);
            }
        }

        self.merge();
        self.mixed = true;
        self.score()
    }

    /// Pairwise row distances over all columns, cells holding `n` are ignored.
    /// Returns the matrix and its largest entry.
    pub fn row_distances(&self) -> (Vec<Vec<i64>>, i64) {
        let rows = self.num_rows();
        let mut dist = vec![vec![0i64; rows]; rows];
        let mut max_element = 0;
        for i in 0..rows {
            for j in (i + 1)..rows {
                let d = self.row(i).iter()
                    .zip(self.row(j).iter())
                    .filter(|&(&a, &b)| a != b && a != b'n' && b != b'n')
                    .count() as i64;
                dist[i][j] = d;
                dist[j][i] = d;
                max_element = max_element.max(d);
            }
        }
        (dist, max_element)
    }

    /// Splits the rows into two alleles and works out how the short allele should be shifted.
    /// Returns None when the window does not look like two alleles, or when the short allele has nothing to shift.
    pub fn allele_template(&self) -> Option<AlleleTemplate> {
        let (dist, max_element) = self.row_distances();
        if max_element < MIN_ALLELE_DISTANCE {
            return None;
        }
        let support = (0..self.num_rows())
            .map(|i| self.row(i).iter().filter(|&&c| c != b'-' && c != b'n').count() as u32)
            .collect();
        let mut clusters = ReadClusters::from_distances(self.fragments.clone(), dist, support);
        clusters.cluster();
        let alleles = clusters.alleles().to_vec();

        let consensus: [Vec<u8>; 2] = [0, 1].map(|allele| {
            (0..self.num_columns())
                .map(|j| {
                    let mut count = [0usize; 6];
                    for i in (0..self.num_rows()).filter(|&i| alleles[i] == allele) {
                        count[base_to_index(self.get(i, j)).unwrap_or(N_INDEX)] += 1;
                    }
                    allele_call(&count)
                })
                .collect()
        });
        let gap_count = [count_gaps(&consensus[0]), count_gaps(&consensus[1])];
        let short_allele = if gap_count[0] >= gap_count[1] { 0 } else { 1 };
        let long_allele = 1 - short_allele;
        if gap_count[short_allele] == 0 {
            return None;
        }

        let ungapped = [UngappedConsensus::new(&consensus[0]), UngappedConsensus::new(&consensus[1])];
        if ungapped.iter().any(|u| u.bases.len() < MSTRING_SIZE) {
            return None;
        }
        let pair = AllelePair { ungapped: &ungapped, short: short_allele, long: long_allele };
        let adj_left = pair.adjusted_left_bounds();
        let adj_right = pair.adjusted_right_bounds();
        let (mut lpos, lscore) = pair.left_score(&adj_left);
        let (mut rpos, rscore) = pair.right_score(&adj_right);
        adjust_interfaces(&mut lpos, &mut rpos, lscore, rscore, &adj_left, &adj_right, long_allele);
        let template = pair.template(&consensus[long_allele], lpos, rpos, &adj_left, &adj_right);
        trace!("Allele split: short allele {short_allele}, gaps {gap_count:?}, interfaces {lpos}/{rpos}");

        Some(AlleleTemplate {
            alleles,
            short_allele,
            lpos,
            rpos,
            template
        })
    }

    /// Returns the row of a fragment
    pub fn row_of(&self, fid: FragmentId) -> Option<usize> {
        self.row_index.get(&fid).copied()
    }

    // Getters
    pub fn start_column(&self) -> ColumnId {
        self.start_column
    }

    pub fn end_column(&self) -> ColumnId {
        self.end_column
    }

    pub fn window_width(&self) -> usize {
        self.window_width
    }

    pub fn num_rows(&self) -> usize {
        self.fragments.len()
    }

    pub fn num_columns(&self) -> usize {
        3 * self.window_width
    }

    pub fn calls(&self) -> &[u8] {
        &self.calls
    }

    pub fn shift(&self) -> Shift {
        self.shift
    }

    pub fn is_mixed(&self) -> bool {
        self.mixed
    }
}

/// Majority call of one allele column, `N` when the two best symbols tie.
fn allele_call(count: &[usize; 6]) -> u8 {
    let (mut best, mut second, mut base) = (0, 0, b'N');
    for (k, &c) in count.iter().enumerate() {
        if best < c {
            second = best;
            best = c;
            base = ALPHABET[k];
        } else if second < c {
            second = c;
        }
    }
    if best == second { b'N' } else { base }
}

/// Number of gaps between the first and the last base of a gapped consensus.
fn count_gaps(consensus: &[u8]) -> usize {
    let Some(first) = consensus.iter().position(|&c| c != b'-') else {
        return 0;
    };
    let last = consensus.iter().rposition(|&c| c != b'-').unwrap_or(first);
    consensus[first..=last].iter().filter(|&&c| c == b'-').count()
}

/// An allele consensus with its gaps removed
#[derive(Clone, Debug)]
struct UngappedConsensus {
    bases: Vec<u8>,
    /// Gapped position of each ungapped base
    imap: Vec<usize>
}

impl UngappedConsensus {
    fn new(consensus: &[u8]) -> UngappedConsensus {
        let (imap, bases) = consensus.iter()
            .enumerate()
            .filter(|&(_, &c)| c != b'-')
            .map(|(j, &c)| (j, c))
            .unzip();
        UngappedConsensus { bases, imap }
    }

    fn len(&self) -> i64 {
        self.bases.len() as i64
    }

    /// Gapped position of ungapped position `k`, positions past the end map onto themselves
    fn gapped(&self, k: i64) -> i64 {
        if k < 0 {
            return k;
        }
        self.imap.get(k as usize).map(|&j| j as i64).unwrap_or(k)
    }

    fn base(&self, k: i64) -> u8 {
        self.bases[k as usize]
    }

    fn kmer(&self, k: i64) -> &[u8] {
        &self.bases[k as usize..k as usize + MSTRING_SIZE]
    }
}

/// The two ungapped allele consensi, indexed by allele
struct AllelePair<'a> {
    ungapped: &'a [UngappedConsensus; 2],
    short: usize,
    long: usize
}

impl AllelePair<'_> {
    /// Leftmost pair of positions where the alleles share a k-mer, minimizing the sum of both offsets.
    fn adjusted_left_bounds(&self) -> [i64; 2] {
        let (s_cons, l_cons) = (&self.ungapped[self.short], &self.ungapped[self.long]);
        let m = MSTRING_SIZE as i64;
        let mut adj = [0i64; 2];
        adj[self.short] = s_cons.len() - 1;
        adj[self.long] = l_cons.len() - 1;
        for s in 0..(s_cons.len() - m) {
            for l in 0..(l_cons.len() - m) {
                if s_cons.kmer(s) == l_cons.kmer(l) && adj[0] + adj[1] > s + l {
                    adj[self.long] = l;
                    adj[self.short] = s;
                }
            }
        }
        if adj[self.long] == l_cons.len() - 1 && adj[self.short] == s_cons.len() - 1 {
            adj = [0, 0];
        }
        adj
    }

    /// Mirror of [`AllelePair::adjusted_left_bounds`], offsets are measured from the right end.
    fn adjusted_right_bounds(&self) -> [i64; 2] {
        let (s_cons, l_cons) = (&self.ungapped[self.short], &self.ungapped[self.long]);
        let m = MSTRING_SIZE as i64;
        let mut adj = [0i64; 2];
        adj[self.short] = s_cons.len() - 1;
        adj[self.long] = l_cons.len() - 1;
        for s in (0..(s_cons.len() - m)).rev() {
            for l in (0..(l_cons.len() - m)).rev() {
                let s_off = s_cons.len() - 1 - (s + m);
                let l_off = l_cons.len() - 1 - (l + m);
                if s_cons.kmer(s) == l_cons.kmer(l) && adj[0] + adj[1] > s_off + l_off {
                    adj[self.long] = l_off;
                    adj[self.short] = s_off;
                }
            }
        }
        if adj[self.long] == l_cons.len() - 1 && adj[self.short] == s_cons.len() - 1 {
            adj = [0, 0];
        }
        adj
    }

    /// Walks both alleles right from the left bounds, +1 per agreement and -1 per disagreement.
    /// Returns the gapped position of the best prefix end and its score.
    fn left_score(&self, adj_left: &[i64; 2]) -> (i64, i64) {
        let (s_cons, l_cons) = (&self.ungapped[self.short], &self.ungapped[self.long]);
        let (mut score, mut max_score) = (0, 0);
        let mut max_pos = adj_left[self.short];
        let mut i = 0;
        while i < s_cons.len() - adj_left[self.short] && i < l_cons.len() - adj_left[self.long] {
            let spos = i + adj_left[self.short];
            let lpos = i + adj_left[self.long];
            score += if s_cons.base(spos) == l_cons.base(lpos) { 1 } else { -1 };
            if max_score < score {
                max_score = score;
                max_pos = spos;
            }
            i += 1;
        }
        (s_cons.gapped(max_pos), max_score)
    }

    /// Mirror of [`AllelePair::left_score`] walking left from the right bounds.
    fn right_score(&self, adj_right: &[i64; 2]) -> (i64, i64) {
        let (s_cons, l_cons) = (&self.ungapped[self.short], &self.ungapped[self.long]);
        let (mut score, mut max_score) = (0, 0);
        let mut max_pos = s_cons.len() - 1 - adj_right[self.short];
        let mut i = l_cons.len() - 1;
        let mut j = s_cons.len() - 1;
        while j >= adj_right[self.short] && i >= adj_right[self.long] {
            let spos = j - adj_right[self.short];
            let lpos = i - adj_right[self.long];
            score += if s_cons.base(spos) == l_cons.base(lpos) { 1 } else { -1 };
            if max_score < score {
                max_score = score;
                max_pos = spos;
            }
            i -= 1;
            j -= 1;
        }
        (s_cons.gapped(max_pos), max_score)
    }

    /// Builds the template from the long allele consensus, masking with `n` the positions where the alleles disagree.
    fn template(&self, long_consensus: &[u8], lpos: i64, rpos: i64, adj_left: &[i64; 2], adj_right: &[i64; 2]) -> Vec<u8> {
        let (s_cons, l_cons) = (&self.ungapped[self.short], &self.ungapped[self.long]);
        let mut template = long_consensus.to_vec();
        let mut mask = |template: &mut Vec<u8>, j: i64| {
            if let Some(c) = usize::try_from(j).ok().and_then(|j| template.get_mut(j)) {
                if *c != b'-' {
                    *c = b'n';
                }
            }
        };

        // disagreements left of the left interface
        let mut i = 0;
        while l_cons.gapped(i) <= lpos
            && i < s_cons.len() - adj_left[self.short]
            && i < l_cons.len() - adj_left[self.long] {
            let lp = i + adj_left[self.long];
            let sp = i + adj_left[self.short];
            if s_cons.base(sp) != l_cons.base(lp) {
                mask(&mut template, l_cons.gapped(lp));
            }
            i += 1;
        }

        // as many long allele bases before the left bound as the short allele has there
        if adj_left[self.long] > 0 && lpos > 0 {
            let mut i = l_cons.gapped(adj_left[self.long] - 1);
            let mut masked = 0;
            while masked < adj_left[self.short] && i >= 0 {
                if long_consensus[i as usize] != b'-' {
                    template[i as usize] = b'n';
                    masked += 1;
                }
                i -= 1;
            }
        }

        // disagreements right of the right interface
        let mut i = l_cons.len() - 1 - adj_right[self.long];
        let mut j = s_cons.len() - 1 - adj_right[self.short];
        while i >= adj_left[self.long] && j >= adj_left[self.short] && l_cons.gapped(i) > rpos {
            if s_cons.base(j) != l_cons.base(i) {
                mask(&mut template, l_cons.gapped(i));
            }
            i -= 1;
            j -= 1;
        }

        // long allele bases after the right bound
        if adj_right[self.long] > 0 && rpos > 0 {
            for i in (l_cons.len() - adj_right[self.long])..l_cons.len() {
                mask(&mut template, l_cons.gapped(i));
            }
        }
        template
    }
}

/// Drops interfaces that needed too large an adjustment and resolves crossing interfaces in favor of the better score.
fn adjust_interfaces(lpos: &mut i64, rpos: &mut i64, mut lscore: i64, mut rscore: i64, adj_left: &[i64; 2], adj_right: &[i64; 2], long_allele: usize) {
    if adj_left[long_allele] > MAX_LEFT_ADJUSTMENT {
        *lpos = -1;
        lscore = -1;
    }
    if adj_right[long_allele] > MAX_SIZE_OF_ADJUSTED_REGION as i64 {
        *rpos = -1;
        rscore = -1;
    }
    if *lpos <= *rpos {
        return;
    }
    if lscore > 0 && rscore > 0 {
        if lscore > rscore {
            *rpos = *lpos;
        } else {
            *lpos = *rpos;
        }
    } else if lscore > 0 {
        *rpos = -1;
    } else {
        *lpos = -1;
    }
}

impl ConsensusWorkspace {
    /// Copies the columns from `start` up to (excluding) `end` into a new abacus.
    /// Every fragment with a bead in any window column gets a row, in order of first appearance.
    /// # Arguments
    /// * `start` - the first window column
    /// * `end` - the column after the window, None to run to the end of the node
    /// # Errors
    /// * if the window is empty
    /// * if any column or bead is invalid
    pub fn create_abacus(&self, start: ColumnId, end: Option<ColumnId>) -> Result<Abacus, Box<dyn std::error::Error>> {
        let mut window = vec![];
        let mut current = Some(start);
        while let Some(cid) = current {
            if Some(cid) == end {
                break;
            }
            window.push(cid);
            current = self.column(cid)?.next;
        }
        let Some(&last) = window.last() else {
            bail!("internal error: empty abacus window at {start:?}");
        };

        let mut fragments = vec![];
        let mut seen = rustc_hash::FxHashSet::default();
        let mut stacks = Vec::with_capacity(window.len());
        for &cid in window.iter() {
            let mut stack = vec![];
            for bid in self.column_beads(cid)? {
                let Some(fid) = self.bead(bid)?.frag else {
                    continue;
                };
                if seen.insert(fid) {
                    fragments.push(fid);
                }
                stack.push((fid, self.bead_char(bid)?));
            }
            stacks.push(stack);
        }

        let mut abacus = Abacus::new(start, last, window.len(), fragments);
        let w = abacus.window_width;
        for (k, stack) in stacks.into_iter().enumerate() {
            for (fid, c) in stack {
                if let Some(i) = abacus.row_of(fid) {
                    abacus.set(i, w + k, c);
                }
            }
        }
        trace!("Abacus {start:?}..{last:?}: {} rows, {w} columns", abacus.num_rows());
        Ok(abacus)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an abacus from the middle third of each row
    pub(crate) fn from_rows(rows: &[&[u8]]) -> Abacus {
        let w = rows[0].len();
        let fragments = (0..rows.len()).map(FragmentId).collect();
        let mut abacus = Abacus::new(ColumnId(0), ColumnId(w - 1), w, fragments);
        for (i, row) in rows.iter().enumerate() {
            for (k, &c) in row.iter().enumerate() {
                abacus.set(i, w + k, c);
            }
        }
        abacus
    }

    fn third(abacus: &Abacus, i: usize, range: Range<usize>) -> String {
        String::from_utf8(abacus.row(i)[range].to_vec()).unwrap()
    }

    #[test]
    fn test_score() {
        let mut abacus = from_rows(&[b"A-AC", b"AA-C"]);
        let score = abacus.score();
        assert_eq!(score, AbacusScore { score: 2, columns: 4 });
        assert_eq!(&abacus.calls()[4..8], b"AAAC");
        assert_eq!(abacus.calls()[0], b'n');
    }

    #[test]
    fn test_score_ignores_fragment_ends() {
        // the second row ends early, its trailing gap touches an n and is not charged
        let mut abacus = from_rows(&[b"ACGT", b"AC-n"]);
        let score = abacus.score();
        assert_eq!(score, AbacusScore { score: 0, columns: 4 });
    }

    #[test]
    fn test_left_shift() {
        let mut abacus = from_rows(&[b"A-AC", b"AA-C"]);
        let score = abacus.left_shift();
        assert_eq!(abacus.shift(), Shift::Left);
        assert_eq!(third(&abacus, 0, 0..4), "AAC-");
        assert_eq!(third(&abacus, 1, 0..4), "AAC-");
        assert_eq!(score, AbacusScore { score: 0, columns: 3 });
    }

    #[test]
    fn test_right_shift() {
        let mut abacus = from_rows(&[b"A-AC", b"AA-C"]);
        let score = abacus.right_shift();
        assert_eq!(abacus.shift(), Shift::Right);
        assert_eq!(third(&abacus, 0, 8..12), "-AAC");
        assert_eq!(third(&abacus, 1, 8..12), "-AAC");
        assert_eq!(score, AbacusScore { score: 0, columns: 3 });
    }

    #[test]
    fn test_merge() {
        let mut abacus = from_rows(&[b"A-AC", b"AA-C"]);
        assert!(abacus.merge() > 0);
        assert_eq!(third(&abacus, 0, 4..8), "A-AC");
        assert_eq!(third(&abacus, 1, 4..8), "A-AC");
        assert_eq!(abacus.score(), AbacusScore { score: 0, columns: 3 });
    }

    #[test]
    fn test_affine_score() {
        let abacus = from_rows(&[b"A-AC", b"A--C", b"AAAC"]);
        assert_eq!(abacus.affine_score(), 2);
    }

    #[test]
    fn test_row_distances() {
        let abacus = from_rows(&[b"ACGT", b"AGGA", b"nnGT"]);
        let (dist, max_element) = abacus.row_distances();
        assert_eq!(dist[0][1], 2);
        assert_eq!(dist[1][0], 2);
        assert_eq!(dist[0][2], 0);
        assert_eq!(dist[1][2], 1);
        assert_eq!(max_element, 2);
        assert!(abacus.allele_template().is_none());
    }

    #[test]
    fn test_allele_call() {
        assert_eq!(allele_call(&[0, 3, 1, 0, 0, 0]), b'A');
        assert_eq!(allele_call(&[2, 2, 0, 0, 0, 0]), b'N');
        assert_eq!(allele_call(&[0; 6]), b'N');
        assert_eq!(allele_call(&[3, 0, 0, 1, 0, 0]), b'-');
    }

    #[test]
    fn test_count_gaps() {
        assert_eq!(count_gaps(b"--A-C--G--"), 3);
        assert_eq!(count_gaps(b"----"), 0);
        assert_eq!(count_gaps(b"ACGT"), 0);
    }

    #[test]
    fn test_adjusted_bounds() {
        let ungapped = [UngappedConsensus::new(b"AC-GTT"), UngappedConsensus::new(b"GACGTT")];
        let pair = AllelePair { ungapped: &ungapped, short: 0, long: 1 };
        assert_eq!(ungapped[0].imap, vec![0, 1, 3, 4, 5]);
        assert_eq!(pair.adjusted_left_bounds(), [0, 1]);
        assert_eq!(pair.adjusted_right_bounds(), [0, 0]);
    }

    #[test]
    fn test_adjust_interfaces() {
        let (mut lpos, mut rpos) = (8, 4);
        adjust_interfaces(&mut lpos, &mut rpos, 3, 2, &[0, 0], &[0, 0], 1);
        assert_eq!((lpos, rpos), (8, 8));

        let (mut lpos, mut rpos) = (8, 4);
        adjust_interfaces(&mut lpos, &mut rpos, 3, 2, &[0, 9], &[0, 0], 1);
        assert_eq!((lpos, rpos), (-1, 4));

        let (mut lpos, mut rpos) = (2, 6);
        adjust_interfaces(&mut lpos, &mut rpos, 3, 2, &[0, 0], &[0, 0], 1);
        assert_eq!((lpos, rpos), (2, 6));
    }

    #[test]
    fn test_mixed_shift_moves_short_rows_only() {
        let mut abacus = from_rows(&[b"ACGTA", b"A-CGT"]);
        let plan = AlleleTemplate {
            alleles: vec![0, 1],
            short_allele: 1,
            lpos: 9,
            rpos: -1,
            template: b"-----ACGT------".to_vec()
        };
        abacus.mixed_shift(&plan);
        assert!(abacus.is_mixed());
        assert_eq!(abacus.shift(), Shift::Unshifted);
        assert_eq!(third(&abacus, 0, 5..10), "ACGTA");
        assert_eq!(third(&abacus, 1, 5..10), "ACGT-");
    }

    #[test]
    fn test_create_abacus() {
        use crate::base_call::CallMode;
        use crate::workspace::FragmentKind;

        let mut ws = ConsensusWorkspace::default();
        let seq = b"ACGTACGT";
        let fid = ws.append_fragment(1, FragmentKind::Read, seq, &[30; 8], false).unwrap();
        let mid = ws.create_manode(1);
        ws.seed_with_fragment(mid, fid, CallMode::Promote).unwrap();
        let columns = ws.column_order(mid).unwrap();

        let abacus = ws.create_abacus(columns[2], Some(columns[6])).unwrap();
        assert_eq!(abacus.num_rows(), 1);
        assert_eq!(abacus.window_width(), 4);
        assert_eq!(abacus.end_column(), columns[5]);
        assert_eq!(abacus.row(0), b"----GTAC----");
        assert_eq!(abacus.row_of(fid), Some(0));

        let tail = ws.create_abacus(columns[6], None).unwrap();
        assert_eq!(tail.row(0), b"--GT--");
    }
}
