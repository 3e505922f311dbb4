use anyhow::{Context, Result, bail};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Substitution model family selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Equal exchange rates; the classical one-parameter model.
    Jc,
    /// Reversible rates re-estimated from pseudocounts (symmetrized).
    Gtr,
    /// Non-reversible rates re-estimated from pseudocounts (directional).
    Unrest,
}

impl ModelKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jc" => Ok(ModelKind::Jc),
            "gtr" => Ok(ModelKind::Gtr),
            "unrest" => Ok(ModelKind::Unrest),
            other => bail!("unknown substitution model {other:?} (expected jc, gtr or unrest)"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Jc => "jc",
            ModelKind::Gtr => "gtr",
            ModelKind::Unrest => "unrest",
        }
    }
}

/// The substitution model plus every per-reference table the likelihood
/// kernels read: rate matrix and transpose, diagonal, root frequencies in
/// several forms, the cumulative mutation-rate table and per-state cumulative
/// base counts over the reference.
///
/// All tables are rebuilt together by `rebuild_tables`; kernels borrow the
/// model immutably and never see a half-updated state.
#[derive(Debug, Clone)]
pub struct SubstModel<const S: usize> {
    pub kind: ModelKind,

    /// Rate matrix Q; rows sum to zero, diagonal negative.
    pub mutation: [[f64; S]; S],
    /// Qᵀ, kept explicitly for the child-to-parent direction.
    pub transposed: [[f64; S]; S],
    /// diag(Q).
    pub diagonal: [f64; S],
    /// Root state frequencies π.
    pub freqs: [f64; S],
    pub log_freqs: [f64; S],
    pub inv_freqs: [f64; S],
    /// flux_ratio[i][j] = π_i / π_j · q_ij.
    pub flux_ratio: [[f64; S]; S],
    /// freq_weighted_transposed[i][j] = π_j · q_ji.
    pub freq_weighted_transposed: [[f64; S]; S],

    /// cumulative_rate[p] = Σ_{x < p} q_{r_x r_x} over reference states r_x.
    pub cumulative_rate: Vec<f64>,
    /// cumulative_base[p][i] = #\{x < p : r_x = i\}.
    pub cumulative_base: Vec<[u32; S]>,

    /// Observed substitution events, with smoothing mass.
    pseudocount: Array2<f64>,
    pending_updates: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub model: String,
    pub num_states: usize,
    pub freqs: Vec<f64>,
    pub rates: Vec<Vec<f64>>,
}

impl<const S: usize> SubstModel<S> {
    /// Build the initial model from the reference sequence: equal exchange
    /// rates, root frequencies taken from the reference composition.
    pub fn new(kind: ModelKind, ref_seq: &[u8]) -> Result<Self> {
        if ref_seq.is_empty() {
            bail!("reference sequence is empty");
        }
        let mut freqs = [0.0f64; S];
        for &s in ref_seq {
            if (s as usize) >= S {
                bail!("reference contains state {s} outside the {S}-state alphabet");
            }
            freqs[s as usize] += 1.0;
        }
        // one pseudo-observation per state keeps every frequency positive
        let total = ref_seq.len() as f64 + S as f64;
        for f in freqs.iter_mut() {
            *f = (*f + 1.0) / total;
        }

        let mut rates = [[0.0f64; S]; S];
        for i in 0..S {
            for j in 0..S {
                if i != j {
                    rates[i][j] = 1.0 / (S as f64 - 1.0);
                }
            }
            rates[i][i] = -1.0;
        }

        let mut model = Self {
            kind,
            mutation: rates,
            transposed: [[0.0; S]; S],
            diagonal: [0.0; S],
            freqs,
            log_freqs: [0.0; S],
            inv_freqs: [0.0; S],
            flux_ratio: [[0.0; S]; S],
            freq_weighted_transposed: [[0.0; S]; S],
            cumulative_rate: Vec::new(),
            cumulative_base: Vec::new(),
            pseudocount: Array2::from_elem((S, S), 0.01),
            pending_updates: 0,
        };
        model.rebuild_tables(ref_seq);
        Ok(model)
    }

    /// Renormalize Q so the stationary flux Σ_i π_i·(−q_ii) equals one, then
    /// refresh every derived table.
    fn rebuild_tables(&mut self, ref_seq: &[u8]) {
        for i in 0..S {
            let off_diag: f64 = (0..S).filter(|&j| j != i).map(|j| self.mutation[i][j]).sum();
            self.mutation[i][i] = -off_diag;
        }
        let flux: f64 = (0..S).map(|i| -self.freqs[i] * self.mutation[i][i]).sum();
        if flux > 0.0 {
            let inv = 1.0 / flux;
            for row in self.mutation.iter_mut() {
                for q in row.iter_mut() {
                    *q *= inv;
                }
            }
        }

        for i in 0..S {
            self.diagonal[i] = self.mutation[i][i];
            self.log_freqs[i] = self.freqs[i].ln();
            self.inv_freqs[i] = 1.0 / self.freqs[i];
            for j in 0..S {
                self.transposed[i][j] = self.mutation[j][i];
            }
        }
        for i in 0..S {
            for j in 0..S {
                self.flux_ratio[i][j] = self.freqs[i] * self.inv_freqs[j] * self.mutation[i][j];
                self.freq_weighted_transposed[i][j] = self.freqs[j] * self.transposed[i][j];
            }
        }

        self.cumulative_rate.clear();
        self.cumulative_rate.reserve(ref_seq.len() + 1);
        self.cumulative_base.clear();
        self.cumulative_base.reserve(ref_seq.len() + 1);
        let mut rate_acc = 0.0;
        let mut base_acc = [0u32; S];
        self.cumulative_rate.push(0.0);
        self.cumulative_base.push(base_acc);
        for &s in ref_seq {
            rate_acc += self.diagonal[s as usize];
            base_acc[s as usize] += 1;
            self.cumulative_rate.push(rate_acc);
            self.cumulative_base.push(base_acc);
        }
    }

    #[inline]
    pub fn q_row(&self, i: u8) -> &[f64; S] {
        &self.mutation[i as usize]
    }

    #[inline]
    pub fn qt_row(&self, i: u8) -> &[f64; S] {
        &self.transposed[i as usize]
    }

    /// Σ of diag(Q) over a reference span `[start..=end]` (0-based inclusive).
    #[inline]
    pub fn span_rate(&self, start: usize, end: usize) -> f64 {
        self.cumulative_rate[end + 1] - self.cumulative_rate[start]
    }

    /// Count of reference state `i` over the span `[start..=end]`.
    #[inline]
    pub fn span_base(&self, start: usize, end: usize, i: usize) -> u32 {
        self.cumulative_base[end + 1][i] - self.cumulative_base[start][i]
    }

    /// Record one observed substitution `from → to`.
    #[inline]
    pub fn add_pseudocount(&mut self, from: u8, to: u8) {
        self.pseudocount[(from as usize, to as usize)] += 1.0;
    }

    /// Walk a freshly placed sample against the upper view at its new edge
    /// and count every concrete disagreement as one observed substitution.
    pub fn update_pseudo_count(
        &mut self,
        upper: &crate::region::RegionList<S>,
        sample: &crate::region::RegionList<S>,
        ref_seq: &[u8],
    ) {
        use crate::region::next_shared_segment;
        let genome_length = ref_seq.len();
        let a = upper.regions();
        let b = sample.regions();
        let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);
        while pos < genome_length {
            let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
            let r1 = &a[ia];
            let r2 = &b[ib];
            if r1.kind.is_concrete() && r2.kind.is_concrete() && r1.kind != r2.kind {
                let s1 = r1.kind.resolve(ref_seq[end]);
                let s2 = r2.kind.resolve(ref_seq[end]);
                if s1 != s2 {
                    self.add_pseudocount(s1, s2);
                }
            }
            pos = end + 1;
        }
    }

    pub fn note_placement(&mut self) {
        self.pending_updates += 1;
    }

    pub fn due_for_update(&self, period: u32) -> bool {
        self.pending_updates >= period
    }

    /// Re-estimate Q from the accumulated pseudocounts and rebuild the
    /// cumulative tables. Returns true when any diagonal entry moved by more
    /// than 1e-3, in which case cached likelihood lists must be refreshed.
    pub fn update_from_pseudocounts(&mut self, ref_seq: &[u8]) -> bool {
        self.pending_updates = 0;
        if self.kind == ModelKind::Jc {
            return false;
        }
        let old_diag = self.diagonal;
        for i in 0..S {
            for j in 0..S {
                if i == j {
                    continue;
                }
                let count = match self.kind {
                    ModelKind::Gtr => {
                        self.pseudocount[(i, j)] + self.pseudocount[(j, i)]
                    }
                    _ => self.pseudocount[(i, j)],
                };
                self.mutation[i][j] = count / self.freqs[i];
            }
        }
        self.rebuild_tables(ref_seq);

        (0..S).any(|i| (self.diagonal[i] - old_diag[i]).abs() > 1e-3)
    }

    pub fn to_file(&self) -> ModelFile {
        ModelFile {
            model: self.kind.name().to_string(),
            num_states: S,
            freqs: self.freqs.to_vec(),
            rates: self.mutation.iter().map(|row| row.to_vec()).collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.to_file())
            .with_context(|| format!("failed to write {:?}", path))?;
        Ok(())
    }
}

pub fn load_model_file(path: &Path) -> Result<ModelFile> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let model =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dna_model() -> SubstModel<4> {
        SubstModel::new(ModelKind::Unrest, &[0, 1, 2, 3, 0, 0]).expect("model init failed")
    }

    #[test]
    fn rows_sum_to_zero_and_flux_is_one() {
        let m = dna_model();
        for i in 0..4 {
            let row_sum: f64 = m.mutation[i].iter().sum();
            assert!(row_sum.abs() < 1e-12, "row {i} sums to {row_sum}");
        }
        let flux: f64 = (0..4).map(|i| -m.freqs[i] * m.diagonal[i]).sum();
        assert!((flux - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cumulative_tables_track_the_reference() {
        let m = dna_model();
        assert_eq!(m.cumulative_rate.len(), 7);
        assert_eq!(m.span_base(0, 5, 0), 3);
        assert_eq!(m.span_base(1, 3, 0), 0);
        let direct: f64 = [0usize, 1, 2, 3, 0, 0].iter().map(|&s| m.diagonal[s]).sum();
        assert!((m.span_rate(0, 5) - direct).abs() < 1e-12);
    }

    #[test]
    fn derived_tables_match_their_definitions() {
        let m = dna_model();
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(m.transposed[i][j], m.mutation[j][i]);
                let expect = m.freqs[i] / m.freqs[j] * m.mutation[i][j];
                assert!((m.flux_ratio[i][j] - expect).abs() < 1e-12);
                let expect = m.freqs[j] * m.mutation[j][i];
                assert!((m.freq_weighted_transposed[i][j] - expect).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn pseudocounts_skew_the_updated_matrix() {
        let mut m = dna_model();
        for _ in 0..50 {
            m.add_pseudocount(0, 3);
        }
        let refreshed = m.update_from_pseudocounts(&[0, 1, 2, 3, 0, 0]);
        assert!(refreshed, "a large count shift must trigger a cache refresh");
        // A→T must now be the fastest transition out of A.
        for j in 1..3 {
            assert!(m.mutation[0][3] > m.mutation[0][j]);
        }
        let flux: f64 = (0..4).map(|i| -m.freqs[i] * m.diagonal[i]).sum();
        assert!((flux - 1.0).abs() < 1e-12);
    }

    #[test]
    fn jc_ignores_pseudocounts() {
        let mut m: SubstModel<4> =
            SubstModel::new(ModelKind::Jc, &[0, 1, 2, 3]).expect("model init failed");
        m.add_pseudocount(0, 1);
        assert!(!m.update_from_pseudocounts(&[0, 1, 2, 3]));
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        assert!(ModelKind::parse("hky").is_err());
        assert_eq!(ModelKind::parse("GTR").unwrap(), ModelKind::Gtr);
    }
}
