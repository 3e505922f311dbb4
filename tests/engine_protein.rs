use sprig::engine::run_inference;
use sprig::io::seqfile::build_alignment;
use sprig::io::SeqType;
use sprig::model::ModelKind;
use sprig::params::Params;

/// A 50-residue reference with five taxa carrying 1-3 substitutions each.
fn protein_sequences() -> Vec<(String, String)> {
    let reference = "MKVLAATTGE IRSPQDFHWY CNKLMVFPST WYVARNDCQE GHILKMFPST";
    let reference: String = reference.chars().filter(|c| !c.is_whitespace()).collect();
    let mutate = |subs: &[(usize, char)]| {
        let mut seq: Vec<char> = reference.chars().collect();
        for &(pos, aa) in subs {
            seq[pos] = aa;
        }
        seq.into_iter().collect::<String>()
    };
    vec![
        ("ref_taxon".to_string(), reference.clone()),
        ("p1".to_string(), mutate(&[(4, 'G')])),
        ("p2".to_string(), mutate(&[(4, 'G'), (17, 'A')])),
        ("p3".to_string(), mutate(&[(30, 'K')])),
        ("p4".to_string(), mutate(&[(30, 'K'), (31, 'R'), (44, 'W')])),
    ]
}

#[test]
fn twenty_state_inference_runs_end_to_end() {
    let sequences = protein_sequences();
    let aln = build_alignment(&sequences, Some(SeqType::Protein), None).expect("build failed");
    assert_eq!(aln.seq_type, SeqType::Protein);
    assert_eq!(aln.genome_length(), 50);

    let mut params = Params::default();
    params.progress = false;
    let result = run_inference(&aln, ModelKind::Gtr, &params, false).expect("inference failed");

    assert_eq!(result.n_placed, 5);
    assert_eq!(result.n_minor, 0);
    assert!(result.log_likelihood.is_finite() && result.log_likelihood < 0.0);
    for name in ["ref_taxon", "p1", "p2", "p3", "p4"] {
        assert!(result.newick.contains(name), "{name} missing from tree");
    }
    assert!(result.newick.ends_with(';'));

    // the exported model is a full 20-state GTR description
    assert_eq!(result.model.num_states, 20);
    assert_eq!(result.model.freqs.len(), 20);
    assert_eq!(result.model.rates.len(), 20);
    for row in &result.model.rates {
        let row_sum: f64 = row.iter().sum();
        assert!(row_sum.abs() < 1e-9, "rate rows must sum to zero");
    }
}

#[test]
fn protein_ambiguity_codes_are_supported() {
    let sequences = {
        let mut seqs = protein_sequences();
        // replace one residue of p1 with a B (asparagine or aspartate)
        let s = seqs[1].1.clone();
        let mut chars: Vec<char> = s.chars().collect();
        chars[10] = 'B';
        seqs[1].1 = chars.into_iter().collect();
        seqs
    };
    let aln = build_alignment(&sequences, Some(SeqType::Protein), None).expect("build failed");
    let mut params = Params::default();
    params.progress = false;
    let result = run_inference(&aln, ModelKind::Gtr, &params, true).expect("inference failed");
    assert_eq!(result.n_placed, 5);
    assert!(result.log_likelihood.is_finite());
}
