use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::{Alignment, MutState, Mutation, SeqType, Taxon, char_to_state};

/// Read a whole file, transparently decompressing `.gz` inputs.
pub fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {:?}", path))?;
    Ok(content)
}

/// Strip whitespace and normalize one raw sequence line. Bracketed state sets
/// `(..)` / `{..}` collapse to a single `N` since the engine cannot use them.
fn process_seq_line(seq: &mut String, line: &str, line_num: usize, warned_bracket: &mut bool) -> Result<()> {
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c == '(' || c == '{' {
            let close = if c == '(' { ')' } else { '}' };
            let mut found = false;
            for inner in chars.by_ref() {
                if inner == close {
                    found = true;
                    break;
                }
            }
            if !found {
                bail!("line {line_num}: unterminated {c:?} state set");
            }
            if !*warned_bracket {
                eprintln!("warning: line {line_num}: bracketed state sets are read as N");
                *warned_bracket = true;
            }
            seq.push('N');
        } else {
            seq.push(c);
        }
    }
    Ok(())
}

/// Parse FASTA text into (name, sequence) pairs.
pub fn parse_fasta(content: &str) -> Result<Vec<(String, String)>> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut warned_bracket = false;
    for (i, line) in content.lines().enumerate() {
        let line_num = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('>') {
            let name = name.trim().to_string();
            if name.is_empty() {
                bail!("line {line_num}: empty sequence name");
            }
            out.push((name, String::new()));
        } else {
            let Some(last) = out.last_mut() else {
                bail!("line {line_num}: sequence data before the first '>' header");
            };
            process_seq_line(&mut last.1, trimmed, line_num, &mut warned_bracket)?;
        }
    }
    if out.is_empty() {
        bail!("no sequences found in FASTA input");
    }
    Ok(out)
}

/// Parse PHYLIP text, sequential or interleaved.
pub fn parse_phylip(content: &str) -> Result<Vec<(String, String)>> {
    let mut lines = content.lines().enumerate();
    let (_, header) = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty PHYLIP input"))?;
    let mut header_it = header.split_whitespace();
    let n_taxa: usize = header_it
        .next()
        .ok_or_else(|| anyhow::anyhow!("line 1: missing taxon count"))?
        .parse()
        .context("line 1: invalid taxon count")?;
    let n_sites: usize = header_it
        .next()
        .ok_or_else(|| anyhow::anyhow!("line 1: missing site count"))?
        .parse()
        .context("line 1: invalid site count")?;
    if n_taxa == 0 || n_sites == 0 {
        bail!("line 1: taxon and site counts must be positive");
    }

    let mut out: Vec<(String, String)> = Vec::with_capacity(n_taxa);
    let mut warned_bracket = false;
    let mut continuation_row = 0usize;
    for (i, line) in lines {
        let line_num = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if out.len() < n_taxa {
            // first block: leading token is the taxon name
            let mut it = trimmed.split_whitespace();
            let name = it
                .next()
                .ok_or_else(|| anyhow::anyhow!("line {line_num}: missing taxon name"))?
                .to_string();
            let mut seq = String::new();
            for chunk in it {
                process_seq_line(&mut seq, chunk, line_num, &mut warned_bracket)?;
            }
            out.push((name, seq));
        } else {
            // interleaved continuation blocks cycle through the taxa in order
            let idx = continuation_row % n_taxa;
            let mut seq = String::new();
            process_seq_line(&mut seq, trimmed, line_num, &mut warned_bracket)?;
            out[idx].1.push_str(&seq);
            continuation_row += 1;
        }
    }
    if out.len() != n_taxa {
        bail!("PHYLIP header promises {n_taxa} taxa but {} were found", out.len());
    }
    for (name, seq) in &out {
        if seq.len() != n_sites {
            bail!(
                "sequence {name:?} has {} sites, header promises {n_sites}",
                seq.len()
            );
        }
    }
    Ok(out)
}

/// Read an alignment file, sniffing FASTA vs PHYLIP from the first byte.
pub fn read_sequences(path: &Path) -> Result<Vec<(String, String)>> {
    let content = read_to_string(path)?;
    let first = content
        .chars()
        .find(|c| !c.is_whitespace())
        .ok_or_else(|| anyhow::anyhow!("{:?} is empty", path))?;
    let sequences = if first == '>' {
        parse_fasta(&content)
    } else {
        parse_phylip(&content)
    }
    .with_context(|| format!("failed to parse {:?}", path))?;
    Ok(sequences)
}

/// Turn one aligned sequence into its compressed difference list against the
/// reference, merging consecutive gap/deletion sites into runs.
pub fn extract_mutations(
    seq_type: SeqType,
    ref_states: &[u8],
    name: &str,
    seq: &str,
) -> Result<Vec<Mutation>> {
    if seq.chars().count() != ref_states.len() {
        bail!(
            "sequence {name:?} has {} sites, reference has {}",
            seq.chars().count(),
            ref_states.len()
        );
    }
    let mut out: Vec<Mutation> = Vec::new();
    for (pos, c) in seq.chars().enumerate() {
        let state = char_to_state(seq_type, c)
            .with_context(|| format!("sequence {name:?}, site {}", pos + 1))?;
        let is_match = matches!(state, MutState::Concrete(s) if s == ref_states[pos]);
        if is_match {
            continue;
        }
        // extend a gap or deletion run when the previous site matches
        if matches!(state, MutState::Gap | MutState::Del) {
            if let Some(last) = out.last_mut() {
                if last.state == state && last.position + last.length == pos {
                    last.length += 1;
                    continue;
                }
            }
        }
        out.push(Mutation {
            state,
            position: pos,
            length: 1,
        });
    }
    Ok(out)
}

/// Build the diff representation of a full alignment. The reference is the
/// supplied override when given (already converted to states, e.g. via
/// `read_reference`), otherwise the first sequence; either way it must
/// contain concrete states only.
pub fn build_alignment(
    sequences: &[(String, String)],
    seq_type: Option<SeqType>,
    ref_override: Option<&[u8]>,
) -> Result<Alignment> {
    if sequences.len() < 2 {
        bail!("an alignment needs at least 2 sequences");
    }
    let seq_type = seq_type.unwrap_or_else(|| SeqType::detect(sequences));

    let ref_states = match ref_override {
        Some(states) => states.to_vec(),
        None => states_from_ref(seq_type, &sequences[0].0, &sequences[0].1)?,
    };

    let mut taxa = Vec::with_capacity(sequences.len());
    for (name, seq) in sequences {
        let mutations = extract_mutations(seq_type, &ref_states, name, seq)?;
        taxa.push(Taxon {
            name: name.clone(),
            mutations,
        });
    }
    Ok(Alignment {
        seq_type,
        ref_states,
        taxa,
    })
}

/// Convert a reference sequence to states, rejecting anything non-concrete.
pub fn states_from_ref(seq_type: SeqType, name: &str, seq: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(seq.len());
    for (pos, c) in seq.chars().enumerate() {
        match char_to_state(seq_type, c)? {
            MutState::Concrete(s) => out.push(s),
            _ => bail!(
                "reference {name:?} has a non-concrete state {c:?} at site {}",
                pos + 1
            ),
        }
    }
    if out.is_empty() {
        bail!("reference {name:?} is empty");
    }
    Ok(out)
}

/// Read a reference override from its own FASTA file.
pub fn read_reference(path: &Path, seq_type: Option<SeqType>) -> Result<(SeqType, Vec<u8>)> {
    let content = read_to_string(path)?;
    let sequences = parse_fasta(&content).with_context(|| format!("failed to parse {:?}", path))?;
    let seq_type = seq_type.unwrap_or_else(|| SeqType::detect(&sequences));
    let (name, seq) = &sequences[0];
    Ok((seq_type, states_from_ref(seq_type, name, seq)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fasta_parses_names_and_joins_lines() {
        let seqs = parse_fasta(">a\nACG\nT\n>b\nACGT\n").unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0], ("a".to_string(), "ACGT".to_string()));
    }

    #[test]
    fn fasta_collapses_bracketed_sets_to_n() {
        let seqs = parse_fasta(">a\nAC(GT)A\n").unwrap();
        assert_eq!(seqs[0].1, "ACNA");
    }

    #[test]
    fn phylip_sequential_and_interleaved() {
        let seqs = parse_phylip("2 4\nalpha ACGT\nbeta  ACCT\n").unwrap();
        assert_eq!(seqs[1], ("beta".to_string(), "ACCT".to_string()));

        let seqs = parse_phylip("2 8\nalpha ACGT\nbeta  ACCT\n\nACGT\nACCT\n").unwrap();
        assert_eq!(seqs[0].1, "ACGTACGT");
        assert_eq!(seqs[1].1, "ACCTACCT");
    }

    #[test]
    fn extract_mutations_merges_gap_runs() {
        let ref_states = states_from_ref(SeqType::Dna, "r", "ACGTACGT").unwrap();
        let muts = extract_mutations(SeqType::Dna, &ref_states, "t", "ANNTACGA").unwrap();
        assert_eq!(
            muts,
            vec![
                Mutation {
                    state: MutState::Gap,
                    position: 1,
                    length: 2
                },
                Mutation {
                    state: MutState::Concrete(0),
                    position: 7,
                    length: 1
                },
            ]
        );
    }

    #[test]
    fn reference_must_be_concrete() {
        assert!(states_from_ref(SeqType::Dna, "r", "ACGN").is_err());
        assert!(states_from_ref(SeqType::Dna, "r", "ACGT").is_ok());
    }

    #[test]
    fn build_alignment_uses_first_sequence_as_reference() {
        let seqs = vec![
            ("r".to_string(), "ACGT".to_string()),
            ("t".to_string(), "ACCT".to_string()),
        ];
        let aln = build_alignment(&seqs, None, None).unwrap();
        assert_eq!(aln.ref_states, vec![0, 1, 2, 3]);
        assert!(aln.taxa[0].mutations.is_empty());
        assert_eq!(
            aln.taxa[1].mutations,
            vec![Mutation {
                state: MutState::Concrete(1),
                position: 2,
                length: 1
            }]
        );
    }

    #[test]
    fn build_alignment_honors_a_reference_override() {
        let seqs = vec![
            ("a".to_string(), "ACGT".to_string()),
            ("b".to_string(), "ACCT".to_string()),
        ];
        // external reference differing from both sequences at site 1
        let override_states = states_from_ref(SeqType::Dna, "ext", "AGGT").unwrap();
        let aln = build_alignment(&seqs, None, Some(&override_states)).unwrap();
        assert_eq!(aln.ref_states, override_states);
        // every input sequence stays a taxon, diffed against the override
        assert_eq!(
            aln.taxa[0].mutations,
            vec![Mutation {
                state: MutState::Concrete(1),
                position: 1,
                length: 1
            }]
        );
        assert_eq!(aln.taxa[1].mutations.len(), 2);

        // a length mismatch against the override is a user error
        let short = states_from_ref(SeqType::Dna, "ext", "AGG").unwrap();
        assert!(build_alignment(&seqs, None, Some(&short)).is_err());
    }
}
