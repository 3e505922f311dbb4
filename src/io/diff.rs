use anyhow::{Context, Result, bail};
use std::fmt::Write as _;
use std::path::Path;

use super::seqfile::read_to_string;
use super::{
    Alignment, MutState, Mutation, REF_NAME, SeqType, Taxon, char_to_state, mask_to_char,
    state_to_char,
};

/// Parse the compact diff format:
///
/// ```text
/// >REF
/// <reference sequence>
/// >taxon
/// <state>\t<1-based position>[\t<length>]
/// ...
/// ```
///
/// A `<length>` column is required exactly for `N` and `-` entries. When
/// `ref_override` is supplied it replaces the embedded reference (with a
/// warning), which must still be present.
pub fn parse_diff(
    content: &str,
    seq_type: Option<SeqType>,
    ref_override: Option<&[u8]>,
) -> Result<Alignment> {
    let mut lines = content.lines().enumerate().peekable();

    // the reference record comes first
    let mut ref_text = String::new();
    match lines.next() {
        Some((i, line)) if line.trim().strip_prefix('>').map(str::trim) == Some(REF_NAME) => {
            let _ = i;
        }
        Some((i, _)) => bail!("line {}: diff file must start with >{REF_NAME}", i + 1),
        None => bail!("empty diff input"),
    }
    while let Some((_, line)) = lines.peek() {
        if line.trim().starts_with('>') {
            break;
        }
        let (_, line) = lines.next().unwrap();
        ref_text.push_str(line.trim());
    }
    if ref_text.is_empty() {
        bail!("reference sequence is missing after >{REF_NAME}");
    }

    let seq_type = seq_type.unwrap_or_else(|| {
        SeqType::detect(&[(REF_NAME.to_string(), ref_text.clone())])
    });
    let ref_states = match ref_override {
        Some(states) => {
            eprintln!(
                "warning: skipping the reference embedded in the diff file, using the supplied one"
            );
            states.to_vec()
        }
        None => super::seqfile::states_from_ref(seq_type, REF_NAME, &ref_text)?,
    };
    let genome_length = ref_states.len();

    let mut taxa: Vec<Taxon> = Vec::new();
    let mut current: Option<Taxon> = None;
    for (i, line) in lines {
        let line_num = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix('>') {
            let name = name.trim();
            if name.is_empty() {
                bail!("line {line_num}: empty taxon name");
            }
            if let Some(taxon) = current.take() {
                taxa.push(taxon);
            }
            current = Some(Taxon {
                name: name.to_string(),
                mutations: Vec::new(),
            });
        } else {
            let Some(taxon) = current.as_mut() else {
                bail!("line {line_num}: mutation entry before the first taxon record");
            };
            let mutation = parse_mutation_line(seq_type, trimmed, line_num, genome_length)?;
            if let Some(last) = taxon.mutations.last() {
                if mutation.position < last.position + last.length {
                    bail!(
                        "line {line_num}: position {} overlaps or precedes the previous entry",
                        mutation.position + 1
                    );
                }
            }
            taxon.mutations.push(mutation);
        }
    }
    if let Some(taxon) = current.take() {
        taxa.push(taxon);
    }
    if taxa.is_empty() {
        bail!("no taxa found in diff input");
    }

    Ok(Alignment {
        seq_type,
        ref_states,
        taxa,
    })
}

fn parse_mutation_line(
    seq_type: SeqType,
    line: &str,
    line_num: usize,
    genome_length: usize,
) -> Result<Mutation> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 || fields.len() > 3 {
        bail!("line {line_num}: expected <state>\t<position>[\t<length>], found {line:?}");
    }
    let mut chars = fields[0].chars();
    let state_char = chars
        .next()
        .ok_or_else(|| anyhow::anyhow!("line {line_num}: empty state field"))?;
    if chars.next().is_some() {
        bail!("line {line_num}: state must be a single character");
    }
    let state = char_to_state(seq_type, state_char)
        .with_context(|| format!("line {line_num}"))?;

    let position: usize = fields[1]
        .parse()
        .with_context(|| format!("line {line_num}: invalid position {:?}", fields[1]))?;
    if position < 1 || position > genome_length {
        bail!("line {line_num}: position must be in 1..={genome_length}");
    }

    let takes_length = matches!(state, MutState::Gap | MutState::Del);
    let length = match (takes_length, fields.len()) {
        (true, 3) => {
            let length: usize = fields[2]
                .parse()
                .with_context(|| format!("line {line_num}: invalid length {:?}", fields[2]))?;
            if length < 1 {
                bail!("line {line_num}: length must be >= 1");
            }
            length
        }
        (true, _) => bail!("line {line_num}: {state_char:?} entries require a length"),
        (false, 3) => bail!("line {line_num}: a length is only allowed for N and - entries"),
        (false, _) => 1,
    };
    if position + length - 1 > genome_length {
        bail!("line {line_num}: run extends past the reference end ({genome_length})");
    }

    Ok(Mutation {
        state,
        position: position - 1,
        length,
    })
}

/// Render an alignment back into diff text. Inverse of `parse_diff`.
pub fn write_diff(aln: &Alignment) -> String {
    let mut out = String::new();
    out.push('>');
    out.push_str(REF_NAME);
    out.push('\n');
    for &s in &aln.ref_states {
        out.push(state_to_char(aln.seq_type, s));
    }
    out.push('\n');
    for taxon in &aln.taxa {
        let _ = writeln!(out, ">{}", taxon.name);
        for m in &taxon.mutations {
            let c = match m.state {
                MutState::Concrete(s) => state_to_char(aln.seq_type, s),
                MutState::Gap => 'N',
                MutState::Del => '-',
                MutState::Ambiguous(mask) => mask_to_char(aln.seq_type, mask).unwrap_or('?'),
            };
            match m.state {
                MutState::Gap | MutState::Del => {
                    let _ = writeln!(out, "{c}\t{}\t{}", m.position + 1, m.length);
                }
                _ => {
                    let _ = writeln!(out, "{c}\t{}", m.position + 1);
                }
            }
        }
    }
    out
}

pub fn read_diff_file(
    path: &Path,
    seq_type: Option<SeqType>,
    ref_override: Option<&[u8]>,
) -> Result<Alignment> {
    let content = read_to_string(path)?;
    parse_diff(&content, seq_type, ref_override)
        .with_context(|| format!("failed to parse {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = ">REF\nACGTACGT\n>t1\n>t2\nC\t1\nN\t3\t2\n>t3\n-\t5\t4\n";

    #[test]
    fn parses_reference_and_taxa() {
        let aln = parse_diff(SAMPLE, None, None).unwrap();
        assert_eq!(aln.genome_length(), 8);
        assert_eq!(aln.taxa.len(), 3);
        assert!(aln.taxa[0].mutations.is_empty());
        assert_eq!(
            aln.taxa[1].mutations,
            vec![
                Mutation {
                    state: MutState::Concrete(1),
                    position: 0,
                    length: 1
                },
                Mutation {
                    state: MutState::Gap,
                    position: 2,
                    length: 2
                },
            ]
        );
        assert_eq!(
            aln.taxa[2].mutations,
            vec![Mutation {
                state: MutState::Del,
                position: 4,
                length: 4
            }]
        );
    }

    #[test]
    fn diff_round_trips_exactly() {
        let aln = parse_diff(SAMPLE, None, None).unwrap();
        let text = write_diff(&aln);
        let again = parse_diff(&text, None, None).unwrap();
        assert_eq!(aln.ref_states, again.ref_states);
        for (a, b) in aln.taxa.iter().zip(again.taxa.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.mutations, b.mutations);
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_diff(">nope\nACGT\n", None, None).is_err());
        // missing length on a gap run
        assert!(parse_diff(">REF\nACGT\n>t\nN\t2\n", None, None).is_err());
        // length on a substitution
        assert!(parse_diff(">REF\nACGT\n>t\nC\t2\t3\n", None, None).is_err());
        // out-of-range position
        assert!(parse_diff(">REF\nACGT\n>t\nC\t9\n", None, None).is_err());
        // run past the end
        assert!(parse_diff(">REF\nACGT\n>t\nN\t3\t4\n", None, None).is_err());
        // non-increasing positions
        assert!(parse_diff(">REF\nACGT\n>t\nC\t3\nG\t2\n", None, None).is_err());
    }

    #[test]
    fn error_messages_carry_line_numbers() {
        let err = parse_diff(">REF\nACGT\n>t\nC\t9\n", None, None).unwrap_err();
        assert!(format!("{err:#}").contains("line 4"));
    }
}
