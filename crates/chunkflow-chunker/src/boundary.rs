//! Boundary detection and packing inside a single unit.

use chunkflow_core::{BoundaryRule, ByteRange, DecompositionError};

/// Split `content` into indivisible pieces according to `rule`. Pieces tile the content.
pub fn pieces(content: &str, rule: &BoundaryRule) -> Vec<ByteRange> {
    if content.is_empty() {
        return Vec::new();
    }
    match rule {
        BoundaryRule::WholeUnit => vec![ByteRange::new(0, content.len())],
        BoundaryRule::Lines => line_ranges(content).collect(),
        BoundaryRule::Sections { marker } => section_ranges(content, marker),
    }
}

fn line_ranges(content: &str) -> impl Iterator<Item = ByteRange> + '_ {
    let mut offset = 0;
    content.split_inclusive('\n').map(move |line| {
        let range = ByteRange::new(offset, offset + line.len());
        offset += line.len();
        range
    })
}

fn section_ranges(content: &str, marker: &str) -> Vec<ByteRange> {
    let mut out = Vec::new();
    let mut start = 0;
    for line in line_ranges(content) {
        if line.start > start && content[line.start..].starts_with(marker) {
            out.push(ByteRange::new(start, line.start));
            start = line.start;
        }
    }
    out.push(ByteRange::new(start, content.len()));
    out
}

/// Greedily pack consecutive pieces into ranges no longer than `bound`.
///
/// A piece that alone exceeds the bound cannot be split without breaking a natural
/// boundary and is reported instead of truncated.
pub fn pack(
    unit: &str,
    pieces: &[ByteRange],
    bound: usize,
) -> Result<Vec<ByteRange>, DecompositionError> {
    let mut out = Vec::new();
    let mut current: Option<ByteRange> = None;
    for piece in pieces {
        if piece.len() > bound {
            return Err(DecompositionError::BoundaryAmbiguous {
                unit: unit.to_string(),
                size: piece.len(),
                bound,
            });
        }
        current = match current {
            Some(range) if range.len() + piece.len() <= bound => {
                Some(ByteRange::new(range.start, piece.end))
            }
            Some(range) => {
                out.push(range);
                Some(*piece)
            }
            None => Some(*piece),
        };
    }
    out.extend(current);
    Ok(out)
}

/// Last `lines` lines of `text`, or `None` when there is nothing to carry.
pub fn tail_lines(text: &str, lines: usize) -> Option<String> {
    if lines == 0 || text.is_empty() {
        return None;
    }
    let all: Vec<&str> = text.split_inclusive('\n').collect();
    let from = all.len().saturating_sub(lines);
    Some(all[from..].concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(content: &'a str, ranges: &[ByteRange]) -> Vec<&'a str> {
        ranges.iter().map(|r| &content[r.start..r.end]).collect()
    }

    #[test]
    fn sections_split_at_marker_lines() {
        let doc = "intro\n# One\nbody\n# Two\nmore\n";
        let rule = BoundaryRule::Sections {
            marker: "#".into(),
        };
        assert_eq!(
            texts(doc, &pieces(doc, &rule)),
            vec!["intro\n", "# One\nbody\n", "# Two\nmore\n"]
        );
    }

    #[test]
    fn lines_keep_trailing_text_without_newline() {
        let text = "a\nbb\nccc";
        assert_eq!(
            texts(text, &pieces(text, &BoundaryRule::Lines)),
            vec!["a\n", "bb\n", "ccc"]
        );
    }

    #[test]
    fn packing_respects_bound() {
        let text = "aa\nbb\ncc\ndd\n";
        let p = pieces(text, &BoundaryRule::Lines);
        let packed = pack("u", &p, 6).unwrap();
        assert_eq!(texts(text, &packed), vec!["aa\nbb\n", "cc\ndd\n"]);
    }

    #[test]
    fn oversized_piece_is_ambiguous() {
        let text = "short\nthis line is far too long\n";
        let p = pieces(text, &BoundaryRule::Lines);
        let err = pack("notes.txt", &p, 10).unwrap_err();
        assert_eq!(
            err,
            DecompositionError::BoundaryAmbiguous {
                unit: "notes.txt".into(),
                size: 26,
                bound: 10
            }
        );
    }

    #[test]
    fn tail_lines_takes_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2).as_deref(), Some("b\nc\n"));
        assert_eq!(tail_lines("a\n", 5).as_deref(), Some("a\n"));
        assert_eq!(tail_lines("a\n", 0), None);
    }
}
