//! Query and dependency path AST and parser.
//!
//! Grammar:
//!
//! ```text
//! path    := segment ( '.' segment | '[' group ']' )*
//! segment := ident | integer | range
//! range   := ident ('..'|'...') ident
//! group   := elem (',' elem)*
//! elem    := path
//! ```
//!
//! Brackets nest, commas split at bracket depth zero, `a..b` is inclusive
//! and `a...b` excludes the upper bound. A parsed [`Path`] is a shared
//! segment vector plus a cursor, so `next()` never reallocates, and every
//! suffix carries a precomputed identity hash for the resolver's memo keys.

use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// One path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Part(Part),
    Group(Group),
    Range(Range),
}

/// A single name or index segment. `index` is set iff the name is an
/// integer literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: Arc<str>,
    pub index: Option<i64>,
}

impl Part {
    pub fn new(name: &str) -> Part {
        Part {
            index: name.parse().ok(),
            name: Arc::from(name),
        }
    }

    pub fn from_index(index: i64) -> Part {
        Part {
            name: Arc::from(index.to_string().as_str()),
            index: Some(index),
        }
    }

    /// Segment materialized from a resolved dynamic-index value.
    pub fn from_value(value: &Value) -> Part {
        match value {
            Value::Int(n) => Part::from_index(*n),
            other => Part::new(&other.display_string()),
        }
    }

    #[inline]
    pub fn is_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.name.as_ref() == "$"
    }
}

/// Bracketed option set. All options are evaluated and merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub options: Vec<Path>,
}

impl Group {
    /// True iff every option is a pure index path.
    pub fn is_index(&self) -> bool {
        self.options.iter().all(Path::is_index_path)
    }
}

/// `lo..hi` / `lo...hi` segment, expanded on traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lo: Arc<str>,
    pub hi: Arc<str>,
    pub exclude_end: bool,
}

impl Range {
    /// Expand to the concrete part sequence. Endpoints were validated at
    /// parse time, so this cannot fail.
    pub fn expand(&self) -> Vec<Part> {
        if let (Ok(lo), Ok(hi)) = (self.lo.parse::<i64>(), self.hi.parse::<i64>()) {
            let hi = if self.exclude_end { hi - 1 } else { hi };
            return (lo..=hi).map(Part::from_index).collect();
        }
        let (lo, hi) = (
            self.lo.chars().next().unwrap_or('a'),
            self.hi.chars().next().unwrap_or('a'),
        );
        let hi = if self.exclude_end {
            char::from_u32(hi as u32 - 1).unwrap_or(lo)
        } else {
            hi
        };
        (lo..=hi).map(|c| Part::new(&c.to_string())).collect()
    }
}

/// Parsed path: shared segments plus a cursor.
#[derive(Debug, Clone)]
pub struct Path {
    segments: Arc<Vec<Segment>>,
    ids: Arc<Vec<u64>>,
    pos: usize,
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.remaining() == other.remaining()
    }
}

impl Path {
    /// The empty path.
    pub fn blank() -> Path {
        Path::from_segments(Vec::new())
    }

    pub fn from_segments(segments: Vec<Segment>) -> Path {
        let ids = suffix_ids(&segments);
        Path {
            segments: Arc::new(segments),
            ids: Arc::new(ids),
            pos: 0,
        }
    }

    fn remaining(&self) -> &[Segment] {
        &self.segments[self.pos..]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.segments.len()
    }

    pub fn len(&self) -> usize {
        self.segments.len() - self.pos
    }

    /// First remaining segment, if any.
    pub fn segment(&self) -> Option<&Segment> {
        self.segments.get(self.pos)
    }

    /// The path minus its first segment. Cursor advance only.
    pub fn next(&self) -> Path {
        Path {
            segments: Arc::clone(&self.segments),
            ids: Arc::clone(&self.ids),
            pos: (self.pos + 1).min(self.segments.len()),
        }
    }

    /// True iff the first part is the root marker `$`.
    pub fn is_absolute(&self) -> bool {
        matches!(self.segment(), Some(Segment::Part(p)) if p.is_root())
    }

    /// Drop a leading root marker.
    pub fn strip_absolute(&self) -> Path {
        if self.is_absolute() {
            self.next()
        } else {
            self.clone()
        }
    }

    /// True iff every remaining segment is an integer part.
    pub fn is_index_path(&self) -> bool {
        !self.is_empty()
            && self
                .remaining()
                .iter()
                .all(|s| matches!(s, Segment::Part(p) if p.is_index()))
    }

    /// Order-dependent identity hash of the remaining segments.
    pub fn identity(&self) -> u64 {
        self.ids[self.pos]
    }

    /// Concatenation of the remaining segments of both paths.
    pub fn merge(&self, other: &Path) -> Path {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut segments = self.remaining().to_vec();
        segments.extend_from_slice(other.remaining());
        Path::from_segments(segments)
    }

    /// Copy of the path with the segment at `offset` (from the cursor)
    /// replaced. Used to materialize dynamic index segments.
    pub fn with_segment(&self, offset: usize, segment: Segment) -> Path {
        let mut segments = self.remaining().to_vec();
        if offset < segments.len() {
            segments[offset] = segment;
        }
        Path::from_segments(segments)
    }

    /// Name of the last part segment, used as a projection key.
    pub fn terminal_name(&self) -> Option<Arc<str>> {
        self.remaining().iter().rev().find_map(|s| match s {
            Segment::Part(p) => Some(Arc::clone(&p.name)),
            _ => None,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, seg) in self.remaining().iter().enumerate() {
            match seg {
                Segment::Group(_) => {}
                _ if i > 0 => out.push('.'),
                _ => {}
            }
            render_segment(seg, &mut out);
        }
        out
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_segment(seg: &Segment, out: &mut String) {
    match seg {
        Segment::Part(p) => out.push_str(&p.name),
        Segment::Range(r) => {
            out.push_str(&r.lo);
            out.push_str(if r.exclude_end { "..." } else { ".." });
            out.push_str(&r.hi);
        }
        Segment::Group(g) => {
            out.push('[');
            for (i, opt) in g.options.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&opt.render());
            }
            out.push(']');
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv(text: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for b in text.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

fn suffix_ids(segments: &[Segment]) -> Vec<u64> {
    let mut ids = vec![FNV_OFFSET; segments.len() + 1];
    for i in (0..segments.len()).rev() {
        let mut text = String::new();
        render_segment(&segments[i], &mut text);
        ids[i] = fnv(&text) ^ ids[i + 1].rotate_left(9).wrapping_mul(FNV_PRIME);
    }
    ids
}

/// Parse a dependency path. A leading `$` part marks it absolute.
pub fn parse(input: &str) -> Result<Path> {
    Ok(Path::from_segments(parse_segments(input)?))
}

/// Parse a query path: a leading `$.` is removed before parsing.
pub fn parse_query(input: &str) -> Result<Path> {
    let input = input.trim();
    if input == "$" {
        return Ok(Path::blank());
    }
    parse(input.strip_prefix("$.").unwrap_or(input))
}

fn parse_segments(input: &str) -> Result<Vec<Segment>> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments = Vec::new();
    let mut buf = String::new();
    let mut i = 0usize;

    while i < chars.len() {
        match chars[i] {
            '[' => {
                if !buf.is_empty() {
                    segments.push(flush_part(&mut buf)?);
                }
                let close = matching_bracket(&chars, i)?;
                let inner: String = chars[i + 1..close].iter().collect();
                if inner.is_empty() {
                    return Err(Error::Parse(format!("empty brackets in {:?}", input)));
                }
                let mut options = Vec::new();
                for elem in split_options(&inner) {
                    options.push(Path::from_segments(parse_segments(elem.trim())?));
                }
                segments.push(Segment::Group(Group { options }));
                i = close + 1;
            }
            ']' => {
                return Err(Error::Parse(format!("unbalanced ']' in {:?}", input)));
            }
            '.' => {
                let mut j = i;
                while j < chars.len() && chars[j] == '.' {
                    j += 1;
                }
                if j - i == 1 {
                    if !buf.is_empty() {
                        segments.push(flush_part(&mut buf)?);
                    }
                } else {
                    // part of a range operator, keep the dots in the token
                    for _ in i..j {
                        buf.push('.');
                    }
                }
                i = j;
            }
            c => {
                buf.push(c);
                i += 1;
            }
        }
    }
    if !buf.is_empty() {
        segments.push(flush_part(&mut buf)?);
    }
    Ok(segments)
}

fn flush_part(buf: &mut String) -> Result<Segment> {
    let text = std::mem::take(buf);
    if let Some((lo, hi, exclude_end)) = split_range(&text) {
        let numeric = lo.parse::<i64>().is_ok() && hi.parse::<i64>().is_ok();
        let alpha = lo.chars().count() == 1
            && hi.chars().count() == 1
            && lo.chars().all(|c| c.is_ascii_alphabetic())
            && hi.chars().all(|c| c.is_ascii_alphabetic());
        if !numeric && !alpha {
            return Err(Error::Parse(format!("invalid range endpoints: {:?}", text)));
        }
        return Ok(Segment::Range(Range {
            lo: Arc::from(lo),
            hi: Arc::from(hi),
            exclude_end,
        }));
    }
    Ok(Segment::Part(Part::new(&text)))
}

fn split_range(text: &str) -> Option<(&str, &str, bool)> {
    if let Some((lo, hi)) = text.split_once("...") {
        if !lo.is_empty() && !hi.is_empty() {
            return Some((lo, hi, true));
        }
    }
    if let Some((lo, hi)) = text.split_once("..") {
        if !lo.is_empty() && !hi.is_empty() {
            return Some((lo, hi, false));
        }
    }
    None
}

fn matching_bracket(chars: &[char], open: usize) -> Result<usize> {
    let mut depth = 0usize;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(Error::Parse(format!(
        "unbalanced '[' in {:?}",
        chars.iter().collect::<String>()
    )))
}

fn split_options(inner: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&inner[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_names(path: &Path) -> Vec<String> {
        let mut out = Vec::new();
        let mut p = path.clone();
        while let Some(seg) = p.segment() {
            if let Segment::Part(part) = seg {
                out.push(part.name.to_string());
            }
            p = p.next();
        }
        out
    }

    #[test]
    fn parses_dotted_parts() {
        let p = parse("cart.items.total").unwrap();
        assert_eq!(part_names(&p), ["cart", "items", "total"]);
        assert!(!p.is_absolute());
    }

    #[test]
    fn parses_groups_and_marks_index() {
        let p = parse("books[name,is_long]").unwrap();
        assert_eq!(p.len(), 2);
        match p.next().segment().unwrap() {
            Segment::Group(g) => {
                assert_eq!(g.options.len(), 2);
                assert!(!g.is_index());
            }
            other => panic!("expected group, got {:?}", other),
        }
        let p = parse("items[0,2]").unwrap();
        match p.next().segment().unwrap() {
            Segment::Group(g) => assert!(g.is_index()),
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn parses_nested_groups() {
        let p = parse("a[b[c,d],e]").unwrap();
        let next = p.next();
        let Some(Segment::Group(g)) = next.segment() else {
            panic!("expected group");
        };
        assert_eq!(g.options.len(), 2);
        assert_eq!(g.options[0].len(), 2);
    }

    #[test]
    fn parses_ranges() {
        let p = parse("items.0..2").unwrap();
        let next = p.next();
        let Some(Segment::Range(r)) = next.segment() else {
            panic!("expected range");
        };
        assert!(!r.exclude_end);
        assert_eq!(
            r.expand().iter().map(|p| p.index.unwrap()).collect::<Vec<_>>(),
            [0, 1, 2]
        );

        let p = parse("items.0...2").unwrap();
        let next = p.next();
        let Some(Segment::Range(r)) = next.segment() else {
            panic!("expected range");
        };
        assert_eq!(
            r.expand().iter().map(|p| p.index.unwrap()).collect::<Vec<_>>(),
            [0, 1]
        );

        let p = parse("a..c").unwrap();
        let Some(Segment::Range(r)) = p.segment() else {
            panic!("expected range");
        };
        assert_eq!(
            r.expand().iter().map(|p| p.name.to_string()).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
    }

    #[test]
    fn unbalanced_brackets_fail() {
        assert!(matches!(parse("a[b"), Err(Error::Parse(_))));
        assert!(matches!(parse("a]b"), Err(Error::Parse(_))));
    }

    #[test]
    fn query_strips_root() {
        let p = parse_query("$.a.b").unwrap();
        assert_eq!(part_names(&p), ["a", "b"]);
        assert!(parse_query("$").unwrap().is_empty());
        assert!(parse_query("").unwrap().is_empty());
    }

    #[test]
    fn absolute_paths_keep_their_marker() {
        let p = parse("$.positions").unwrap();
        assert!(p.is_absolute());
        assert_eq!(part_names(&p.strip_absolute()), ["positions"]);
    }

    #[test]
    fn round_trips_parts_and_single_groups() {
        for text in ["a.b.c", "a[b].c", "crew.0.position", "a[b][c]"] {
            let p = parse(text).unwrap();
            assert_eq!(parse(&p.render()).unwrap(), p, "round trip of {:?}", text);
        }
    }

    #[test]
    fn suffix_identities_differ() {
        let p = parse("a.b.c").unwrap();
        assert_ne!(p.identity(), p.next().identity());
        assert_ne!(p.next().identity(), p.next().next().identity());
        // identical suffixes of equal paths share identity
        let q = parse("a.b.c").unwrap();
        assert_eq!(p.next().identity(), q.next().identity());
        assert_ne!(parse("x.b.c").unwrap().identity(), p.identity());
    }

    #[test]
    fn merge_concatenates_remainders() {
        let a = parse("a.b").unwrap().next();
        let b = parse("c.d").unwrap();
        assert_eq!(a.merge(&b), parse("b.c.d").unwrap());
    }

    #[test]
    fn with_segment_replaces_at_offset() {
        let p = parse("positions[position_id]").unwrap();
        let swapped = p.with_segment(1, Segment::Part(Part::from_index(1)));
        assert_eq!(swapped, parse("positions.1").unwrap());
    }
}
