//! Segment generation markers.
//!
//! The index engine commits by writing `segments_N`, where `N` is the
//! generation in base 36. A bare `segments` file is generation 0 and
//! `segments.gen` is a pointer file that never counts.

/// Prefix shared by every commit point file.
pub const SEGMENTS: &str = "segments";

/// Pointer file written alongside commit points.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Generation value for "no commit point found".
pub const UNKNOWN_GENERATION: i64 = -1;

/// Generation encoded in a single file name, if it is a commit point.
///
/// Unparseable suffixes yield `None` rather than an error.
pub fn generation_from_name(name: &str) -> Option<i64> {
    if name == SEGMENTS {
        return Some(0);
    }
    if name == SEGMENTS_GEN {
        return None;
    }
    let suffix = name.strip_prefix(SEGMENTS)?.strip_prefix('_')?;
    if suffix.is_empty() {
        return None;
    }
    i64::from_str_radix(suffix, 36).ok().filter(|g| *g >= 0)
}

/// Highest generation among `names`, or [`UNKNOWN_GENERATION`].
pub fn current_generation<I, S>(names: I) -> i64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|n| generation_from_name(n.as_ref()))
        .max()
        .unwrap_or(UNKNOWN_GENERATION)
}

/// Commit point file name for a generation.
pub fn segments_file_name(generation: i64) -> String {
    if generation <= 0 {
        SEGMENTS.to_string()
    } else {
        format!("{SEGMENTS}_{}", to_base36(generation as u64))
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
