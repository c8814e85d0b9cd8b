//! Natural sorting utilities

use std::cmp::Ordering;
use std::path::Path;

/// Sort paths using natural (human-friendly) ordering.
///
/// `02.mp3 < 10.mp3` and `Part 2 < Part 10`, which plain lexicographic
/// ordering gets wrong.
pub fn natural_sort<P: AsRef<Path>>(paths: &mut [P]) {
    paths.sort_by(|a, b| natural_compare(a.as_ref(), b.as_ref()));
}

/// Compare two paths using natural ordering
pub fn natural_compare(a: &Path, b: &Path) -> Ordering {
    let a_str = a.to_string_lossy();
    let b_str = b.to_string_lossy();

    natord::compare(&a_str, &b_str)
}
