//! Iterator helpers.

use std::iter::Zip;

/// Like [`Iterator::zip`], but panics when the two iterators have different lengths.
#[track_caller]
pub fn zip_exact<A, B>(a: A, b: B) -> Zip<A::IntoIter, B::IntoIter>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let a = a.into_iter();
    let b = b.into_iter();
    assert_eq!(
        a.len(),
        b.len(),
        "`zip_exact` called on iterators of length {} and {}",
        a.len(),
        b.len(),
    );

    a.zip(b)
}
