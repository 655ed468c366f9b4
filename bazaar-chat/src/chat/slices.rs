//! Cooperative slicing of CPU-bound bulk work.
//!
//! Decrypting or encrypting thousands of records in one go would starve
//! every other task on the worker. [`map_in_slices`] yields back to the
//! scheduler after each slice so the work interleaves with the rest of the
//! runtime.

/// Apply `f` to every item, yielding to the scheduler every `per_slice` items.
///
/// A `per_slice` of zero is treated as one.
pub async fn map_in_slices<I, U, F>(items: I, per_slice: usize, mut f: F) -> Vec<U>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> U,
{
    let per_slice = per_slice.max(1);
    let iter = items.into_iter();
    let mut out = Vec::with_capacity(iter.size_hint().0);

    for (index, item) in iter.enumerate() {
        if index > 0 && index % per_slice == 0 {
            tokio::task::yield_now().await;
        }
        out.push(f(item));
    }
    out
}
