use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The largest value at least `quorum` of `values` are greater than or equal
/// to, or `None` if there are fewer than `quorum` values.
pub fn quorum_floor<T: Copy + Ord>(values: impl IntoIterator<Item = T>, quorum: usize) -> Option<T> {
    let mut values: Vec<T> = values.into_iter().collect();

    if quorum == 0 || values.len() < quorum {
        return None;
    }

    values.sort_unstable_by(|a, b| b.cmp(a));
    Some(values[quorum - 1])
}

#[cfg(test)]
mod tests {
    use super::quorum_floor;

    #[test]
    fn test_quorum_floor() {
        assert_eq!(quorum_floor([9, 2, 7, 3, 8], 3), Some(7));
        assert_eq!(quorum_floor([9, 2, 7, 3, 8], 5), Some(2));
        assert_eq!(quorum_floor([4, 4], 3), None);
    }
}
