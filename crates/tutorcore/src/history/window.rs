//! Character-budget windowing over a chronological history.

use super::models::HistoryEntry;

/// Index of the first entry kept when `lengths` (chronological) must fit in
/// `max_chars`.
///
/// Walks back from the newest entry and stops at the first entry that would
/// push the running total past the budget. Everything from there on is kept,
/// so the result is always a contiguous suffix.
pub fn window_start(lengths: &[usize], max_chars: usize) -> usize {
    let total: usize = lengths.iter().sum();
    if total <= max_chars {
        return 0;
    }

    let mut running = 0usize;
    for (i, len) in lengths.iter().enumerate().rev() {
        running += len;
        if running > max_chars {
            return i + 1;
        }
    }
    0
}

/// Keep the newest suffix of `entries` whose text fits in `max_chars`.
pub fn bounded(mut entries: Vec<HistoryEntry>, max_chars: usize) -> Vec<HistoryEntry> {
    let lengths: Vec<usize> = entries.iter().map(HistoryEntry::budget_len).collect();
    let start = window_start(&lengths, max_chars);
    entries.split_off(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest_until_fit() {
        assert_eq!(window_start(&[100, 200, 59_800, 50], 60_000), 2);
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        assert_eq!(window_start(&[100, 200, 300], 60_000), 0);
        assert_eq!(window_start(&[30_000, 30_000], 60_000), 0);
        assert_eq!(window_start(&[], 60_000), 0);
    }

    #[test]
    fn test_images_count_zero() {
        // Images after the boundary stay, earlier ones go with it.
        assert_eq!(window_start(&[5, 0, 10, 0, 10, 0], 15), 3);
        assert_eq!(window_start(&[0, 0, 10], 10), 0);
    }

    #[test]
    fn test_oversized_newest_entry_empties_window() {
        assert_eq!(window_start(&[10, 100], 50), 2);
    }
}
