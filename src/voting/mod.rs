use crate::models::ResultEntry;

// Tally arithmetic shared by snapshots and pushes. Everything that reaches a
// consumer goes through `normalize`, so percentages always agree with the
// counts sitting next to them.

pub fn total_votes(entries: &[ResultEntry]) -> u64 {
    entries.iter().map(|e| e.vote_count).sum()
}

/// Recompute percentages from counts, then rank.
pub fn normalize(mut entries: Vec<ResultEntry>) -> Vec<ResultEntry> {
    recompute_percentages(&mut entries);
    rank(&mut entries);
    entries
}

/// Overwrites every `percentage` with `vote_count / total * 100`.
/// All zero when no votes have been cast.
pub fn recompute_percentages(entries: &mut [ResultEntry]) {
    let total = total_votes(entries);
    for entry in entries.iter_mut() {
        entry.percentage = if total == 0 {
            0.0
        } else {
            entry.vote_count as f64 * 100.0 / total as f64
        };
    }
}

/// Most votes first; ties fall back to candidate id so ordering is
/// deterministic across snapshots and pushes.
pub fn rank(entries: &mut [ResultEntry]) {
    entries.sort_by(|a, b| {
        b.vote_count
            .cmp(&a.vote_count)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
}

pub fn round_percentage(percentage: f64) -> f64 {
    (percentage * 100.0).round() / 100.0
}

/// Top entry of a ranked slice when it is not tied with the runner-up.
pub fn leader(ranked: &[ResultEntry]) -> Option<&ResultEntry> {
    let first = ranked.first()?;
    if first.vote_count == 0 {
        return None;
    }
    match ranked.get(1) {
        Some(second) if second.vote_count == first.vote_count => None,
        _ => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, votes: u64) -> ResultEntry {
        ResultEntry::new(id, format!("Candidate {}", id), "Chair", votes)
    }

    #[test]
    fn percentages_sum_to_one_hundred() {
        let sets: Vec<Vec<u64>> = vec![
            vec![1],
            vec![3, 1],
            vec![1, 1, 1],
            vec![7, 0, 13, 2, 9],
            vec![999_983, 1, 17, 4_242],
        ];
        for counts in sets {
            let entries: Vec<_> = counts
                .iter()
                .enumerate()
                .map(|(i, c)| entry(i as i64 + 1, *c))
                .collect();
            let normalized = normalize(entries);
            let sum: f64 = normalized.iter().map(|e| e.percentage).sum();
            assert!((sum - 100.0).abs() < 1e-9, "sum was {} for {:?}", sum, counts);
        }
    }

    #[test]
    fn zero_votes_means_zero_percent_everywhere() {
        let mut entries = vec![entry(1, 0), entry(2, 0)];
        entries[0].percentage = 50.0;
        let normalized = normalize(entries);
        assert!(normalized.iter().all(|e| e.percentage == 0.0));
    }

    #[test]
    fn ranking_breaks_ties_by_candidate_id() {
        let normalized = normalize(vec![entry(9, 2), entry(3, 5), entry(4, 2), entry(1, 0)]);
        let order: Vec<i64> = normalized.iter().map(|e| e.candidate_id).collect();
        assert_eq!(order, vec![3, 4, 9, 1]);
    }

    #[test]
    fn display_rounding_keeps_two_decimals() {
        assert_eq!(round_percentage(83.333_333), 83.33);
        assert_eq!(round_percentage(16.666_666), 16.67);
        assert_eq!(round_percentage(0.0), 0.0);
    }

    #[test]
    fn leader_requires_a_strict_lead() {
        let tied = normalize(vec![entry(1, 4), entry(2, 4)]);
        assert!(leader(&tied).is_none());

        let clear = normalize(vec![entry(1, 4), entry(2, 6)]);
        assert_eq!(leader(&clear).map(|e| e.candidate_id), Some(2));

        let empty = normalize(vec![entry(1, 0)]);
        assert!(leader(&empty).is_none());
    }
}
