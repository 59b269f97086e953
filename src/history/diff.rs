use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::{HistoryEntry, HistorySnapshot};

/// Score moves smaller than this are noise.
pub const SCORE_CHANGE_THRESHOLD: f64 = 5.0;
/// A rank move at least this large is significant.
pub const SIGNIFICANT_RANK_CHANGE: i64 = 3;
/// Significant counts that make a run worth acting on.
const UPDATE_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankChange {
    pub key: String,
    pub original: String,
    pub old_rank: usize,
    pub new_rank: usize,
    /// Positive when the target moved up.
    pub rank_diff: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreChange {
    pub key: String,
    pub original: String,
    pub old_score: f64,
    pub new_score: f64,
    pub score_diff: f64,
}

/// What to do with a consumer's target selection after this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Update,
    Consider,
    Stable,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Update => "update",
            Recommendation::Consider => "consider",
            Recommendation::Stable => "stable",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Recommendation::Update => "significant changes, update the target selection",
            Recommendation::Consider => "minor changes, consider updating",
            Recommendation::Stable => "no changes, the current selection still holds",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the ranked set changed since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffReport {
    pub history_timestamp: String,
    /// Present now, absent before; in current rank order.
    pub new: Vec<HistoryEntry>,
    /// Present before, absent now; in previous rank order.
    pub removed: Vec<HistoryEntry>,
    /// Largest move first.
    pub rank_changes: Vec<RankChange>,
    /// Largest move first.
    pub score_changes: Vec<ScoreChange>,
    /// Mean score change over targets present in both runs.
    pub trend: f64,
    pub recommendation: Recommendation,
}

impl DiffReport {
    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty()
            && self.removed.is_empty()
            && self.rank_changes.is_empty()
            && self.score_changes.is_empty())
    }

    pub fn significant_rank_changes(&self) -> usize {
        self.rank_changes
            .iter()
            .filter(|c| c.rank_diff.abs() >= SIGNIFICANT_RANK_CHANGE)
            .count()
    }
}

/// Index entries by key. On duplicates the best-ranked entry wins.
fn by_key(entries: &[HistoryEntry]) -> BTreeMap<&str, &HistoryEntry> {
    let mut map: BTreeMap<&str, &HistoryEntry> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.key.as_str())
            .and_modify(|kept| {
                if entry.rank < kept.rank {
                    *kept = entry;
                }
            })
            .or_insert(entry);
    }
    map
}

fn recommend(new: usize, removed: usize, significant: usize, any_change: bool) -> Recommendation {
    if new >= UPDATE_THRESHOLD || removed >= UPDATE_THRESHOLD || significant >= UPDATE_THRESHOLD {
        Recommendation::Update
    } else if any_change {
        Recommendation::Consider
    } else {
        Recommendation::Stable
    }
}

/// Compare the current run against a previous snapshot.
pub fn diff(current: &HistorySnapshot, history: &HistorySnapshot) -> DiffReport {
    let current_map = by_key(&current.entries);
    let history_map = by_key(&history.entries);

    let mut new: Vec<HistoryEntry> = current_map
        .iter()
        .filter(|(key, _)| !history_map.contains_key(*key))
        .map(|(_, e)| (*e).clone())
        .collect();
    new.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.key.cmp(&b.key)));

    let mut removed: Vec<HistoryEntry> = history_map
        .iter()
        .filter(|(key, _)| !current_map.contains_key(*key))
        .map(|(_, e)| (*e).clone())
        .collect();
    removed.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.key.cmp(&b.key)));

    let mut rank_changes = Vec::new();
    let mut score_changes = Vec::new();
    let mut score_diffs = Vec::new();

    for (key, now) in &current_map {
        let Some(before) = history_map.get(key) else {
            continue;
        };

        let rank_diff = before.rank as i64 - now.rank as i64;
        if rank_diff != 0 {
            rank_changes.push(RankChange {
                key: key.to_string(),
                original: now.original.clone(),
                old_rank: before.rank,
                new_rank: now.rank,
                rank_diff,
            });
        }

        let score_diff = now.score - before.score;
        score_diffs.push(score_diff);
        if score_diff.abs() >= SCORE_CHANGE_THRESHOLD {
            score_changes.push(ScoreChange {
                key: key.to_string(),
                original: now.original.clone(),
                old_score: before.score,
                new_score: now.score,
                score_diff,
            });
        }
    }

    rank_changes.sort_by(|a, b| {
        b.rank_diff
            .abs()
            .cmp(&a.rank_diff.abs())
            .then_with(|| a.key.cmp(&b.key))
    });
    score_changes.sort_by(|a, b| {
        b.score_diff
            .abs()
            .total_cmp(&a.score_diff.abs())
            .then_with(|| a.key.cmp(&b.key))
    });

    let trend = crate::stats::mean(&score_diffs).unwrap_or(0.0);

    let significant = rank_changes
        .iter()
        .filter(|c| c.rank_diff.abs() >= SIGNIFICANT_RANK_CHANGE)
        .count();
    let any_change =
        !(new.is_empty() && removed.is_empty() && rank_changes.is_empty() && score_changes.is_empty());
    let recommendation = recommend(new.len(), removed.len(), significant, any_change);

    tracing::debug!(
        "History: {} new, {} removed, {} rank changes, {} score changes",
        new.len(),
        removed.len(),
        rank_changes.len(),
        score_changes.len()
    );

    DiffReport {
        history_timestamp: history.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        new,
        removed,
        rank_changes,
        score_changes,
        trend,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::SNAPSHOT_VERSION;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn entry(key: &str, rank: usize, score: f64) -> HistoryEntry {
        HistoryEntry {
            key: key.to_string(),
            rank,
            score,
            delay: 50.0,
            original: key.to_string(),
            loss_rate: Some(0.0),
            jitter: Some(1.0),
        }
    }

    fn snapshot(entries: Vec<HistoryEntry>) -> HistorySnapshot {
        HistorySnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            total_count: entries.len(),
            entries,
        }
    }

    #[test]
    fn test_score_drop_without_rank_change() {
        let history = snapshot(vec![entry("A", 1, 90.0)]);
        let current = snapshot(vec![entry("A", 1, 80.0)]);

        let report = diff(&current, &history);
        assert!(report.rank_changes.is_empty());
        assert_eq!(report.score_changes.len(), 1);
        assert_eq!(report.score_changes[0].key, "A");
        assert_eq!(report.score_changes[0].score_diff, -10.0);
        assert_eq!(report.trend, -10.0);
        assert_eq!(report.recommendation, Recommendation::Consider);
    }

    #[test]
    fn test_small_score_moves_are_ignored() {
        let history = snapshot(vec![entry("A", 1, 90.0), entry("B", 2, 70.0)]);
        let current = snapshot(vec![entry("A", 1, 94.0), entry("B", 2, 66.0)]);

        let report = diff(&current, &history);
        assert!(report.score_changes.is_empty());
        assert!(!report.has_changes());
        assert_eq!(report.trend, 0.0);
        assert_eq!(report.recommendation, Recommendation::Stable);
    }

    #[test]
    fn test_new_removed_and_update_recommendation() {
        let history = snapshot(vec![
            entry("A", 1, 90.0),
            entry("B", 2, 85.0),
            entry("C", 3, 80.0),
            entry("D", 4, 75.0),
        ]);
        let current = snapshot(vec![
            entry("D", 1, 95.0),
            entry("X", 2, 90.0),
            entry("Y", 3, 85.0),
            entry("Z", 4, 80.0),
        ]);

        let report = diff(&current, &history);
        let new: Vec<&str> = report.new.iter().map(|e| e.key.as_str()).collect();
        let removed: Vec<&str> = report.removed.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(new, vec!["X", "Y", "Z"]);
        assert_eq!(removed, vec!["A", "B", "C"]);
        assert_eq!(report.rank_changes[0].rank_diff, 3);
        assert_eq!(report.significant_rank_changes(), 1);
        assert_eq!(report.recommendation, Recommendation::Update);
    }

    #[test]
    fn test_many_large_rank_moves_recommend_update() {
        let history = snapshot((1..=6).map(|i| entry(&format!("h{}", i), i, 50.0)).collect());
        let current = snapshot((1..=6).map(|i| entry(&format!("h{}", i), 7 - i, 50.0)).collect());

        let report = diff(&current, &history);
        // h1<->h6 move 5, h2<->h5 move 3, h3<->h4 move 1
        assert_eq!(report.significant_rank_changes(), 4);
        assert_eq!(report.rank_changes[0].rank_diff.abs(), 5);
        assert_eq!(report.recommendation, Recommendation::Update);
    }

    #[test]
    fn test_duplicate_keys_keep_best_rank() {
        let history = snapshot(vec![entry("A", 3, 60.0), entry("A", 1, 90.0)]);
        let current = snapshot(vec![entry("A", 1, 90.0)]);

        let report = diff(&current, &history);
        assert!(!report.has_changes());
    }

    #[test]
    fn test_diff_symmetry() {
        let a = snapshot(vec![
            entry("A", 1, 90.0),
            entry("B", 2, 70.0),
            entry("C", 3, 60.0),
            entry("E", 4, 40.0),
        ]);
        let b = snapshot(vec![
            entry("C", 1, 95.0),
            entry("A", 2, 80.0),
            entry("D", 3, 75.0),
            entry("E", 4, 42.0),
        ]);

        let forward = diff(&a, &b);
        let backward = diff(&b, &a);

        let keys = |entries: &[HistoryEntry]| entries.iter().map(|e| e.key.clone()).collect::<BTreeSet<_>>();
        assert_eq!(keys(&forward.new), keys(&backward.removed));
        assert_eq!(keys(&forward.removed), keys(&backward.new));

        let ranks = |r: &DiffReport| {
            r.rank_changes
                .iter()
                .map(|c| (c.key.clone(), c.rank_diff))
                .collect::<BTreeMap<_, _>>()
        };
        let (f, b_ranks) = (ranks(&forward), ranks(&backward));
        assert_eq!(f.len(), b_ranks.len());
        for (key, d) in &f {
            assert_eq!(b_ranks[key], -d);
        }

        let scores = |r: &DiffReport| {
            r.score_changes
                .iter()
                .map(|c| (c.key.clone(), c.score_diff))
                .collect::<BTreeMap<_, _>>()
        };
        let (f, b_scores) = (scores(&forward), scores(&backward));
        assert_eq!(f.len(), b_scores.len());
        for (key, d) in &f {
            assert_eq!(b_scores[key], -d);
        }
        assert_eq!(forward.trend, -backward.trend);
    }
}
