//! Ranking and tiering of scored targets.
//!
//! Loss rate dominates: successful targets are partitioned into loss tiers
//! and ordered by latency within a tier. Failed targets always follow, in
//! the order they were discovered.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scheduler::TargetMetrics;
use crate::scoring::ScoreSet;
use crate::targets::Target;

/// Loss-rate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No loss at all.
    Perfect,
    /// Under 5%.
    Good,
    /// Under 10%.
    Acceptable,
    Poor,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Perfect, Tier::Good, Tier::Acceptable, Tier::Poor];

    pub fn from_loss(loss_rate: f64) -> Tier {
        if loss_rate <= 0.0 {
            Tier::Perfect
        } else if loss_rate < 5.0 {
            Tier::Good
        } else if loss_rate < 10.0 {
            Tier::Acceptable
        } else {
            Tier::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Perfect => "perfect",
            Tier::Good => "good",
            Tier::Acceptable => "acceptable",
            Tier::Poor => "poor",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    /// Loss tier, then latency, then throughput.
    #[default]
    Quality,
    Overall,
    Streaming,
    Gaming,
    Rtc,
    Delay,
    Loss,
}

impl SortBy {
    pub const ALL: [SortBy; 7] = [
        SortBy::Quality,
        SortBy::Overall,
        SortBy::Streaming,
        SortBy::Gaming,
        SortBy::Rtc,
        SortBy::Delay,
        SortBy::Loss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::Quality => "quality",
            SortBy::Overall => "overall",
            SortBy::Streaming => "streaming",
            SortBy::Gaming => "gaming",
            SortBy::Rtc => "rtc",
            SortBy::Delay => "delay",
            SortBy::Loss => "loss",
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortBy::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown sort order: {}", s))
    }
}

/// Final state of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Scored {
        metrics: TargetMetrics,
        scores: ScoreSet,
        tier: Tier,
    },
    Failed {
        reason: String,
    },
}

/// A target with its place in the output.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    /// 1-based position; 0 until ranked.
    pub rank: usize,
    /// Position in the loaded target list.
    pub index: usize,
    pub target: Target,
    pub outcome: Outcome,
}

impl RankedEntry {
    pub fn unranked(index: usize, target: Target, outcome: Outcome) -> Self {
        Self {
            rank: 0,
            index,
            target,
            outcome,
        }
    }

    pub fn metrics(&self) -> Option<&TargetMetrics> {
        match &self.outcome {
            Outcome::Scored { metrics, .. } => Some(metrics),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn scores(&self) -> Option<&ScoreSet> {
        match &self.outcome {
            Outcome::Scored { scores, .. } => Some(scores),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match &self.outcome {
            Outcome::Scored { tier, .. } => Some(*tier),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failed { reason } => Some(reason),
            Outcome::Scored { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Scored { .. })
    }
}

fn compare_scored(
    sort_by: SortBy,
    (a_metrics, a_scores, a_tier): (&TargetMetrics, &ScoreSet, Tier),
    (b_metrics, b_scores, b_tier): (&TargetMetrics, &ScoreSet, Tier),
) -> Ordering {
    let delay = a_metrics.avg_delay.total_cmp(&b_metrics.avg_delay);
    let loss = a_metrics.loss_rate.total_cmp(&b_metrics.loss_rate);
    // Descending: more score first.
    let by_score = |pick: fn(&ScoreSet) -> u32| pick(b_scores).cmp(&pick(a_scores)).then(loss).then(delay);

    match sort_by {
        SortBy::Quality => {
            let a_speed = a_metrics.download_speed().unwrap_or(0.0);
            let b_speed = b_metrics.download_speed().unwrap_or(0.0);
            a_tier
                .cmp(&b_tier)
                .then(delay)
                .then(b_speed.total_cmp(&a_speed))
        }
        SortBy::Overall => by_score(|s| s.overall),
        SortBy::Streaming => by_score(|s| s.streaming),
        SortBy::Gaming => by_score(|s| s.gaming),
        SortBy::Rtc => by_score(|s| s.rtc),
        SortBy::Delay => delay.then(loss),
        SortBy::Loss => loss.then(delay),
    }
}

fn compare(sort_by: SortBy, a: &RankedEntry, b: &RankedEntry) -> Ordering {
    let primary = match (&a.outcome, &b.outcome) {
        (
            Outcome::Scored {
                metrics: am,
                scores: asc,
                tier: at,
            },
            Outcome::Scored {
                metrics: bm,
                scores: bsc,
                tier: bt,
            },
        ) => compare_scored(sort_by, (am, asc, *at), (bm, bsc, *bt)),
        (Outcome::Scored { .. }, Outcome::Failed { .. }) => Ordering::Less,
        (Outcome::Failed { .. }, Outcome::Scored { .. }) => Ordering::Greater,
        (Outcome::Failed { .. }, Outcome::Failed { .. }) => Ordering::Equal,
    };
    primary.then(a.index.cmp(&b.index))
}

/// Order `entries` and assign 1-based ranks.
pub fn rank(mut entries: Vec<RankedEntry>, sort_by: SortBy) -> Vec<RankedEntry> {
    entries.sort_by(|a, b| compare(sort_by, a, b));
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}

/// Number of successful entries per tier, in tier order.
pub fn tier_counts(entries: &[RankedEntry]) -> Vec<(Tier, usize)> {
    Tier::ALL
        .into_iter()
        .map(|tier| (tier, entries.iter().filter(|e| e.tier() == Some(tier)).count()))
        .collect()
}
