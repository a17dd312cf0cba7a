use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rusqlite::Connection;

use crate::db;
use crate::models::{NormalizedItem, SelectedArticle};

pub const DEFAULT_MAX_FOR_AI: usize = 25;
pub const DEFAULT_PER_SOURCE_CAP: usize = 10;

/// Two titles cluster when their token sets overlap at least this much.
const CLUSTER_JACCARD: f64 = 0.4;
const CLUSTER_WEIGHT: f64 = 6.0;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "THE", "A", "AN", "OF", "IN", "ON", "AND", "OR", "TO", "FOR", "WITH", "AT", "BY", "FROM",
        "ABOUT", "OVER", "AFTER", "BEFORE", "IS", "ARE", "WAS", "WERE", "AS", "NEW", "US",
    ]
    .into_iter()
    .collect()
});

fn title_tokens(title: &str) -> HashSet<String> {
    title
        .to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = (a.len() + b.len()) as f64 - inter;
    if union == 0.0 { 0.0 } else { inter / union }
}

/// Flat parent array with path compression; item counts per run are small
/// enough that the quadratic pair scan is fine.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Freshness + topic-cluster score for every item, in input order.
pub fn score_items(items: &[NormalizedItem], now: DateTime<Utc>) -> Vec<f64> {
    let tokens: Vec<HashSet<String>> = items.iter().map(|i| title_tokens(&i.title)).collect();

    let mut dsu = DisjointSet::new(items.len());
    for a in 0..items.len() {
        for b in (a + 1)..items.len() {
            if jaccard(&tokens[a], &tokens[b]) >= CLUSTER_JACCARD {
                dsu.union(a, b);
            }
        }
    }
    let mut cluster_size: HashMap<usize, usize> = HashMap::new();
    for i in 0..items.len() {
        *cluster_size.entry(dsu.find(i)).or_insert(0) += 1;
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut score = 0.0;
            if let Some(published) = item.published_at {
                let h = (now - published).num_seconds().max(0) as f64 / 3600.0;
                score += 2.0 * (12.0 - h).max(0.0);
                score += (24.0 - h).max(0.0);
            }
            let size = cluster_size[&dsu.find(i)];
            score += CLUSTER_WEIGHT * (size.saturating_sub(1)) as f64;
            score
        })
        .collect()
}

/// Indexes in selection order: score descending, input order on ties, then
/// the per-source cap and the overall budget applied.
pub fn selection_order(
    items: &[NormalizedItem],
    scores: &[f64],
    per_source_cap: usize,
    max_for_ai: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut per_source: HashMap<&str, usize> = HashMap::new();
    let mut accepted = Vec::new();
    for idx in order {
        if accepted.len() == max_for_ai {
            break;
        }
        let count = per_source.entry(items[idx].source.as_str()).or_insert(0);
        if *count >= per_source_cap {
            continue;
        }
        *count += 1;
        accepted.push(idx);
    }
    accepted
}

/// Dedupe + rank + persist for one run. Every unseen item is marked seen and
/// gets its Article row; only the accepted ones become RunArticle rows. The
/// whole triple-insert runs in one short transaction.
pub fn select_for_run(
    conn: &Connection,
    newsletter_id: i64,
    run_id: &str,
    items: &[NormalizedItem],
    now: DateTime<Utc>,
    max_for_ai: usize,
    per_source_cap: usize,
) -> Result<Vec<SelectedArticle>> {
    let tx = conn.unchecked_transaction()?;

    let mut fresh: Vec<NormalizedItem> = Vec::new();
    let mut article_ids: Vec<i64> = Vec::new();
    for item in items {
        if db::is_seen(&tx, newsletter_id, &item.content_hash)? {
            continue;
        }
        db::insert_seen(&tx, newsletter_id, &item.content_hash)?;
        let article_id = db::insert_article_ignore(
            &tx,
            &item.content_hash,
            &item.source,
            &item.title,
            &item.canonical_url,
            item.published_at
                .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .as_deref(),
        )?;
        fresh.push(item.clone());
        article_ids.push(article_id);
    }

    let scores = score_items(&fresh, now);
    let accepted = selection_order(&fresh, &scores, per_source_cap, max_for_ai);

    let mut selected = Vec::with_capacity(accepted.len());
    for (rank0, &idx) in accepted.iter().enumerate() {
        let rank = rank0 + 1;
        db::insert_run_article(&tx, run_id, article_ids[idx], rank, scores[idx])?;
        selected.push(SelectedArticle {
            article_id: article_ids[idx],
            rank,
            score: scores[idx],
            item: fresh[idx].clone(),
        });
    }

    tx.commit()?;
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(title: &str, source: &str, age_hours: i64, now: DateTime<Utc>) -> NormalizedItem {
        let url = format!(
            "https://{source}/{}",
            title.to_lowercase().replace(' ', "-")
        );
        NormalizedItem {
            title: title.to_string(),
            title_norm: title.to_lowercase(),
            canonical_url: url.clone(),
            source: source.to_string(),
            content_hash: crate::canonical::content_hash(
                &title.to_lowercase(),
                &url,
                Some(now - Duration::hours(age_hours)),
                source,
            ),
            published_at: Some(now - Duration::hours(age_hours)),
            summary: None,
        }
    }

    fn setup() -> (Connection, i64) {
        let conn = crate::db::open_memory().unwrap();
        let id = crate::db::insert_newsletter(&conn, "t", "T", "UTC", &[]).unwrap();
        (conn, id)
    }

    #[test]
    fn recency_weights_favor_fresh_items() {
        let now = Utc::now();
        let items = vec![
            item("alpha quarterly earnings shock", "a.example", 1, now),
            item("zeta output figures released", "b.example", 20, now),
        ];
        let scores = score_items(&items, now);
        // 1h old: 2*11 + 23 = 45. 20h old: 0 + 4 = 4.
        assert!((scores[0] - 45.0).abs() < 0.01);
        assert!((scores[1] - 4.0).abs() < 0.01);
    }

    #[test]
    fn cluster_boost_rewards_covered_stories() {
        let now = Utc::now();
        let items = vec![
            item("Acme merger approved by regulators", "a.example", 30, now),
            item("Regulators approve Acme merger deal", "b.example", 30, now),
            item("Unrelated weather report", "c.example", 30, now),
        ];
        let scores = score_items(&items, now);
        assert!((scores[0] - 6.0).abs() < 0.01);
        assert!((scores[1] - 6.0).abs() < 0.01);
        assert!(scores[2].abs() < 0.01);
    }

    #[test]
    fn cluster_growth_never_lowers_scores() {
        let now = Utc::now();
        let mut items = vec![
            item("Acme merger approved by regulators", "a.example", 30, now),
            item("Regulators approve Acme merger deal", "b.example", 30, now),
            item("Unrelated weather report", "c.example", 30, now),
        ];
        let before = score_items(&items, now);
        items.push(item("Acme merger deal approved", "d.example", 30, now));
        let after = score_items(&items, now);
        for i in 0..before.len() {
            assert!(after[i] >= before[i] - 1e-9, "item {i} lost score");
        }
    }

    #[test]
    fn ties_keep_insertion_order() {
        let now = Utc::now();
        let items = vec![
            item("first distinct headline entirely", "a.example", 30, now),
            item("second unrelated story completely", "b.example", 30, now),
        ];
        let scores = score_items(&items, now);
        let order = selection_order(&items, &scores, 10, 25);
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn per_source_cap_and_budget_hold() {
        let now = Utc::now();
        let mut items = Vec::new();
        for i in 0..20 {
            items.push(item(&format!("solo story number {i} entirely distinct"), "a.example", 1, now));
        }
        let scores = score_items(&items, now);
        let order = selection_order(&items, &scores, 10, 25);
        assert_eq!(order.len(), 10);

        // Budget cut: many sources, small budget.
        let mut wide = Vec::new();
        for i in 0..30 {
            wide.push(item(
                &format!("wide story number {i} entirely distinct"),
                &format!("s{i}.example"),
                1,
                now,
            ));
        }
        let scores = score_items(&wide, now);
        assert_eq!(selection_order(&wide, &scores, 10, 25).len(), 25);
    }

    #[test]
    fn seen_items_are_dropped_across_runs() {
        let (conn, nid) = setup();
        let now = Utc::now();
        let items = vec![
            item("alpha quarterly earnings shock", "a.example", 1, now),
            item("zeta output figures released", "b.example", 2, now),
        ];

        crate::db::insert_run_started(&conn, "run-a", nid).unwrap();
        let first = select_for_run(&conn, nid, "run-a", &items, now, 25, 10).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].rank, 1);

        crate::db::insert_run_started(&conn, "run-b", nid).unwrap();
        let second = select_for_run(&conn, nid, "run-b", &items, now, 25, 10).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn duplicate_hash_within_one_batch_selected_once() {
        let (conn, nid) = setup();
        let now = Utc::now();
        let one = item("alpha quarterly earnings shock", "a.example", 1, now);
        let items = vec![one.clone(), one];
        crate::db::insert_run_started(&conn, "run-a", nid).unwrap();
        let selected = select_for_run(&conn, nid, "run-a", &items, now, 25, 10).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn ranks_are_one_based_and_contiguous() {
        let (conn, nid) = setup();
        let now = Utc::now();
        let items: Vec<_> = (0..5)
            .map(|i| item(&format!("headline number {i} entirely distinct"), &format!("s{i}.example"), 1, now))
            .collect();
        crate::db::insert_run_started(&conn, "run-a", nid).unwrap();
        let selected = select_for_run(&conn, nid, "run-a", &items, now, 25, 10).unwrap();
        let ranks: Vec<usize> = selected.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }
}
