//! In-process cosine k-NN over the verified embedding set.

use crate::models::ExpenseEmbedding;

/// Cosine similarity; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Clone)]
pub struct KnnHit<'a> {
    pub embedding: &'a ExpenseEmbedding,
    pub similarity: f64,
}

/// Scored candidates, best first. Similarity ties within 1e-6 break by most
/// recent `verified_at`, then smallest id, so repeated runs return the same
/// row.
pub fn knn<'a>(query: &[f32], corpus: &'a [ExpenseEmbedding], k: usize) -> Vec<KnnHit<'a>> {
    let mut hits: Vec<KnnHit<'a>> = corpus
        .iter()
        .map(|e| KnnHit {
            similarity: cosine_similarity(query, &e.vector),
            embedding: e,
        })
        .collect();

    hits.sort_by(|a, b| {
        if (a.similarity - b.similarity).abs() > 1e-6 {
            return b
                .similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal);
        }
        b.embedding
            .verified_at
            .cmp(&a.embedding.verified_at)
            .then_with(|| a.embedding.id.cmp(&b.embedding.id))
    });
    hits.truncate(k);
    hits
}

/// Tier-2 acceptance: top-1 similarity over the threshold with a real margin
/// over top-2.
pub fn accept_top_hit<'a>(
    hits: &'a [KnnHit<'a>],
    similarity_threshold: f64,
    margin_threshold: f64,
) -> Option<&'a KnnHit<'a>> {
    let top = hits.first()?;
    if top.similarity < similarity_threshold {
        return None;
    }
    if let Some(second) = hits.get(1) {
        if top.similarity - second.similarity < margin_threshold {
            return None;
        }
    }
    Some(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectKind;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn emb(vector: Vec<f32>, answer: &str, verified_offset_secs: i64) -> ExpenseEmbedding {
        ExpenseEmbedding {
            id: Uuid::new_v4(),
            subject_kind: SubjectKind::Description,
            subject_text: answer.to_lowercase(),
            user_id: None,
            vector,
            category_code: None,
            answer: answer.to_string(),
            verified_by_user: true,
            verified_at: Utc::now() + Duration::seconds(verified_offset_secs),
            stale_after: Utc::now() + Duration::days(180),
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn knn_orders_by_similarity() {
        let corpus = vec![
            emb(vec![0.0, 1.0], "Other", 0),
            emb(vec![1.0, 0.0], "Best", 0),
            emb(vec![0.7, 0.7], "Middle", 0),
        ];
        let hits = knn(&[1.0, 0.0], &corpus, 3);
        assert_eq!(hits[0].embedding.answer, "Best");
        assert_eq!(hits[1].embedding.answer, "Middle");
    }

    #[test]
    fn ties_break_by_recency_then_id() {
        let older = emb(vec![1.0, 0.0], "Older", -100);
        let newer = emb(vec![1.0, 0.0], "Newer", 0);
        let corpus = vec![older, newer];
        let hits = knn(&[1.0, 0.0], &corpus, 2);
        assert_eq!(hits[0].embedding.answer, "Newer");
    }

    #[test]
    fn acceptance_needs_threshold_and_margin() {
        let corpus = vec![
            emb(vec![1.0, 0.0], "A", 0),
            emb(vec![0.999, 0.0447], "B", 0),
        ];
        let hits = knn(&[1.0, 0.0], &corpus, 2);

        // High similarity but the two candidates are too close
        assert!(accept_top_hit(&hits, 0.88, 0.03).is_none());
        // With a tiny margin requirement it passes
        assert!(accept_top_hit(&hits, 0.88, 0.0001).is_some());

        // Below the similarity floor nothing passes
        let far = vec![emb(vec![0.5, 0.866], "C", 0)];
        let far_hits = knn(&[1.0, 0.0], &far, 1);
        assert!(accept_top_hit(&far_hits, 0.88, 0.03).is_none());
    }
}
