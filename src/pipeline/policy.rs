//! Decision policy: auto-send or hold for review.

use crate::config::TriageConfig;
use crate::pipeline::types::{DecisionKind, Judgment};

/// Auto-send iff the category is eligible and confidence meets the threshold.
pub fn decide(judgment: &Judgment, config: &TriageConfig) -> DecisionKind {
    let eligible = config.auto_categories.contains(&judgment.category);
    if eligible && judgment.confidence >= config.confidence_threshold {
        DecisionKind::AttemptAutoSend
    } else {
        DecisionKind::QueueForReview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Category;

    fn judgment(category: Category, confidence: f32) -> Judgment {
        Judgment::new(category, confidence, "reply")
    }

    #[test]
    fn threshold_is_inclusive() {
        let config = TriageConfig::default();
        assert_eq!(
            decide(&judgment(Category::PriceRequest, 0.80), &config),
            DecisionKind::AttemptAutoSend
        );
        assert_eq!(
            decide(&judgment(Category::PriceRequest, 0.79), &config),
            DecisionKind::QueueForReview
        );
    }

    #[test]
    fn other_is_never_auto_sent_by_default() {
        let config = TriageConfig::default();
        assert_eq!(
            decide(&judgment(Category::Other, 1.0), &config),
            DecisionKind::QueueForReview
        );
    }

    #[test]
    fn every_default_category_is_eligible() {
        let config = TriageConfig::default();
        for category in [
            Category::PriceRequest,
            Category::RepairInquiry,
            Category::AppointmentRequest,
        ] {
            assert_eq!(
                decide(&judgment(category, 0.95), &config),
                DecisionKind::AttemptAutoSend
            );
        }
    }

    #[test]
    fn custom_config_is_respected() {
        let config = TriageConfig::default()
            .with_auto_categories([Category::Other])
            .with_threshold(0.5);
        assert_eq!(
            decide(&judgment(Category::Other, 0.5), &config),
            DecisionKind::AttemptAutoSend
        );
        assert_eq!(
            decide(&judgment(Category::PriceRequest, 0.99), &config),
            DecisionKind::QueueForReview
        );
    }

    #[test]
    fn fallback_judgment_is_always_queued() {
        let config = TriageConfig::default().with_threshold(0.0);
        assert_eq!(
            decide(&Judgment::fallback(), &config),
            DecisionKind::QueueForReview
        );
    }

    #[test]
    fn decision_is_deterministic() {
        let config = TriageConfig::default();
        let j = judgment(Category::RepairInquiry, 0.85);
        let first = decide(&j, &config);
        for _ in 0..10 {
            assert_eq!(decide(&j, &config), first);
        }
    }
}
