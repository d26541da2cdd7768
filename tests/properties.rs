//! Property tests for glob matching and subscription idempotence.

use courier::glob::glob_match;
use courier::{
    CommandGateway, Delivery, MemoryBroker, PubSubClient, PubSubConfig, SubscriptionMode, Topology,
};
use proptest::prelude::*;
use std::sync::Arc;

fn channel() -> impl Strategy<Value = String> {
    "[a-z0-9.:_-]{0,16}"
}

proptest! {
    #[test]
    fn literal_patterns_match_only_themselves(text in channel(), other in channel()) {
        prop_assert!(glob_match(&text, &text));
        prop_assert_eq!(glob_match(&text, &other), text == other);
    }

    #[test]
    fn star_matches_everything(text in channel()) {
        prop_assert!(glob_match("*", &text));
    }

    #[test]
    fn prefix_star_matches_extensions(prefix in channel(), suffix in channel()) {
        let pattern = format!("{prefix}*");
        let extended = format!("{prefix}{suffix}");
        prop_assert!(glob_match(&pattern, &extended));
    }

    #[test]
    fn star_separated_segments_match_any_filler(
        segments in prop::collection::vec("[a-z]{0,4}", 1..8),
        filler in channel(),
    ) {
        let pattern = segments.join("*");
        let text = segments.join(&filler);
        prop_assert!(glob_match(&pattern, &text));
    }

    #[test]
    fn question_mark_matches_one_byte(prefix in channel(), c in "[a-z]") {
        let pattern = format!("{prefix}?");
        let one_more = format!("{prefix}{c}");
        prop_assert!(glob_match(&pattern, &one_more));
        prop_assert!(!glob_match(&pattern, &prefix));
    }

    #[test]
    fn escaped_metacharacters_are_literal(prefix in channel()) {
        let pattern = format!("{prefix}\\*");
        let star = format!("{prefix}*");
        let other = format!("{prefix}x");
        prop_assert!(glob_match(&pattern, &star));
        prop_assert!(!glob_match(&pattern, &other));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn repeated_subscribe_is_idempotent(
        topics in prop::collection::vec(channel(), 1..6),
        repeats in 1usize..4,
    ) {
        let broker = MemoryBroker::new();
        let gateway: Arc<dyn CommandGateway> = Arc::new(broker.connect());
        let client = PubSubClient::new(
            gateway,
            Topology::Standalone,
            PubSubConfig::default(),
            Delivery::Queue,
        )
        .unwrap();

        client.subscribe(SubscriptionMode::Exact, topics.clone()).unwrap();
        let once = client.get_subscriptions().desired;
        for _ in 0..repeats {
            client.subscribe(SubscriptionMode::Exact, topics.clone()).unwrap();
        }
        prop_assert_eq!(client.get_subscriptions().desired, once);

        let distinct: std::collections::BTreeSet<&String> = topics.iter().collect();
        prop_assert_eq!(client.get_subscriptions().desired_len(), distinct.len());
    }
}
