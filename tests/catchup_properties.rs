//! Property tests for catchup delivery.

use factstore::{Fact, FactSpec, FactStore, StoreConfig, SubscriptionEvent, SubscriptionRequest};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn deliver_all(namespaces: &[u8], fetch_size: usize, wanted: u8) -> (Vec<u64>, Vec<u64>) {
    let dir = TempDir::new().unwrap();
    let store = FactStore::create(StoreConfig {
        path: dir.path().join("store"),
        sync_interval: 1000,
        ..StoreConfig::default()
    })
    .unwrap();

    let mut expected = Vec::new();
    for (i, ns) in namespaces.iter().enumerate() {
        let serials = store
            .publish(vec![Fact::new(format!("ns-{}", ns), json!(i))])
            .unwrap();
        if *ns == wanted {
            expected.push(serials[0].0);
        }
    }

    let request = SubscriptionRequest::catchup(vec![FactSpec::ns(format!("ns-{}", wanted))])
        .with_fetch_size(fetch_size);
    let (_sub, rx) = store.subscribe_channel(request, 1024).unwrap();

    let mut delivered = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            SubscriptionEvent::Fact(fact) => delivered.push(fact.serial().unwrap().0),
            SubscriptionEvent::CaughtUp => {}
            SubscriptionEvent::Complete => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    (expected, delivered)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn catchup_delivers_exactly_the_matching_facts(
        namespaces in prop::collection::vec(0u8..3, 0..60),
        fetch_size in 1usize..20,
        wanted in 0u8..3,
    ) {
        let (expected, delivered) = deliver_all(&namespaces, fetch_size, wanted);
        prop_assert_eq!(delivered, expected);
    }
}
