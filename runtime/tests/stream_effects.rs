//! Integration tests for streaming effects

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use async_stream::stream;
use composable_arch_core::{Effect, Effects, Reduce, Reducer, smallvec};
use composable_arch_runtime::Store;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum FeedAction {
    Subscribe(u32),
    Unsubscribe,
    Received(u32),
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Feed {
    items: Vec<u32>,
    finished: bool,
}

const FEED: &str = "feed";

fn feed_reducer() -> impl Reducer<State = Feed, Action = FeedAction> {
    Reduce::new(|feed: &mut Feed, action: FeedAction, _| match action {
        FeedAction::Subscribe(count) => smallvec![
            Effect::stream(stream! {
                for item in 0..count {
                    tokio::task::yield_now().await;
                    yield FeedAction::Received(item);
                }
                yield FeedAction::Finished;
            })
            .cancellable(FEED, true)
        ],
        FeedAction::Unsubscribe => smallvec![Effect::cancel(FEED)],
        FeedAction::Received(item) => {
            feed.items.push(item);
            Effects::new()
        },
        FeedAction::Finished => {
            feed.finished = true;
            Effects::new()
        },
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_stream_items_arrive_in_order() {
    let store = Store::new(Feed::default(), feed_reducer());

    let mut handle = store.send(FeedAction::Subscribe(4)).unwrap();
    handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();

    assert_eq!(
        store.current_state(),
        Feed {
            items: vec![0, 1, 2, 3],
            finished: true,
        }
    );
    assert!(!store.is_in_flight(FEED));
}

#[tokio::test]
async fn test_cancelled_stream_stops_delivering() {
    let store = Store::new(Feed::default(), feed_reducer());
    store.send(FeedAction::Subscribe(u32::MAX)).unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while store.state(|feed| feed.items.len()) < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    store.send(FeedAction::Unsubscribe).unwrap();
    let delivered = store.state(|feed| feed.items.len());
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(store.state(|feed| feed.items.len()), delivered);
    assert!(!store.state(|feed| feed.finished));
    assert!(!store.is_in_flight(FEED));
}

#[test]
fn test_stream_runs_on_a_blocking_runtime() {
    let store = Store::new(Feed::default(), feed_reducer());

    tokio_test::block_on(async {
        let mut handle = store.send(FeedAction::Subscribe(2)).unwrap();
        handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
    });

    assert_eq!(store.state(|feed| feed.items.clone()), vec![0, 1]);
}
