//! Integration tests for Store action broadcasting
//!
//! Actions fed back by effects are observable through `subscribe_actions`,
//! which lets callers wait for the outcome of a request without coupling the
//! reducer to whoever asked.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_arch_core::{Effect, Effects, Reduce, Reducer, case_path, smallvec, state_path};
use composable_arch_runtime::{Store, StoreConfig, StoreError};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TestAction {
    /// Start a saga with correlation ID
    StartSaga { id: u64 },
    /// Saga step completed
    StepCompleted { id: u64, step: u32 },
    /// Saga finished (terminal action)
    SagaCompleted { id: u64 },
    /// Simple increment command
    Increment,
    /// Incremented event
    Incremented { value: u32 },
}

#[derive(Debug, Clone, Default)]
struct TestState {
    counter: u32,
    saga_steps: Vec<u32>,
}

fn test_reducer() -> impl Reducer<State = TestState, Action = TestAction> {
    Reduce::new(|state: &mut TestState, action: TestAction, _| match action {
        TestAction::StartSaga { id } => {
            state.saga_steps.clear();
            smallvec![Effect::future(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some(TestAction::StepCompleted { id, step: 1 })
            })]
        },
        TestAction::StepCompleted { id, step } => {
            state.saga_steps.push(step);
            if step < 3 {
                smallvec![Effect::future(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some(TestAction::StepCompleted { id, step: step + 1 })
                })]
            } else {
                smallvec![Effect::send(TestAction::SagaCompleted { id })]
            }
        },
        TestAction::SagaCompleted { .. } | TestAction::Incremented { .. } => Effects::new(),
        TestAction::Increment => {
            state.counter += 1;
            let value = state.counter;
            smallvec![Effect::future(async move { Some(TestAction::Incremented { value }) })]
        },
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_send_and_wait_for_immediate() {
    let store = Store::new(TestState::default(), test_reducer());

    let result = store
        .send_and_wait_for(
            TestAction::Increment,
            |action| matches!(action, TestAction::Incremented { .. }),
            Duration::from_secs(1),
        )
        .await;

    assert_eq!(result, Ok(TestAction::Incremented { value: 1 }));
}

#[tokio::test]
async fn test_send_and_wait_for_saga() {
    let store = Store::new(TestState::default(), test_reducer());

    let result = store
        .send_and_wait_for(
            TestAction::StartSaga { id: 7 },
            |action| matches!(action, TestAction::SagaCompleted { id: 7 }),
            Duration::from_secs(1),
        )
        .await;

    assert_eq!(result, Ok(TestAction::SagaCompleted { id: 7 }));
    assert_eq!(store.state(|s| s.saga_steps.clone()), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_send_and_wait_for_timeout() {
    let store = Store::new(TestState::default(), test_reducer());

    let result = store
        .send_and_wait_for(
            TestAction::Increment,
            |action| matches!(action, TestAction::SagaCompleted { .. }),
            Duration::from_millis(20),
        )
        .await;

    assert_eq!(result, Err(StoreError::Timeout));
}

#[tokio::test]
async fn test_subscribe_actions_streaming() {
    let store = Store::new(TestState::default(), test_reducer());
    let mut actions = store.subscribe_actions();

    let mut handle = store.send(TestAction::StartSaga { id: 1 }).unwrap();
    handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(actions.recv().await.unwrap());
    }
    assert_eq!(
        received,
        vec![
            TestAction::StepCompleted { id: 1, step: 1 },
            TestAction::StepCompleted { id: 1, step: 2 },
            TestAction::StepCompleted { id: 1, step: 3 },
            TestAction::SagaCompleted { id: 1 },
        ]
    );
}

#[tokio::test]
async fn test_sent_actions_are_not_broadcast() {
    let store = Store::new(TestState::default(), test_reducer());
    let mut actions = store.subscribe_actions();

    let mut handle = store.send(TestAction::Increment).unwrap();
    handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();

    // Only the effect's action is observed, not the Increment itself.
    assert_eq!(actions.recv().await, Ok(TestAction::Incremented { value: 1 }));
}

#[tokio::test]
async fn test_multiple_independent_subscribers() {
    let store = Store::new(TestState::default(), test_reducer());
    let mut first = store.subscribe_actions();
    let mut second = store.subscribe_actions();

    store.send(TestAction::Increment).unwrap();

    assert_eq!(first.recv().await, Ok(TestAction::Incremented { value: 1 }));
    assert_eq!(second.recv().await, Ok(TestAction::Incremented { value: 1 }));
}

#[tokio::test]
async fn test_lagging_subscriber_skips_old_actions() {
    let store = Store::with_config(
        TestState::default(),
        test_reducer(),
        StoreConfig::default().with_broadcast_capacity(2),
    );
    let mut actions = store.subscribe_actions();

    for _ in 0..5 {
        let mut handle = store.send(TestAction::Increment).unwrap();
        handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
    }

    let Ok(TestAction::Incremented { value }) = actions.recv().await else {
        panic!("expected an Incremented action");
    };
    assert!(value > 1, "the oldest actions should have been skipped");
}

#[tokio::test]
async fn test_channel_closed_on_store_drop() {
    let store = Store::new(TestState::default(), test_reducer());
    let mut actions = store.subscribe_actions();
    drop(store);

    assert_eq!(actions.recv().await, Err(StoreError::ChannelClosed));
}

#[tokio::test]
async fn test_delayed_effect_is_broadcast() {
    let store = Store::new(
        0_u32,
        Reduce::new(|count: &mut u32, action: u32, _| {
            *count += action;
            if action == 0 {
                smallvec![Effect::delay(Duration::from_millis(5), 10)]
            } else {
                Effects::new()
            }
        }),
    );

    let result = store
        .send_and_wait_for(0, |action| *action == 10, Duration::from_secs(1))
        .await;

    assert_eq!(result, Ok(10));
    assert_eq!(store.state(|count| *count), 10);
}

// ============================================================================
// Scoped subscriptions
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Parent {
    child: TestState,
    other: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum ParentAction {
    Child(TestAction),
    Other,
}

#[tokio::test]
async fn test_scoped_subscription_only_sees_child_actions() {
    use composable_arch_core::ReducerExt;

    let store = Store::new(
        Parent::default(),
        Reduce::new(|parent: &mut Parent, action: ParentAction, _| {
            if action == ParentAction::Other && parent.other == 0 {
                parent.other += 1;
                return smallvec![Effect::send(ParentAction::Other)];
            }
            Effects::new()
        })
        .combine(test_reducer().scope(state_path!(Parent => child), case_path!(ParentAction::Child))),
    );
    let child = store.scope(state_path!(Parent => child), case_path!(ParentAction::Child));
    let mut child_actions = child.subscribe_actions();

    store.send(ParentAction::Other).unwrap();
    let mut handle = child.send(TestAction::Increment).unwrap();
    handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();

    assert_eq!(child_actions.recv().await, Ok(TestAction::Incremented { value: 1 }));
    assert_eq!(store.state(|parent| parent.other), 1);
}
