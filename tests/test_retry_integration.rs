//! Integration test for the retry engine and its configuration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use quill::cancellation::CancellationToken;
use quill::config::QuillConfig;
use quill::llm::retry::{self, RetryPolicy};
use quill::QuillError;

#[test]
fn test_retry_policy_from_config() {
    let config = QuillConfig::default();
    let policy = RetryPolicy::from(&config.retry);
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.total_attempts(), 4);
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    // The last delay repeats
    assert_eq!(policy.delay_for(7), Duration::from_secs(4));
}

#[test]
fn test_retry_config_serialization() {
    let config = QuillConfig::default();
    let serialized = serde_json::to_string(&config.retry).expect("Should serialize");
    assert!(serialized.contains("[1000,2000,4000]"), "{}", serialized);

    let deserialized: quill::config::RetryConfig =
        serde_json::from_str(&serialized).expect("Should deserialize");
    assert_eq!(deserialized.backoff_schedule, config.retry.backoff_schedule);
    assert_eq!(deserialized.max_retries, config.retry.max_retries);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let token = CancellationToken::new();

    let start = tokio::time::Instant::now();
    let result = retry::execute(&RetryPolicy::default(), &token, move |attempt| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if attempt <= 2 {
                Err(QuillError::http_status(503, "loading"))
            } else {
                Ok("report")
            }
        }
    })
    .await;

    assert_eq!(assert_ok!(result), "report");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s + 2s of backoff
    assert_eq!(start.elapsed().as_secs(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let result: quill::Result<()> = retry::execute(&RetryPolicy::default(), &token, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(QuillError::transport_error("connection refused"))
        }
    })
    .await;

    assert_eq!(assert_err!(result), QuillError::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
