//! External cancellation mid-script (spec §4.7): tripping the run's
//! cancellation token while a `quest.sendRequest` call is in flight must
//! unwind that call promptly (not wait out the full request latency), mark
//! the run aborted with the external reason, and stop the scheduler from
//! dispatching any request that had not yet started.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quest_core::{CollectionRunner, Item, RunOptions};
use quest_tests::{collection, registry_with_protocol, request, MockProtocolPlugin};

#[tokio::test]
async fn external_abort_during_send_request_stops_remaining_requests() {
    let mut first = request("r1", "GET", "http://example.test/start");
    first.common.post_request_script =
        Some("quest.sendRequest({ method: 'GET', url: 'http://example.test/delay/5000' });".to_string());
    let second = request("r2", "GET", "http://example.test/never");

    // Default (non-parallel) options chain declared-order siblings, so r2
    // will not start until r1's whole pipeline, including its post-script,
    // has finished.
    let c = collection(vec![Item::Request(first), Item::Request(second)]);

    let protocol = MockProtocolPlugin::builder("mock")
        .route("GET", "http://example.test/start", quest_tests::ok_response(serde_json::json!({})))
        .route("GET", "http://example.test/never", quest_tests::ok_response(serde_json::json!({})))
        .build();
    let registry = registry_with_protocol(protocol);

    let runner = Arc::new(CollectionRunner::new(c, registry, RunOptions::default()));

    let abort_runner = runner.clone();
    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort_runner.abort("user cancelled");
    });

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(2), runner.run())
        .await
        .expect("run must unwind quickly once aborted, not wait out the full 5s delay");
    aborter.await.expect("abort task did not panic");

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.aborted);
    assert_eq!(result.abort_reason.as_deref(), Some("user cancelled"));
    assert_eq!(result.request_results.len(), 1, "r2 must never dispatch once the run is aborted");
    let error = result.request_results[0].error.as_deref().unwrap_or_default();
    assert!(error.to_lowercase().contains("abort"), "expected an abort-flavored error, got {error:?}");
}
