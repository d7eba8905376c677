//! Cookie jar round-trip and `jar.persist=false` clearing (spec §4.4),
//! and bounded-concurrency parallel speedup (spec §4.5/§5).

use std::time::{Duration, Instant};

use quest_core::{CollectionRunner, Item, RunOptions};
use quest_tests::{collection, registry_with_protocol, request, response_with_headers, MockProtocolPlugin};

/// A `Set-Cookie` from the first response is sent back as `Cookie` on the
/// second request to the same host/path (spec §4.4).
#[tokio::test]
async fn cookie_set_by_first_request_is_sent_on_second() {
    let first = request("r1", "GET", "http://example.test/login");
    let mut second = request("r2", "GET", "http://example.test/login");
    second.common.depends_on = vec!["r1".to_string()];
    second.common.post_request_script = Some(
        "quest.test('cookie jar carried it forward', function () { expect(quest.cookies.get('session')).to.equal('abc123'); });".to_string(),
    );

    let c = collection(vec![Item::Request(first), Item::Request(second)]);

    let login_response = response_with_headers(serde_json::json!({}), vec![("Set-Cookie", "session=abc123; Path=/")]);
    let protocol = MockProtocolPlugin::builder("mock").route("GET", "http://example.test/login", login_response).build();
    let registry = registry_with_protocol(protocol);

    let result = CollectionRunner::new(c, registry, RunOptions::default()).run().await;
    assert_eq!(result.failed_tests, 0, "{:?}", result.request_results);
    assert_eq!(result.passed_tests, 1);
}

/// `jarPersist: false` clears the jar after every request, so a later
/// request to the same host never sees an earlier `Set-Cookie` (spec §4.4).
#[tokio::test]
async fn jar_persist_false_clears_cookies_between_requests() {
    let first = request("r1", "GET", "http://example.test/login");
    let mut second = request("r2", "GET", "http://example.test/login");
    second.common.depends_on = vec!["r1".to_string()];
    second.common.post_request_script =
        Some("quest.test('jar was cleared', function () { expect(quest.cookies.has('session')).to.false(); });".to_string());

    let c = collection(vec![Item::Request(first), Item::Request(second)]);

    let login_response = response_with_headers(serde_json::json!({}), vec![("Set-Cookie", "session=abc123; Path=/")]);
    let protocol = MockProtocolPlugin::builder("mock").route("GET", "http://example.test/login", login_response).build();
    let registry = registry_with_protocol(protocol);

    let options = RunOptions { jar_persist: false, ..Default::default() };
    let result = CollectionRunner::new(c, registry, options).run().await;
    assert_eq!(result.failed_tests, 0, "{:?}", result.request_results);
    assert_eq!(result.passed_tests, 1);
}

/// Two independent requests under `allowParallel: true, maxConcurrency: 2`
/// finish close to the slower one's latency, not their sum (spec §5).
#[tokio::test]
async fn independent_requests_run_in_parallel() {
    let first = request("r1", "GET", "http://example.test/a");
    let second = request("r2", "GET", "http://example.test/b");
    let c = collection(vec![Item::Request(first), Item::Request(second)]);

    let delay = Duration::from_millis(200);
    let protocol = MockProtocolPlugin::builder("mock")
        .slow_route("GET", "http://example.test/a", quest_tests::ok_response(serde_json::json!({})), delay)
        .slow_route("GET", "http://example.test/b", quest_tests::ok_response(serde_json::json!({})), delay)
        .build();
    let registry = registry_with_protocol(protocol);

    let options = RunOptions { allow_parallel: true, max_concurrency: 2, jar_persist: false, ..Default::default() };
    let started = Instant::now();
    let result = CollectionRunner::new(c, registry, options).run().await;
    let elapsed = started.elapsed();

    assert_eq!(result.request_results.len(), 2);
    assert!(elapsed < delay * 2, "parallel requests took {elapsed:?}, expected well under {:?}", delay * 2);
}
