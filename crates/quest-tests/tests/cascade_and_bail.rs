//! Variable precedence cascade and bail-on-failure (spec §4.1/§4.7).

use quest_core::{CollectionRunner, Environment, Folder, Item, RunOptions};
use quest_tests::{collection, ok_response, registry_with_protocol, request, MockProtocolPlugin};

/// Iteration row beats scope chain beats collection beats environment
/// beats global for the same key (spec §4.1).
#[tokio::test]
async fn variable_precedence_cascades_in_order() {
    let mut req = request("r1", "GET", "http://example.test/ping");
    req.common.pre_request_script = Some(
        "quest.variables.set('level', 'scope'); \
         quest.test('sees highest-priority value', function () { expect(quest.variables.get('level')).to.equal('row'); });"
            .to_string(),
    );

    let mut c = collection(vec![Item::Request(req)]);
    c.variables.insert("level".to_string(), serde_json::json!("collection"));

    let protocol = MockProtocolPlugin::builder("mock").route("GET", "http://example.test/ping", ok_response(serde_json::json!({}))).build();
    let registry = registry_with_protocol(protocol);

    let options = RunOptions {
        global_variables: [("level".to_string(), serde_json::json!("global"))].into_iter().collect(),
        environment: Some(Environment { name: "env".to_string(), vars: [("level".to_string(), serde_json::json!("environment"))].into_iter().collect() }),
        iteration_data: Some(vec![[("level".to_string(), serde_json::json!("row"))].into_iter().collect()]),
        ..Default::default()
    };

    let runner = CollectionRunner::new(c, registry, options);
    let result = runner.run().await;

    assert_eq!(result.failed_tests, 0, "{:?}", result.request_results);
    assert_eq!(result.passed_tests, 1);
}

/// A failed assertion with `bail: true` stops the run before later
/// requests execute (spec §4.7).
#[tokio::test]
async fn bail_stops_subsequent_requests() {
    let mut first = request("r1", "GET", "http://example.test/one");
    first.common.post_request_script = Some("quest.test('always fails', function () { expect(1).to.equal(2); });".to_string());
    let mut second = request("r2", "GET", "http://example.test/two");
    second.common.depends_on = vec!["r1".to_string()];

    let c = collection(vec![Item::Request(first), Item::Request(second)]);

    let protocol = MockProtocolPlugin::builder("mock")
        .route("GET", "http://example.test/one", ok_response(serde_json::json!({})))
        .route("GET", "http://example.test/two", ok_response(serde_json::json!({})))
        .build();
    let registry = registry_with_protocol(protocol);

    let options = RunOptions { bail: true, ..Default::default() };
    let runner = CollectionRunner::new(c, registry, options);
    let result = runner.run().await;

    assert!(result.aborted);
    assert_eq!(result.failed_tests, 1);
    assert_eq!(result.request_results.len(), 1, "second request must not have run after bail");
}

/// `dependsOn` on a folder waits for that folder's post-script pseudo-node,
/// confirmed indirectly by checking both the parent's pre-script and its
/// child's request both observe the mutation made in the parent pre-script.
#[tokio::test]
async fn folder_pre_script_visible_to_child_request() {
    let mut child = request("r1", "GET", "http://example.test/child");
    child.common.pre_request_script =
        Some("quest.test('sees folder mutation', function () { expect(quest.scope.get('flag')).to.equal(true); });".to_string());

    let folder = Folder {
        common: quest_tests::common("f1"),
        folder_pre_script: Some("quest.scope.set('flag', true);".to_string()),
        folder_post_script: None,
        items: vec![Item::Request(child)],
        test_data: None,
    };

    let c = collection(vec![Item::Folder(folder)]);

    let protocol = MockProtocolPlugin::builder("mock").route("GET", "http://example.test/child", ok_response(serde_json::json!({}))).build();
    let registry = registry_with_protocol(protocol);

    let result = CollectionRunner::new(c, registry, RunOptions::default()).run().await;
    assert_eq!(result.failed_tests, 0, "{:?}", result.request_results);
    assert_eq!(result.passed_tests, 1);
}
