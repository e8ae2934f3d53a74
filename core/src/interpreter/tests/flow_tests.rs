//! Step sequencing, loops, request building and failure paths

use maplit::btreemap;
use serde_json::json;

use super::helpers::{flow, Journal, MockExecutor};
use crate::config::EngineSettings;
use crate::events::EngineEvent;
use crate::executor::{Method, RequestError};
use crate::hooks::HookRegistry;
use crate::interpreter::{RunError, RunOutcome, RunState};
use crate::template::TemplateError;

#[tokio::test]
async fn test_empty_flow_completes() {
    let run = flow(json!([])).run().await;
    assert_eq!(run.outcome, RunOutcome::Completed);
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn test_top_level_steps_run_in_order() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"get": {"uri": "/one"}},
        {"post": {"uri": "/two"}},
        {"delete": {"uri": "/three"}}
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert!(run.outcome.is_completed());
    let methods: Vec<Method> = executor.requests().iter().map(|r| r.method).collect();
    assert_eq!(methods, vec![Method::Get, Method::Post, Method::Delete]);
    assert_eq!(executor.uris(), vec!["/one", "/two", "/three"]);
}

#[tokio::test]
async fn test_loop_over_literal_binds_each_element_in_order() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"loop": [{"get": {"uri": "/{{ $loopElement }}"}}], "over": ["a", "b", "c"]}
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert!(run.outcome.is_completed());
    assert_eq!(executor.uris(), vec!["/a", "/b", "/c"]);
}

#[tokio::test]
async fn test_loop_count_binds_one_based_counter() {
    let executor = MockExecutor::default();
    flow(json!([
        {"loop": [{"get": {"uri": "/n/{{ $loopCount }}"}}], "count": 3}
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert_eq!(executor.uris(), vec!["/n/1", "/n/2", "/n/3"]);
}

#[tokio::test]
async fn test_nested_count_loop_sees_outer_element() {
    let executor = MockExecutor::default();
    flow(json!([
        {
            "loop": [
                {"loop": [{"get": {"uri": "/{{ $loopElement.id }}/{{ $loopCount }}"}}], "count": 2}
            ],
            "over": [{"id": 1}, {"id": 2}]
        }
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert_eq!(executor.uris(), vec!["/1/1", "/1/2", "/2/1", "/2/2"]);
}

#[tokio::test]
async fn test_over_expression_resolves_from_vars() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"loop": [{"get": {"uri": "/item/{{ $loopElement }}"}}], "over": "{{ ids }}"}
    ]))
    .vars(json!({"ids": [7, 8]}))
    .executor(executor.clone())
    .run()
    .await;

    assert!(run.outcome.is_completed());
    assert_eq!(executor.uris(), vec!["/item/7", "/item/8"]);
}

#[tokio::test]
async fn test_over_expression_must_be_an_array() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"loop": [{"get": {"uri": "/"}}], "over": "{{ ids }}"}
    ]))
    .vars(json!({"ids": "1,2,3"}))
    .executor(executor.clone())
    .run()
    .await;

    assert_eq!(
        run.outcome,
        RunOutcome::Failed(RunError::LoopOverType {
            expression: "{{ ids }}".to_string(),
            found: "a string",
        })
    );
    assert!(executor.requests().is_empty());
}

#[tokio::test]
async fn test_empty_collection_skips_body() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"loop": [{"get": {"uri": "/never"}}], "over": []},
        {"get": {"uri": "/after"}}
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert!(run.outcome.is_completed());
    assert_eq!(executor.uris(), vec!["/after"]);
}

#[tokio::test]
async fn test_loop_bindings_end_with_the_loop() {
    let run = flow(json!([
        {"loop": [{"log": "in {{ $loopElement }}"}], "over": ["x"]},
        {"log": "out {{ $loopElement }}"}
    ]))
    .run()
    .await;

    let logs: Vec<_> = run
        .events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Custom { name, payload, .. } if name == "log" => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(logs, vec![json!("in x"), json!("out ")]);
    assert_eq!(run.context.loop_depth(), 0);
}

#[tokio::test]
async fn test_vars_written_in_loop_persist() {
    let hooks = HookRegistry::builder()
        .function("bump", |ctx, _ee, next| {
            let n = ctx.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
            ctx.set("n", n + 1);
            next.done()
        })
        .build();

    let run = flow(json!([
        {"loop": [{"function": "bump"}], "count": 3}
    ]))
    .hooks(hooks)
    .run()
    .await;

    assert!(run.outcome.is_completed());
    assert_eq!(run.context.get("n"), Some(&json!(3)));
}

#[tokio::test]
async fn test_request_fields_are_resolved() {
    let executor = MockExecutor::default();
    flow(json!([
        {"post": {
            "url": "/users/{{ user.id }}",
            "name": "create {{ user.name }}",
            "headers": {"x-run": "{{ $uuid }}"},
            "json": {"tags": "{{ tags }}", "id": "{{ user.id }}", "fixed": true},
            "body": "id={{ user.id }}"
        }}
    ]))
    .vars(json!({"user": {"id": 42, "name": "ada"}, "tags": ["a", "b"], "$uuid": "run-1"}))
    .executor(executor.clone())
    .run()
    .await;

    let requests = executor.requests();
    let request = &requests[0];
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.uri, "/users/42");
    assert_eq!(request.name.as_deref(), Some("create ada"));
    assert_eq!(request.headers.get("x-run").map(String::as_str), Some("run-1"));
    assert_eq!(
        request.json,
        Some(json!({"tags": ["a", "b"], "id": 42, "fixed": true}))
    );
    assert_eq!(request.body.as_deref(), Some("id=42"));
}

#[tokio::test]
async fn test_target_and_default_headers_are_applied() {
    let executor = MockExecutor::default();
    let settings = EngineSettings {
        target: Some("http://localhost:8080".to_string()),
        default_headers: btreemap! {
            "user-agent".to_string() => "barrage".to_string(),
            "accept".to_string() => "*/*".to_string(),
        },
        ..Default::default()
    };

    flow(json!([
        {"get": {"uri": "/a", "headers": {"accept": "application/json"}}},
        {"get": {"uri": "https://elsewhere.test/b"}}
    ]))
    .settings(settings)
    .executor(executor.clone())
    .run()
    .await;

    let requests = executor.requests();
    assert_eq!(requests[0].uri, "http://localhost:8080/a");
    assert_eq!(
        requests[0].headers.get("accept").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(
        requests[0].headers.get("user-agent").map(String::as_str),
        Some("barrage")
    );
    assert_eq!(requests[1].uri, "https://elsewhere.test/b");
}

#[tokio::test]
async fn test_request_error_fails_the_run() {
    let executor = MockExecutor::new(Journal::default()).failing_on("/bad");
    let run = flow(json!([
        {"get": {"uri": "/ok"}},
        {"get": {"uri": "/bad"}},
        {"get": {"uri": "/never"}}
    ]))
    .executor(executor.clone())
    .run()
    .await;

    assert_eq!(
        run.outcome,
        RunOutcome::Failed(RunError::Request {
            method: Method::Get,
            uri: "/bad".to_string(),
            source: RequestError::network("connection refused"),
        })
    );
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(executor.uris(), vec!["/ok", "/bad"]);
}

#[tokio::test]
async fn test_non_scalar_in_text_fails_the_run() {
    let executor = MockExecutor::default();
    let run = flow(json!([
        {"get": {"uri": "/users?filter={{ filter }}"}}
    ]))
    .vars(json!({"filter": {"age": 3}}))
    .executor(executor.clone())
    .run()
    .await;

    assert!(matches!(
        run.outcome,
        RunOutcome::Failed(RunError::Template(
            TemplateError::NonScalarSubstitution { found: "an object", .. }
        ))
    ));
    assert!(executor.requests().is_empty());
}

#[tokio::test]
async fn test_scaled_think_does_not_block() {
    let settings = EngineSettings {
        think_scale: 0.0,
        ..Default::default()
    };
    let run = flow(json!([{"think": 3600}, {"think": 0}]))
        .settings(settings)
        .run()
        .await;
    assert!(run.outcome.is_completed());
}

#[tokio::test]
async fn test_events_describe_the_run() {
    let run = flow(json!([{"get": {"uri": "/a", "name": "page a"}}])).run().await;
    let run_id = run.context.run_id();

    assert!(run.events.iter().all(|e| e.run_id() == run_id));
    assert!(matches!(run.events[0], EngineEvent::Started { .. }));
    assert_eq!(
        run.events[1],
        EngineEvent::Request {
            run_id,
            method: Method::Get,
            uri: "/a".to_string(),
            name: Some("page a".to_string()),
        }
    );
    assert!(matches!(run.events[2], EngineEvent::Response { status: 200, .. }));
    assert!(matches!(
        run.events[3],
        EngineEvent::Done { state: RunState::Completed, .. }
    ));
    assert_eq!(run.events.len(), 4);
}

#[tokio::test]
async fn test_failure_emits_error_event() {
    let executor = MockExecutor::new(Journal::default()).failing_on("/x");
    let run = flow(json!([{"get": {"uri": "/x"}}]))
        .executor(executor)
        .run()
        .await;

    let error = run
        .events
        .iter()
        .find_map(|event| match event {
            EngineEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        });
    let message = error.expect("no error event");
    assert!(message.contains("/x"), "unexpected message: {}", message);
    assert!(matches!(
        run.events.last(),
        Some(EngineEvent::Done { state: RunState::Failed, .. })
    ));
}
