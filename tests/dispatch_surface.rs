mod common;

use common::TestResult;
use hostlink::dispatch::{CommandRegistry, CommandVariant, ParamKind};
use serde_json::{Value, json};

fn echo_args_variant(params: Vec<ParamKind>) -> CommandVariant {
    CommandVariant::blocking(params, |args| Ok(Value::Array(args)))
}

#[tokio::test(flavor = "multi_thread")]
async fn float_argument_coerces_to_integer_parameter() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "editor.moveCaret",
        "moveCaret",
        vec![echo_args_variant(vec![ParamKind::Int])],
    );
    let result = registry.execute("editor.moveCaret", vec![json!(3.0)]).await;
    assert_eq!(result, Some(json!([3])));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn identifier_map_coerces_to_string_parameter() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "workspace.openFile",
        "openFile",
        vec![echo_args_variant(vec![ParamKind::Str])],
    );
    let result = registry
        .execute("workspace.openFile", vec![json!({"value": "foo"})])
        .await;
    assert_eq!(result, Some(json!(["foo"])));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn two_argument_call_selects_two_parameter_overload() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "diff.open",
        "openDiff",
        vec![
            CommandVariant::blocking(
                vec![ParamKind::Str, ParamKind::Str, ParamKind::Str],
                |_| Ok(json!("three-arg overload")),
            ),
            CommandVariant::blocking(vec![ParamKind::Str, ParamKind::Str], |_| {
                Ok(json!("two-arg overload"))
            }),
        ],
    );
    let result = registry
        .execute("diff.open", vec![json!("left"), json!("right")])
        .await;
    assert_eq!(result, Some(json!("two-arg overload")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_id_reaches_canonical_handler() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "hostlink.applyPatch",
        "applyPatch",
        vec![CommandVariant::blocking(vec![ParamKind::Str], |args| {
            Ok(json!({"applied": args[0]}))
        })],
    );
    assert!(registry.list().contains("hostlink.applyPatch"));

    // Caller still speaks the legacy id; only the canonical one is registered.
    let result = registry
        .execute("extension.applyPatch", vec![json!("fix.patch")])
        .await;
    assert_eq!(result, Some(json!({"applied": "fix.patch"})));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn suspending_handler_resumes_and_returns() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "host.ping",
        "ping",
        vec![CommandVariant::asynchronous(
            vec![ParamKind::Value],
            |args| async move {
                tokio::task::yield_now().await;
                Ok(args.into_iter().next().unwrap_or(Value::Null))
            },
        )],
    );
    let result = registry.execute("host.ping", vec![json!({"seq": 4})]).await;
    assert_eq!(result, Some(json!({"seq": 4})));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failing_command_leaves_others_usable() -> TestResult<()> {
    let registry = CommandRegistry::new();
    registry.register(
        "flaky.op",
        "flakyOp",
        vec![CommandVariant::blocking(vec![], |_| {
            Err("backend unavailable".to_string())
        })],
    );
    registry.register(
        "steady.op",
        "steadyOp",
        vec![CommandVariant::blocking(vec![], |_| Ok(json!("done")))],
    );

    for _ in 0..3 {
        assert_eq!(registry.execute("flaky.op", vec![]).await, None);
    }
    assert_eq!(registry.execute("steady.op", vec![]).await, Some(json!("done")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_executions_of_different_commands_do_not_interfere() -> TestResult<()> {
    let registry = std::sync::Arc::new(CommandRegistry::new());
    for index in 0..8 {
        registry.register(
            &format!("batch.cmd{index}"),
            "batchCmd",
            vec![CommandVariant::blocking(vec![ParamKind::Int], move |args| {
                Ok(json!({"command": index, "arg": args[0]}))
            })],
        );
    }

    let mut handles = Vec::new();
    for index in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .execute(&format!("batch.cmd{index}"), vec![json!(index)])
                .await
        }));
    }
    for (index, handle) in handles.into_iter().enumerate() {
        let result = handle.await?.expect("command result");
        assert_eq!(result["command"], json!(index));
    }
    Ok(())
}
