use assert_cmd::Command;

fn cmd() -> Command {
    Command::cargo_bin("semantic-sql").unwrap()
}

fn stdout_of(mut command: Command) -> String {
    let assert = command.assert().success();
    String::from_utf8(assert.get_output().stdout.clone()).unwrap()
}

#[test]
fn rewrite_infix_means_without_demo_registry() {
    let mut c = cmd();
    c.arg("rewrite").arg("SELECT * FROM t WHERE col MEANS 'eco'");
    assert!(stdout_of(c).contains("semantic_matches(col,"));
}

#[test]
fn rewrite_json_format_emits_sql_and_null_directive() {
    let mut c = cmd();
    c.arg("rewrite").arg("--format").arg("json").arg("SELECT * FROM t");
    let value: serde_json::Value = serde_json::from_str(stdout_of(c).trim()).unwrap();
    assert_eq!(value["sql"], "SELECT * FROM t");
    assert!(value["directive"].is_null());
}

#[test]
fn rewrite_summarize_requires_the_demo_registry() {
    let mut without = cmd();
    without.arg("rewrite").arg("SELECT SUMMARIZE(review) FROM r");
    assert!(stdout_of(without).contains("SUMMARIZE(review)"));

    let mut with_demo = cmd();
    with_demo.arg("rewrite").arg("--demo-registry").arg("SELECT SUMMARIZE(review) FROM r");
    assert!(stdout_of(with_demo).contains("semantic_summarize_impl(LIST(review)::VARCHAR)"));
}

#[test]
fn tokenize_round_trips_via_lexeme_concatenation() {
    let mut c = cmd();
    c.arg("tokenize").arg("--format").arg("json").arg("SELECT 1 -- comment\n");
    let rows: Vec<serde_json::Value> = serde_json::from_str(stdout_of(c).trim()).unwrap();
    let rebuilt: String = rows.iter().map(|r| r["lexeme"].as_str().unwrap()).collect();
    assert_eq!(rebuilt, "SELECT 1 -- comment\n");
}

#[test]
fn fingerprint_reports_udf_types_and_query_type() {
    let mut c = cmd();
    c.arg("fingerprint").arg("--format").arg("json").arg("SELECT semantic_matches(a, 'x') FROM t");
    let value: serde_json::Value = serde_json::from_str(stdout_of(c).trim()).unwrap();
    assert_eq!(value["udf_types"], serde_json::json!(["semantic_matches"]));
    assert_eq!(value["query_type"], "semantic_op");
}

#[test]
fn background_directive_is_reported_separately_from_the_rewritten_sql() {
    let mut c = cmd();
    c.arg("rewrite").arg("--format").arg("json").arg("BACKGROUND SELECT * FROM t WHERE a MEANS 'x'");
    let stdout = stdout_of(c);
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(value["directive"]["type"], "BACKGROUND");
    assert!(value["sql"].as_str().unwrap().contains("semantic_matches(a,"));
    assert!(!value["sql"].as_str().unwrap().to_ascii_uppercase().contains("BACKGROUND"));
}
