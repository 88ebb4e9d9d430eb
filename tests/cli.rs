use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

const PROFILES: &str = r#"{"st": "a", "matches": {"gene1": 1, "gene2": 1, "gene3": 1}, "schemeSize": 3}
{"st": "b", "matches": {"gene1": 2, "gene2": 2, "gene4": 1}, "schemeSize": 3}
{"st": "c", "matches": {"gene1": 1, "gene2": 2, "gene3": 1, "gene4": 1}, "schemeSize": 4}
"#;

fn write_input(path: &Path, sts: &[&str], threshold: i32) {
    let request = serde_json::json!({ "sts": sts, "threshold": threshold });
    let mut text = format!("{request}\n");
    for line in PROFILES.lines() {
        let st: Value = serde_json::from_str(line).expect("profile json");
        if sts.iter().any(|&wanted| st["st"] == wanted) {
            text.push_str(line);
            text.push('\n');
        }
    }
    fs::write(path, text).expect("write input");
}

fn read_documents(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("read output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("output json"))
        .collect()
}

#[test]
fn cli_writes_outputs_labels_and_a_cache_that_a_second_run_reuses() {
    let tmp = tempdir().expect("temporary directory");
    let exe = env!("CARGO_BIN_EXE_cgclust");

    let first_input = tmp.path().join("first.jsonl");
    write_input(&first_input, &["a", "b"], 3);
    let first_output = tmp.path().join("first.out.jsonl");
    let cache = tmp.path().join("cache.json");
    let status = Command::new(exe)
        .args([
            first_input.to_str().expect("path str"),
            "--workers",
            "2",
            "--output",
            first_output.to_str().expect("path str"),
            "--write-cache",
            cache.to_str().expect("path str"),
        ])
        .status()
        .expect("run cgclust");
    assert!(status.success(), "first run exited with status {status:?}");

    let documents = read_documents(&first_output);
    assert_eq!(documents.len(), 5);
    assert_eq!(documents[2]["edges"]["2"], serde_json::json!([[0, 1]]));
    assert_eq!(documents[4]["pi"], serde_json::json!([1, 1]));
    assert!(cache.exists(), "cache file missing");

    let second_input = tmp.path().join("second.jsonl");
    write_input(&second_input, &["a", "b", "c"], 1);
    let second_output = tmp.path().join("second.out.jsonl");
    let labels = tmp.path().join("labels.tsv");
    let status = Command::new(exe)
        .args([
            second_input.to_str().expect("path str"),
            "--cache",
            cache.to_str().expect("path str"),
            "--output",
            second_output.to_str().expect("path str"),
            "--labels",
            labels.to_str().expect("path str"),
            "--cut",
            "0,1",
        ])
        .status()
        .expect("run cgclust");
    assert!(status.success(), "second run exited with status {status:?}");

    let documents = read_documents(&second_output);
    assert_eq!(documents.len(), 3);
    assert_eq!(documents[1]["edges"]["1"], serde_json::json!([[0, 2], [1, 2]]));
    assert_eq!(documents[2]["sts"], serde_json::json!(["a", "b", "c"]));
    assert_eq!(
        fs::read_to_string(&labels).expect("read labels"),
        "st\tt0\tt1\na\ta\tc\nb\tb\tc\nc\tc\tc\n"
    );
}

#[test]
fn cli_fails_cleanly_when_a_profile_is_missing() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("input.jsonl");
    fs::write(&input, "{\"sts\": [\"a\", \"zz\"], \"threshold\": 1}\n").expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_cgclust"))
        .arg(&input)
        .output()
        .expect("run cgclust");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr was {stderr}");
}

#[test]
fn cli_rejects_a_cut_without_a_labels_file() {
    let output = Command::new(env!("CARGO_BIN_EXE_cgclust"))
        .args(["--cut", "1"])
        .output()
        .expect("run cgclust");
    assert!(!output.status.success());
}
