use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_attestd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attestd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn weights_not_summing_to_100_refuse_every_compute() {
    let workspace = temp_dir("attestd-weight-invariant");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.create",
        json!({ "name": "CS-201" }),
    );
    let group_id = created
        .get("groupId")
        .and_then(|v| v.as_str())
        .expect("groupId")
        .to_string();
    let created_student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "groupId": group_id, "lastName": "Lee", "firstName": "Avery" }),
    );
    let student_id = created_student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // Stage a misconfig: labs drops to 50, the rest stays, sum = 90.
    // The update stores it (shape is valid); the engine must refuse it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.componentsConfig.update",
        json!({
            "period": "first",
            "patch": { "labs": { "weight": 50.0 } }
        }),
    );

    let one = request_raw(
        &mut stdin,
        &mut reader,
        "5",
        "attestation.computeOne",
        json!({ "studentId": student_id, "period": "first" }),
    );
    assert_eq!(one.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        one.pointer("/error/code").and_then(|v| v.as_str()),
        Some("config_invalid")
    );
    let sum = one
        .pointer("/error/details/weightSum")
        .and_then(|v| v.as_f64())
        .expect("weightSum detail");
    assert!((sum - 90.0).abs() < 1e-9);

    let group = request_raw(
        &mut stdin,
        &mut reader,
        "6",
        "attestation.computeGroup",
        json!({ "groupId": group_id, "period": "first" }),
    );
    assert_eq!(group.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        group.pointer("/error/code").and_then(|v| v.as_str()),
        Some("config_invalid")
    );

    // Restoring the weight makes the same student scoreable again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "setup.componentsConfig.update",
        json!({
            "period": "first",
            "patch": { "labs": { "weight": 60.0 } }
        }),
    );
    let fixed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attestation.computeOne",
        json!({ "studentId": student_id, "period": "first" }),
    );
    assert_eq!(
        fixed.pointer("/result/totalScore").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        fixed.pointer("/result/gradeLabel").and_then(|v| v.as_str()),
        Some("unsatisfactory")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn component_patch_merge_preserves_other_fields() {
    let workspace = temp_dir("attestd-config-merge");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.componentsConfig.update",
        json!({
            "period": "second",
            "patch": { "labs": { "requiredCount": 7 } }
        }),
    );
    assert_eq!(
        updated
            .pointer("/config/labs/requiredCount")
            .and_then(|v| v.as_i64()),
        Some(7)
    );
    // Untouched sibling fields survive the patch.
    assert_eq!(
        updated
            .pointer("/config/labs/gradingScale")
            .and_then(|v| v.as_f64()),
        Some(5.0)
    );
    assert_eq!(
        updated
            .pointer("/config/attendance/weight")
            .and_then(|v| v.as_f64()),
        Some(30.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
