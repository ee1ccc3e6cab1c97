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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn exported_bundle_restores_into_a_fresh_workspace() {
    let workspace_a = temp_dir("attestd-backup-src");
    let workspace_b = temp_dir("attestd-backup-dst");
    let bundle = workspace_a.join("export.attest.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace_a.to_string_lossy() }),
    );
    let group_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.create",
        json!({ "name": "Backup Cohort" }),
    )
    .get("groupId")
    .and_then(|v| v.as_str())
    .expect("groupId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "groupId": group_id, "lastName": "Cho", "firstName": "Min" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "labs.record",
        json!({
            "studentId": student_id,
            "period": "first",
            "labNo": 1,
            "grade": 4.0,
            "submittedAt": "2026-03-01",
            "deadline": "2026-03-10"
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("attestation-workspace-v1")
    );
    let digest = exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("dbSha256");
    assert_eq!(digest.len(), 64);

    // Restore into a different, empty workspace.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": workspace_b.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("digestVerified").and_then(|v| v.as_bool()),
        Some(true)
    );

    let groups = request_ok(&mut stdin, &mut reader, "8", "groups.list", json!({}));
    let names: Vec<String> = groups
        .get("groups")
        .and_then(|v| v.as_array())
        .expect("groups")
        .iter()
        .filter_map(|g| g.get("name").and_then(|v| v.as_str()).map(String::from))
        .collect();
    assert_eq!(names, vec!["Backup Cohort".to_string()]);

    let labs = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "labs.list",
        json!({ "studentId": student_id, "period": "first" }),
    );
    let submissions = labs
        .get("submissions")
        .and_then(|v| v.as_array())
        .expect("submissions");
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0].get("grade").and_then(|v| v.as_f64()),
        Some(4.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace_a);
    let _ = std::fs::remove_dir_all(workspace_b);
}
