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
fn transfer_snapshots_the_old_group_and_later_work_stays_out_of_it() {
    let workspace = temp_dir("attestd-transfer-history");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let group_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.create",
        json!({ "name": "Group A" }),
    )
    .get("groupId")
    .and_then(|v| v.as_str())
    .expect("groupId")
    .to_string();
    let group_b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "groups.create",
        json!({ "name": "Group B" }),
    )
    .get("groupId")
    .and_then(|v| v.as_str())
    .expect("groupId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "groupId": group_a, "lastName": "Ross", "firstName": "Sam" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    for lab_no in 1..=5 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("lab-{}", lab_no),
            "labs.record",
            json!({
                "studentId": student_id,
                "period": "first",
                "labNo": lab_no,
                "grade": 5.0,
                "submittedAt": "2026-03-01",
                "deadline": "2026-03-10"
            }),
        );
    }

    let transfer = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.transfer",
        json!({
            "studentId": student_id,
            "toGroupId": group_b,
            "period": "first"
        }),
    );
    assert_eq!(
        transfer.get("fromGroupId").and_then(|v| v.as_str()),
        Some(group_a.as_str())
    );
    assert_eq!(
        transfer
            .pointer("/snapshot/result/totalScore")
            .and_then(|v| v.as_f64()),
        Some(60.0)
    );

    // Work done after the transfer belongs to the new group only.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "labs.record",
        json!({
            "studentId": student_id,
            "period": "first",
            "labNo": 6,
            "grade": 5.0,
            "submittedAt": "2026-03-05",
            "deadline": "2026-03-10"
        }),
    );

    let report_a = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attestation.computeGroup",
        json!({ "groupId": group_a, "period": "first" }),
    );
    let result_a = report_a.get("result").expect("result");
    assert_eq!(result_a.get("count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result_a.get("average").and_then(|v| v.as_f64()), Some(60.0));
    let per_student = result_a
        .get("perStudent")
        .and_then(|v| v.as_array())
        .expect("perStudent");
    assert_eq!(
        per_student[0].get("totalScore").and_then(|v| v.as_f64()),
        Some(60.0)
    );

    let report_b = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attestation.computeGroup",
        json!({ "groupId": group_b, "period": "first" }),
    );
    let result_b = report_b.get("result").expect("result");
    assert_eq!(result_b.get("count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result_b.get("average").and_then(|v| v.as_f64()), Some(61.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
