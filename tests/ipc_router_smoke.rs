mod test_support;

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout};
use test_support::{spawn_sidecar, temp_dir};

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

/// Like `test_support::request`, but also fails on methods the router does not know.
fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = test_support::request(stdin, reader, id, method, params);
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("cbcrank-router-smoke");
    let bundle_out = workspace.join("smoke-backup.cbcbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], true);
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "label": "Mathematics", "maxMarks": 100 }),
    );
    let subject_id = created
        .get("result")
        .and_then(|v| v.get("subjectId"))
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "4", "subjects.list", json!({}));

    let created_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "registrationNo": "ADM-001",
            "lastName": "Smoke",
            "firstName": "Student",
            "grade": "Grade 6"
        }),
    );
    let student_id = created_student
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "grade": "Grade 6" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "marks.upsert",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "marks": 72,
            "term": 1,
            "academicYear": 2026
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "marks.get",
        json!({ "grade": "Grade 6", "term": 1, "academicYear": 2026 }),
    );
    let _ = request(&mut stdin, &mut reader, "10", "scale.get", json!({}));
    let _ = request(&mut stdin, &mut reader, "11", "settings.get", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "analytics.class.rank",
        json!({ "grade": "Grade 6", "term": 1, "academicYear": 2026 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "analytics.student.result",
        json!({ "studentId": student_id, "term": 1, "academicYear": 2026 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "reports.reportCard",
        json!({ "studentId": student_id, "term": 1, "academicYear": 2026 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "marks.delete",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "term": 1,
            "academicYear": 2026
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_methods_and_bad_lines_get_error_envelopes() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    let payload = json!({ "id": "u1", "method": "classes.list", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let unknown = read_response(&mut reader);
    assert_eq!(unknown["id"], "u1");
    assert_eq!(unknown["error"]["code"], "not_implemented");

    let no_ws = request(
        &mut stdin,
        &mut reader,
        "u2",
        "analytics.class.rank",
        json!({ "grade": "Grade 6", "term": 1, "academicYear": 2026 }),
    );
    assert_eq!(no_ws["error"]["code"], "no_workspace");

    drop(stdin);
    let _ = child.wait();
}
