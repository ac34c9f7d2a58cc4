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
    let exe = env!("CARGO_BIN_EXE_classdiaryd");
    let mut child = Command::new(exe)
        .env_remove("CLASSDIARY_WORKSPACE")
        .env_remove("CLASSDIARY_VARIANT")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classdiaryd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn created_id(result: &serde_json::Value, key: &str) -> String {
    result[key].as_str().expect("created id").to_string()
}

fn row_for<'a>(report: &'a serde_json::Value, subject_id: &str) -> &'a serde_json::Value {
    report["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["subjectId"] == json!(subject_id))
        .expect("row for subject")
}

#[test]
fn higher_final_report_applies_partial_approval_and_exam_path() {
    let workspace = temp_dir("classdiary-final-higher");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let teacher = json!({ "actorId": "teacher", "canModifyExisting": true });

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "variant": "higher" }),
    );
    assert_eq!(selected["variant"], json!("higher"));

    let student = created_id(
        &request_ok(
            &mut stdin,
            &mut reader,
            "st",
            "students.create",
            json!({ "name": "Carla", "enrollmentNo": "U-10", "actor": teacher }),
        ),
        "studentId",
    );

    let names = ["Physics", "Chemistry", "Biology", "Law", "Music", "Art"];
    let mut ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let id = created_id(
            &request_ok(
                &mut stdin,
                &mut reader,
                &format!("sub{}", i),
                "subjects.create",
                json!({ "name": name, "actor": teacher }),
            ),
            "subjectId",
        );
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("les{}", i),
            "lessons.create",
            json!({ "subjectId": id, "date": "2026-04-01", "actor": teacher }),
        );
        ids.push(id);
    }

    let grades: [(usize, &str, f64); 15] = [
        (0, "P1", 8.0),
        (0, "P2", 7.0),
        (0, "P3", 7.3),
        (1, "P1", 9.0),
        (2, "P1", 5.0),
        (2, "P2", 5.0),
        (2, "P3", 5.0),
        (3, "P1", 3.0),
        (3, "P2", 3.0),
        (3, "P3", 3.0),
        (4, "P1", 4.0),
        (4, "P2", 4.0),
        (4, "P3", 4.0),
        (4, "final", 5.0),
        (3, "Final", 10.0),
    ];
    for (i, (subject, label, value)) in grades.iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.set",
            json!({ "studentId": student, "subjectId": ids[*subject], "termLabel": label, "value": value, "actor": teacher }),
        );
    }

    let report = request_ok(&mut stdin, &mut reader, "r1", "reports.finalOpen", json!({}));
    assert_eq!(report["termLabels"], json!(["P1", "P2", "P3"]));
    assert_eq!(report["examLabel"], json!("Final"));

    let physics = row_for(&report, &ids[0]);
    assert_eq!(physics["overallStatus"]["kind"], json!("approved"));

    // One term at 9.0 already clears the 7.0 threshold.
    let chemistry = row_for(&report, &ids[1]);
    assert_eq!(chemistry["gradeStatus"]["kind"], json!("approved"));
    assert_eq!(chemistry["recordedTerms"], json!(1));

    let biology = row_for(&report, &ids[2]);
    assert_eq!(biology["gradeStatus"]["kind"], json!("pendingExam"));
    assert_eq!(biology["overallStatus"]["kind"], json!("pendingExam"));
    assert_eq!(biology["overallLabel"], json!("Pending (final exam)"));

    // Below the exam floor the exam score is never consulted.
    let law = row_for(&report, &ids[3]);
    assert_eq!(law["gradeStatus"]["kind"], json!("failedByGrade"));
    assert_eq!(law["overallStatus"]["kind"], json!("failedOverall"));
    assert_eq!(law["exam"], json!(10.0));

    let music = row_for(&report, &ids[4]);
    assert_eq!(music["gradeStatus"]["kind"], json!("failedByGrade"));
    assert_eq!(music["finalGrade"], json!(4.5));

    let art = row_for(&report, &ids[5]);
    assert_eq!(
        art["gradeStatus"],
        json!({ "kind": "pendingGrades", "recorded": 0, "expected": 3 })
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "exam",
        "grades.set",
        json!({ "studentId": student, "subjectId": ids[2], "termLabel": "Final", "value": 6.0, "actor": teacher }),
    );
    let biology = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.studentSubject",
        json!({ "studentId": student, "subjectId": ids[2] }),
    );
    assert_eq!(biology["gradeStatus"]["kind"], json!("approvedViaCouncilOrExam"));
    assert_eq!(biology["overallStatus"]["kind"], json!("approved"));
    assert_eq!(biology["finalGrade"], json!(5.5));
    assert_eq!(biology["gradeLabel"], json!("Approved (council/exam)"));

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "gg",
        "grades.get",
        json!({ "studentId": student, "subjectId": ids[2] }),
    );
    assert_eq!(grades["labels"], json!(["P1", "P2", "P3", "Final"]));
    assert_eq!(grades["grades"]["Final"], json!(6.0));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
