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
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn created_id(result: &serde_json::Value) -> String {
    result["entity"]["id"]
        .as_str()
        .expect("created entity id")
        .to_string()
}

#[test]
fn assign_class_teacher_end_to_end() {
    let workspace = temp_dir("registrar-wizard-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Seed the reference data the wizard will pick from.
    let program = created_id(&request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "directory.create",
        json!({ "kind": "program", "payload": { "name": "BCA" } }),
    ));
    let teacher = created_id(&request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "directory.create",
        json!({ "kind": "teacher", "payload": {
            "name": "R. Sharma", "email": "rs@example.edu",
            "username": "rsharma", "password": "pw123456"
        }}),
    ));
    let session = created_id(&request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "directory.create",
        json!({ "kind": "academic_session", "payload": {
            "name": "2024/25", "start_date": "2024-08-01", "is_active": true
        }}),
    ));

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "wizard.open",
        json!({ "wizardId": "assign_class_teacher" }),
    );
    assert_eq!(opened["stepIndex"], json!(0));
    let teacher_candidates = opened["steps"][0]["candidates"]
        .as_array()
        .expect("teacher candidates loaded at mount");
    assert!(teacher_candidates.iter().any(|c| c["id"] == json!(teacher)));
    assert!(opened["steps"][3]["candidates"]
        .as_array()
        .expect("session candidates loaded at mount")
        .iter()
        .any(|c| c["id"] == json!(session)));
    // The section step depends on the class step; nothing to list yet.
    assert_eq!(opened["steps"][2]["candidates"], json!(null));

    // Step 1: reuse an existing teacher.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "wizard.set_mode",
        json!({ "step": 0, "mode": "existing" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "wizard.select",
        json!({ "step": 0, "id": teacher }),
    );
    let after = request_ok(&mut stdin, &mut reader, "8", "wizard.advance", json!({}));
    assert_eq!(after["stepIndex"], json!(1));

    // Step 2: create a class inline.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "wizard.set_mode",
        json!({ "step": 1, "mode": "create" }),
    );
    for (i, (field, value)) in [
        ("program", json!(program)),
        ("name", json!("BCA 2024")),
        ("semester", json!(1)),
        ("year", json!(1)),
        ("max_students", json!(60)),
    ]
    .into_iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("10-{i}"),
            "wizard.set_field",
            json!({ "step": 1, "field": field, "value": value }),
        );
    }
    let _ = request_ok(&mut stdin, &mut reader, "11", "wizard.advance", json!({}));

    // Step 3: the class is brand new, so the section must be created too.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "wizard.set_mode",
        json!({ "step": 2, "mode": "create" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "wizard.set_field",
        json!({ "step": 2, "field": "name", "value": "Section A" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "wizard.set_field",
        json!({ "step": 2, "field": "max_students", "value": 60 }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "15", "wizard.advance", json!({}));

    // Step 4: pick the active session and the assignment date.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "wizard.set_mode",
        json!({ "step": 3, "mode": "existing" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "wizard.select",
        json!({ "step": 3, "id": session }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "wizard.set_scalar",
        json!({ "field": "assigned_from", "value": "2025-01-01" }),
    );

    let submitted = request_ok(&mut stdin, &mut reader, "19", "wizard.submit", json!({}));
    let composite = &submitted["composite"];
    assert_eq!(composite["teacher"], json!(teacher));
    assert_eq!(composite["academic_session"], json!(session));
    assert_eq!(composite["assigned_from"], json!("2025-01-01"));
    let class_id = composite["class_obj"].as_str().expect("class id").to_string();
    let section_id = composite["section"].as_str().expect("section id").to_string();

    let report = submitted["report"].as_array().expect("report");
    assert_eq!(report[0]["source"], json!("reused"));
    assert_eq!(report[1]["source"], json!("created"));
    assert_eq!(report[1]["id"], json!(class_id));
    assert_eq!(report[2]["source"], json!("created"));
    assert!(report.iter().all(|r| r["carriedOver"] == json!(false)));

    // The created entities are visible through the plain directory surface,
    // and the section landed under the freshly created class.
    let sections = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "directory.list",
        json!({ "kind": "section", "filter": { "class_obj": class_id } }),
    );
    let results = sections["results"].as_array().expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!(section_id));

    let links = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "directory.list",
        json!({ "kind": "class_teacher", "filter": {} }),
    );
    assert_eq!(links["results"].as_array().expect("results").len(), 1);

    // Success cleared the draft and reset the wizard.
    let state = request_ok(&mut stdin, &mut reader, "22", "wizard.state", json!({}));
    assert_eq!(state["stepIndex"], json!(0));
    assert_eq!(state["steps"][0]["state"]["mode"], json!("unset"));
}
