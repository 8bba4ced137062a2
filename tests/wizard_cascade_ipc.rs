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

fn create(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    kind: &str,
    payload: serde_json::Value,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "directory.create",
        json!({ "kind": kind, "payload": payload }),
    )["entity"]["id"]
        .as_str()
        .expect("created id")
        .to_string()
}

#[test]
fn switching_the_class_swaps_the_section_candidates_and_drops_the_selection() {
    let workspace = temp_dir("registrar-wizard-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = create(
        &mut stdin,
        &mut reader,
        "2",
        "teacher",
        json!({
            "name": "R. Sharma", "email": "rs@example.edu",
            "username": "rsharma", "password": "pw123456"
        }),
    );
    let program = create(&mut stdin, &mut reader, "3", "program", json!({ "name": "BCA" }));
    let class_a = create(
        &mut stdin,
        &mut reader,
        "4",
        "class",
        json!({ "program": program, "name": "BCA 2024", "semester": 1, "year": 1, "max_students": 60 }),
    );
    let class_b = create(
        &mut stdin,
        &mut reader,
        "5",
        "class",
        json!({ "program": program, "name": "BCA 2025", "semester": 1, "year": 1, "max_students": 60 }),
    );
    let section_a = create(
        &mut stdin,
        &mut reader,
        "6",
        "section",
        json!({ "class_obj": class_a, "name": "Section A", "max_students": 30 }),
    );
    let section_b = create(
        &mut stdin,
        &mut reader,
        "7",
        "section",
        json!({ "class_obj": class_b, "name": "Section B", "max_students": 30 }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "wizard.open",
        json!({ "wizardId": "assign_class_teacher" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "wizard.set_mode",
        json!({ "step": 0, "mode": "existing" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "wizard.select",
        json!({ "step": 0, "id": teacher }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "11", "wizard.advance", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "wizard.set_mode",
        json!({ "step": 1, "mode": "existing" }),
    );
    let picked = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "wizard.select",
        json!({ "step": 1, "id": class_a }),
    );
    // Choosing a class makes its sections listable.
    let candidates = picked["steps"][2]["candidates"].as_array().expect("sections");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["id"], json!(section_a));

    let _ = request_ok(&mut stdin, &mut reader, "14", "wizard.advance", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "wizard.set_mode",
        json!({ "step": 2, "mode": "existing" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "wizard.select",
        json!({ "step": 2, "id": section_a }),
    );

    // Changing the dependency invalidates the dependent step wholesale: the
    // selection is dropped, the mode resets, and the list is re-fetched for
    // the new class.
    let switched = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "wizard.select",
        json!({ "step": 1, "id": class_b }),
    );
    assert_eq!(switched["steps"][2]["state"]["mode"], json!("unset"));
    let candidates = switched["steps"][2]["candidates"].as_array().expect("sections");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["id"], json!(section_b));

    // The old section belongs to the old list; selecting it must fail.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "wizard.set_mode",
        json!({ "step": 2, "mode": "existing" }),
    );
    let stale = request(
        &mut stdin,
        &mut reader,
        "19",
        "wizard.select",
        json!({ "step": 2, "id": section_a }),
    );
    assert_eq!(stale["ok"], json!(false));
    assert_eq!(stale["error"]["code"], json!("stale_selection"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "wizard.select",
        json!({ "step": 2, "id": section_b }),
    );
}
