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
    let exe = env!("CARGO_BIN_EXE_evald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evald");
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("evald-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["version"].is_string());
    assert!(health["result"]["workspacePath"].is_null());

    // Everything data-bearing requires a workspace first.
    let before = request(&mut stdin, &mut reader, "2", "config.get", json!({}));
    assert_eq!(before["error"]["code"], json!("no_workspace"));

    let selected = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], json!(true));

    let config = request(
        &mut stdin,
        &mut reader,
        "4",
        "config.set",
        json!({ "currentTermId": "2222", "earliestTermId": "2218" }),
    );
    assert_eq!(config["ok"], json!(true));
    assert_eq!(config["result"]["currentTermId"], json!("2222"));
    assert_eq!(config["result"]["exemptDepartmentForms"], json!(["LAW"]));
    let terms = config["result"]["availableTerms"].as_array().expect("terms");
    assert_eq!(terms.len(), 2);
    assert_eq!(terms[0]["id"], json!("2218"));
    assert_eq!(terms[0]["name"], json!("Fall 2021"));
    assert_eq!(terms[1]["code"], json!("2022-B"));

    let bad_term = request(
        &mut stdin,
        &mut reader,
        "5",
        "config.set",
        json!({ "currentTermId": "2223" }),
    );
    assert_eq!(bad_term["error"]["code"], json!("bad_params"));

    let types = request(&mut stdin, &mut reader, "6", "evaluationTypes.list", json!({}));
    let names: Vec<&str> = types["result"]["evaluationTypes"]
        .as_array()
        .expect("types")
        .iter()
        .map(|t| t["name"].as_str().expect("type name"))
        .collect();
    assert_eq!(names, ["F", "G"]);

    let created = request(
        &mut stdin,
        &mut reader,
        "7",
        "departmentForms.create",
        json!({ "name": "HISTORY" }),
    );
    assert_eq!(created["result"]["form"]["name"], json!("HISTORY"));
    let duplicate = request(
        &mut stdin,
        &mut reader,
        "8",
        "departmentForms.create",
        json!({ "name": "HISTORY" }),
    );
    assert_eq!(duplicate["error"]["code"], json!("bad_params"));

    let dept = request(
        &mut stdin,
        &mut reader,
        "9",
        "departments.create",
        json!({
            "name": "History",
            "catalogListings": [
                { "subjectArea": "HISTORY", "defaultFormName": "HISTORY" }
            ]
        }),
    );
    assert_eq!(dept["ok"], json!(true));
    let dept_id = dept["result"]["department"]["id"].as_i64().expect("dept id");
    let listings = dept["result"]["department"]["catalogListings"]
        .as_array()
        .expect("listings");
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0]["defaultForm"]["name"], json!("HISTORY"));

    let listed = request(&mut stdin, &mut reader, "10", "departments.list", json!({}));
    assert_eq!(listed["result"]["departments"].as_array().expect("depts").len(), 1);

    let noted = request(
        &mut stdin,
        &mut reader,
        "11",
        "departments.updateNote",
        json!({ "departmentId": dept_id, "note": "contact the chair before March" }),
    );
    assert_eq!(noted["ok"], json!(true));
    let missing = request(
        &mut stdin,
        &mut reader,
        "12",
        "departments.updateNote",
        json!({ "departmentId": 999, "note": "x" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    // Soft delete frees the name; recreating restores the original row.
    let deleted = request(
        &mut stdin,
        &mut reader,
        "13",
        "departmentForms.delete",
        json!({ "name": "HISTORY" }),
    );
    assert_eq!(deleted["ok"], json!(true));
    let gone = request(
        &mut stdin,
        &mut reader,
        "14",
        "departmentForms.delete",
        json!({ "name": "HISTORY" }),
    );
    assert_eq!(gone["error"]["code"], json!("not_found"));
    let restored = request(
        &mut stdin,
        &mut reader,
        "15",
        "departmentForms.create",
        json!({ "name": "HISTORY" }),
    );
    assert_eq!(restored["ok"], json!(true));
    let forms = request(&mut stdin, &mut reader, "16", "departmentForms.list", json!({}));
    assert_eq!(forms["result"]["forms"].as_array().expect("forms").len(), 1);

    let latest = request(&mut stdin, &mut reader, "17", "exports.latest", json!({}));
    assert_eq!(latest["ok"], json!(true));
    assert!(latest["result"]["run"].is_null());

    let unknown = request(&mut stdin, &mut reader, "18", "planner.open", json!({}));
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
