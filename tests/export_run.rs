mod test_support;

use serde_json::json;
use std::path::Path;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir, write_fixture};

const TERMS_CSV: &str = "\
id,name,begin_date,end_date
2222,Spring 2022,2022-01-18,2022-05-06
";

const INSTRUCTORS_CSV: &str = "\
uid,sis_id,first_name,last_name,email,affiliations
637739,11667051,Ana,Ruiz,aruiz@berkeley.edu,ACADEMIC
";

#[test]
fn export_writes_vendor_bundle_and_records_the_run() {
    let dir = temp_dir("evald-export-success");
    let sections = write_fixture(
        &dir,
        "sections.csv",
        "\
term_id,course_number,subject_area,catalog_id,instruction_format,section_num,course_title,is_primary,instructor_uid,instructor_role_code,meeting_start_date,meeting_end_date,enrollment_count,cross_listed_with,room_shared_with,foreign_department_course
2222,30643,HISTORY,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,24,,,
",
    );
    let instructors = write_fixture(&dir, "instructors.csv", INSTRUCTORS_CSV);
    let students = write_fixture(
        &dir,
        "students.csv",
        "uid,sis_id,first_name,last_name,email\n300848,87654321,Noor,Haddad,nhaddad@berkeley.edu\n",
    );
    let enrollments = write_fixture(
        &dir,
        "enrollments.csv",
        "term_id,course_number,uid\n2222,30643,300848\n",
    );
    let terms = write_fixture(&dir, "terms.csv", TERMS_CSV);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.set",
        json!({ "currentTermId": "2222" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departmentForms.create",
        json!({ "name": "HISTORY" }),
    );
    let dept = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "departments.create",
        json!({
            "name": "History",
            "catalogListings": [{ "subjectArea": "HISTORY", "defaultFormName": "HISTORY" }]
        }),
    );
    let dept_id = dept["department"]["id"].as_i64().expect("dept id");
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "departments.setContact",
        json!({
            "departmentId": dept_id,
            "uid": "400500",
            "firstName": "Dana",
            "lastName": "Okafor",
            "email": "dokafor@berkeley.edu",
            "canViewResponseRates": true,
            "forms": ["HISTORY"]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sis.importTerms",
        json!({ "path": terms.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sis.importSections",
        json!({ "path": sections.to_string_lossy(), "termId": "2222" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sis.importInstructors",
        json!({ "path": instructors.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sis.importStudents",
        json!({ "path": students.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "sis.importEnrollments",
        json!({ "path": enrollments.to_string_lossy(), "termId": "2222" }),
    );

    // Everything required resolves from defaults, so the bare confirm passes.
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "evaluations.updateBulk",
        json!({
            "departmentId": dept_id,
            "evaluationIds": ["_2222_30643_637739"],
            "fields": { "status": "confirmed" }
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluations.export",
        json!({ "termId": "2222" }),
    );
    assert_eq!(exported["termId"], json!("2222"));
    assert_eq!(exported["evaluationCount"], json!(1));
    let run_id = exported["runId"].as_str().expect("run id").to_string();
    assert_eq!(exported["rowCounts"]["courses"], json!(1));
    assert_eq!(exported["rowCounts"]["course_instructors"], json!(1));
    assert_eq!(exported["rowCounts"]["course_students"], json!(1));
    assert_eq!(exported["rowCounts"]["course_supervisors"], json!(1));
    assert_eq!(exported["rowCounts"]["students"], json!(1));
    assert_eq!(exported["rowCounts"]["instructors"], json!(1));
    assert_eq!(exported["rowCounts"]["supervisors"], json!(1));

    let run_dir = Path::new(exported["path"].as_str().expect("run path"));
    let courses = std::fs::read_to_string(run_dir.join("courses.csv")).expect("courses.csv");
    let mut lines = courses.lines();
    assert!(lines.next().expect("header").starts_with("COURSE_ID,COURSE_ID_2,"));
    let row = lines.next().expect("course row");
    assert!(row.starts_with("2022-B-30643,2022-B-30643,Magical Realism,"));
    assert!(row.contains(",HISTORY,F,"));
    assert!(run_dir.join("manifest.json").is_file());
    assert!(Path::new(exported["bundlePath"].as_str().expect("bundle")).is_file());

    let runs = request_ok(&mut stdin, &mut reader, "13", "exports.list", json!({}));
    let runs = runs["runs"].as_array().expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["runId"], json!(run_id));
    assert_eq!(runs[0]["status"], json!("success"));
    assert!(runs[0]["finishedAt"].is_string());

    let latest = request_ok(&mut stdin, &mut reader, "14", "exports.latest", json!({}));
    assert_eq!(latest["run"]["runId"], json!(run_id));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn cross_listed_confirmation_exports_one_course() {
    let dir = temp_dir("evald-export-crosslisted");
    let sections = write_fixture(
        &dir,
        "sections.csv",
        "\
term_id,course_number,subject_area,catalog_id,instruction_format,section_num,course_title,is_primary,instructor_uid,instructor_role_code,meeting_start_date,meeting_end_date,enrollment_count,cross_listed_with,room_shared_with,foreign_department_course
2222,30643,HISTORY,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,24,30470,,
2222,30470,MELC,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,11,30643,,
",
    );
    let instructors = write_fixture(&dir, "instructors.csv", INSTRUCTORS_CSV);
    let terms = write_fixture(&dir, "terms.csv", TERMS_CSV);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.set",
        json!({ "currentTermId": "2222" }),
    );
    for (id, name) in [("3", "HISTORY"), ("4", "MELC")] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "departmentForms.create",
            json!({ "name": name }),
        );
    }
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "departments.create",
        json!({
            "name": "History",
            "catalogListings": [{ "subjectArea": "HISTORY", "defaultFormName": "HISTORY" }]
        }),
    );
    let history_id = history["department"]["id"].as_i64().expect("history id");
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "departments.create",
        json!({
            "name": "MELC",
            "catalogListings": [{ "subjectArea": "MELC", "defaultFormName": "MELC" }]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sis.importTerms",
        json!({ "path": terms.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sis.importSections",
        json!({ "path": sections.to_string_lossy(), "termId": "2222" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sis.importInstructors",
        json!({ "path": instructors.to_string_lossy() }),
    );

    // Only History confirms; MELC never saves a row of its own. Its feed
    // inherits the confirmed status, but only the saved row exports.
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "evaluations.updateBulk",
        json!({
            "departmentId": history_id,
            "evaluationIds": ["_2222_30643_637739"],
            "fields": {
                "status": "confirmed",
                "departmentForm": "HISTORY",
                "evaluationType": "F",
                "instructorUid": "637739",
                "startDate": "2022-04-18"
            }
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "evaluations.validate",
        json!({ "termId": "2222" }),
    );
    assert_eq!(report["blockerCount"], json!(0));

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluations.export",
        json!({ "termId": "2222" }),
    );
    assert_eq!(exported["evaluationCount"], json!(1));
    assert_eq!(exported["rowCounts"]["courses"], json!(1));
    assert_eq!(exported["rowCounts"]["course_instructors"], json!(1));

    let run_dir = Path::new(exported["path"].as_str().expect("run path"));
    let courses = std::fs::read_to_string(run_dir.join("courses.csv")).expect("courses.csv");
    let rows: Vec<&str> = courses.lines().skip(1).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].starts_with("2022-B-30643,"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn conflicting_confirmed_rows_block_the_export() {
    let dir = temp_dir("evald-export-blocked");
    let sections = write_fixture(
        &dir,
        "sections.csv",
        "\
term_id,course_number,subject_area,catalog_id,instruction_format,section_num,course_title,is_primary,instructor_uid,instructor_role_code,meeting_start_date,meeting_end_date,enrollment_count,cross_listed_with,room_shared_with,foreign_department_course
2222,30643,HISTORY,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,24,30470,,
2222,30470,MELC,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,11,30643,,
",
    );
    let instructors = write_fixture(&dir, "instructors.csv", INSTRUCTORS_CSV);
    let terms = write_fixture(&dir, "terms.csv", TERMS_CSV);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.set",
        json!({ "currentTermId": "2222" }),
    );
    for (id, name) in [("3", "HISTORY"), ("4", "MELC")] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "departmentForms.create",
            json!({ "name": name }),
        );
    }
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "departments.create",
        json!({
            "name": "History",
            "catalogListings": [{ "subjectArea": "HISTORY", "defaultFormName": "HISTORY" }]
        }),
    );
    let history_id = history["department"]["id"].as_i64().expect("history id");
    let melc = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "departments.create",
        json!({
            "name": "MELC",
            "catalogListings": [{ "subjectArea": "MELC", "defaultFormName": "MELC" }]
        }),
    );
    let melc_id = melc["department"]["id"].as_i64().expect("melc id");
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sis.importTerms",
        json!({ "path": terms.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sis.importSections",
        json!({ "path": sections.to_string_lossy(), "termId": "2222" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sis.importInstructors",
        json!({ "path": instructors.to_string_lossy() }),
    );

    // The cross-listed section has no default form, so the confirmation
    // must carry all four required fields. No peer exists yet.
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "evaluations.updateBulk",
        json!({
            "departmentId": history_id,
            "evaluationIds": ["_2222_30643_637739"],
            "fields": {
                "status": "confirmed",
                "departmentForm": "HISTORY",
                "evaluationType": "F",
                "instructorUid": "637739",
                "startDate": "2022-04-18"
            }
        }),
    );
    // A later disagreement turns the confirmed row into a blocker.
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "evaluations.updateBulk",
        json!({
            "departmentId": melc_id,
            "evaluationIds": ["_2222_30470_637739"],
            "fields": { "departmentForm": "MELC" }
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluations.validate",
        json!({ "termId": "2222" }),
    );
    assert!(report["blockerCount"].as_u64().expect("blockers") >= 1);

    let blocked = request(
        &mut stdin,
        &mut reader,
        "13",
        "evaluations.export",
        json!({ "termId": "2222" }),
    );
    assert_eq!(error_code(&blocked), "export_blocked");
    assert!(!blocked["error"]["details"]["evaluationIds"]
        .as_array()
        .expect("blocker ids")
        .is_empty());

    // Nothing was recorded for the refused run.
    let latest = request_ok(&mut stdin, &mut reader, "14", "exports.latest", json!({}));
    assert!(latest["run"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}
