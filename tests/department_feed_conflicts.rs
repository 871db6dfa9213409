mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout};
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir, write_fixture};

const SECTIONS_CSV: &str = "\
term_id,course_number,subject_area,catalog_id,instruction_format,section_num,course_title,is_primary,instructor_uid,instructor_role_code,meeting_start_date,meeting_end_date,enrollment_count,cross_listed_with,room_shared_with,foreign_department_course
2222,30643,HISTORY,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,24,30470,,
2222,30470,MELC,C188C,LEC,001,Magical Realism,TRUE,637739,PI,2022-01-18,2022-05-06,11,30643,,
";

const INSTRUCTORS_CSV: &str = "\
uid,sis_id,first_name,last_name,email,affiliations
637739,11667051,Ana,Ruiz,aruiz@berkeley.edu,ACADEMIC
";

const TERMS_CSV: &str = "\
id,name,begin_date,end_date
2222,Spring 2022,2022-01-18,2022-05-06
";

struct Workspace {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    dir: PathBuf,
    history_id: i64,
    melc_id: i64,
}

impl Workspace {
    fn close(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.dir);
    }
}

fn setup(prefix: &str) -> Workspace {
    let dir = temp_dir(prefix);
    let sections = write_fixture(&dir, "sections.csv", SECTIONS_CSV);
    let instructors = write_fixture(&dir, "instructors.csv", INSTRUCTORS_CSV);
    let terms = write_fixture(&dir, "terms.csv", TERMS_CSV);

    let (child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "config.set",
        json!({ "currentTermId": "2222", "earliestTermId": "2222" }),
    );
    for (id, name) in [("s3", "HISTORY"), ("s4", "MELC")] {
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
        "s5",
        "departments.create",
        json!({
            "name": "History",
            "catalogListings": [{ "subjectArea": "HISTORY", "defaultFormName": "HISTORY" }]
        }),
    );
    let melc = request_ok(
        &mut stdin,
        &mut reader,
        "s6",
        "departments.create",
        json!({
            "name": "MELC",
            "catalogListings": [{ "subjectArea": "MELC", "defaultFormName": "MELC" }]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s7",
        "sis.importTerms",
        json!({ "path": terms.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s8",
        "sis.importSections",
        json!({ "path": sections.to_string_lossy(), "termId": "2222" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s9",
        "sis.importInstructors",
        json!({ "path": instructors.to_string_lossy() }),
    );

    Workspace {
        child,
        stdin,
        reader,
        dir,
        history_id: history["department"]["id"].as_i64().expect("history id"),
        melc_id: melc["department"]["id"].as_i64().expect("melc id"),
    }
}

#[test]
fn cross_listed_feed_merges_overrides_and_surfaces_conflicts() {
    let mut ws = setup("evald-feed-conflicts");

    // Untouched feed: one transient evaluation, defaults resolved. The
    // cross-listed section gets no default form, the ACADEMIC instructor
    // gets type F, and the Spring window counts back from the bumped end.
    let feed = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "1",
        "department.get",
        json!({ "departmentId": ws.history_id }),
    );
    assert_eq!(feed["termId"], json!("2222"));
    let sections = feed["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0]["courseNumber"], json!("30643"));
    assert_eq!(sections[0]["crossListedWith"], json!(["30470"]));
    let evaluations = sections[0]["evaluations"].as_array().expect("evaluations");
    assert_eq!(evaluations.len(), 1);
    let eval = &evaluations[0];
    assert_eq!(eval["id"], json!("_2222_30643_637739"));
    assert_eq!(eval["transientId"], json!("_2222_30643_637739"));
    assert!(eval["status"].is_null());
    assert!(eval["departmentForm"].is_null());
    assert_eq!(eval["evaluationType"]["name"], json!("F"));
    assert_eq!(eval["instructor"]["lastName"], json!("Ruiz"));
    assert_eq!(eval["startDate"], json!("2022-04-18"));
    assert_eq!(eval["endDate"], json!("2022-05-08"));
    assert_eq!(eval["modular"], json!(false));
    assert_eq!(eval["valid"], json!(true));
    assert_eq!(feed["conflictCount"], json!(0));

    // Marking with a form materializes the transient row.
    let updated = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "2",
        "evaluations.updateBulk",
        json!({
            "departmentId": ws.history_id,
            "evaluationIds": ["_2222_30643_637739"],
            "fields": { "departmentForm": "HISTORY", "status": "marked" }
        }),
    );
    let updated = updated["updated"].as_array().expect("updated");
    assert_eq!(updated.len(), 1);
    let history_eval_id = updated[0]["id"].as_i64().expect("saved id");
    assert_eq!(updated[0]["transientId"], json!("_2222_30643_637739"));

    let feed = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "3",
        "department.get",
        json!({ "departmentId": ws.history_id }),
    );
    let eval = &feed["sections"][0]["evaluations"][0];
    assert_eq!(eval["id"], json!(history_eval_id));
    assert_eq!(eval["status"], json!("review"));
    assert_eq!(eval["departmentForm"]["name"], json!("HISTORY"));
    assert_eq!(eval["valid"], json!(true));

    // MELC saves a different form on its own course number of the pair.
    request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "4",
        "evaluations.updateBulk",
        json!({
            "departmentId": ws.melc_id,
            "evaluationIds": ["_2222_30470_637739"],
            "fields": { "departmentForm": "MELC" }
        }),
    );

    // Both departments now see the disagreement, values swapped.
    let feed = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "5",
        "department.get",
        json!({ "departmentId": ws.history_id }),
    );
    assert_eq!(feed["conflictCount"], json!(1));
    let eval = &feed["sections"][0]["evaluations"][0];
    assert_eq!(
        eval["conflicts"]["departmentForm"],
        json!([{ "department": "MELC", "value": "MELC" }])
    );
    assert_eq!(eval["valid"], json!(false));

    let feed = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "6",
        "department.get",
        json!({ "departmentId": ws.melc_id }),
    );
    let eval = &feed["sections"][0]["evaluations"][0];
    assert_eq!(eval["status"], json!("review"));
    assert_eq!(
        eval["conflicts"]["departmentForm"],
        json!([{ "department": "History", "value": "HISTORY" }])
    );

    let report = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "7",
        "evaluations.validate",
        json!({ "termId": "2222" }),
    );
    assert_eq!(report["invalid"].as_array().expect("invalid").len(), 2);
    assert_eq!(report["blockerCount"], json!(0));

    ws.close();
}

#[test]
fn duplicate_creates_a_midterm_twin_row() {
    let mut ws = setup("evald-feed-duplicate");
    request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "1",
        "departmentForms.create",
        json!({ "name": "HISTORY_MID" }),
    );

    let marked = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "2",
        "evaluations.updateBulk",
        json!({
            "departmentId": ws.history_id,
            "evaluationIds": ["_2222_30643_637739"],
            "fields": { "departmentForm": "HISTORY", "status": "marked" }
        }),
    );
    let final_id = marked["updated"][0]["id"].as_i64().expect("final id");

    // The midterm flag swaps the clone onto the _MID variant of the form.
    let duplicated = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "3",
        "evaluations.duplicate",
        json!({
            "departmentId": ws.history_id,
            "evaluationIds": [final_id],
            "fields": { "midterm": true, "startDate": "2022-03-01" }
        }),
    );
    let midterm_id = duplicated["created"][0]["id"].as_i64().expect("midterm id");
    assert_ne!(midterm_id, final_id);

    let feed = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "4",
        "department.get",
        json!({ "departmentId": ws.history_id }),
    );
    let evaluations = feed["sections"][0]["evaluations"]
        .as_array()
        .expect("evaluations");
    assert_eq!(evaluations.len(), 2);
    assert_eq!(evaluations[0]["id"], json!(final_id));
    assert_eq!(evaluations[0]["departmentForm"]["name"], json!("HISTORY"));
    assert_eq!(evaluations[1]["id"], json!(midterm_id));
    assert_eq!(evaluations[1]["departmentForm"]["name"], json!("HISTORY_MID"));
    assert_eq!(evaluations[1]["status"], json!("review"));
    assert_eq!(evaluations[1]["startDate"], json!("2022-03-01"));
    assert_eq!(evaluations[1]["endDate"], json!("2022-03-14"));
    assert_eq!(evaluations[1]["modular"], json!(true));
    // The twins are home rows of one department, not a cross-department
    // disagreement.
    assert_eq!(feed["conflictCount"], json!(0));

    ws.close();
}

#[test]
fn section_lookup_distinguishes_malformed_and_missing() {
    let mut ws = setup("evald-section-lookup");

    let malformed = request(
        &mut ws.stdin,
        &mut ws.reader,
        "1",
        "section.get",
        json!({ "courseNumber": "30a43", "termId": "2222" }),
    );
    assert_eq!(error_code(&malformed), "bad_params");

    let missing = request(
        &mut ws.stdin,
        &mut ws.reader,
        "2",
        "section.get",
        json!({ "courseNumber": "999999", "termId": "2222" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let found = request_ok(
        &mut ws.stdin,
        &mut ws.reader,
        "3",
        "section.get",
        json!({ "courseNumber": "30643", "termId": "2222" }),
    );
    assert_eq!(found["section"]["courseNumber"], json!("30643"));
    assert_eq!(found["section"]["courseTitle"], json!("Magical Realism"));
    assert_eq!(
        found["section"]["evaluations"].as_array().expect("evals").len(),
        1
    );

    ws.close();
}
