mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_ok, spawn_sidecar, str_field, temp_dir, Session};

#[test]
fn envelope_health_and_unknown_methods() {
    let workspace = temp_dir("classroomd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    writeln!(stdin, "this is not json").expect("write junk");
    stdin.flush().expect("flush junk");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("bad_json is json");
    assert_eq!(bad.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_json"));

    let unknown = request(&mut stdin, &mut reader, "2", "grades.explode", json!({}));
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    let missing = request(&mut stdin, &mut reader, "3", "workspace.select", json!({}));
    assert_eq!(missing.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_params"));

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected.get("workspacePath").and_then(|v| v.as_str()),
        Some(&*workspace.to_string_lossy())
    );
    assert!(workspace.join("classroom.sqlite3").is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schedules_validate_and_sort_by_weekday() {
    let mut s = Session::start("classroomd-schedules");
    let (_, lect) = s.signup("lena", "Lena Lecturer", "lecturer");
    let class = s.ok("classes.create", json!({ "sessionId": lect, "name": "Timetable" }));
    let (_, stu) = s.signup("sam", "Sam Student", "student");
    s.ok(
        "classes.join",
        json!({ "sessionId": stu, "code": str_field(&class, "classCode") }),
    );

    for (day, start, end, title) in [
        ("Friday", "14:00", "15:00", "Lab"),
        ("monday", "11:00", "12:00", "Tutorial"),
        ("Monday", "09:00", "10:00", "Lecture"),
    ] {
        s.ok(
            "schedules.create",
            json!({ "sessionId": lect, "day": day, "startTime": start, "endTime": end, "title": title }),
        );
    }
    assert_eq!(
        s.err(
            "schedules.create",
            json!({ "sessionId": lect, "day": "Caturday", "startTime": "09:00", "endTime": "10:00", "title": "x" }),
        ),
        "bad_params"
    );
    assert_eq!(
        s.err(
            "schedules.create",
            json!({ "sessionId": lect, "day": "Monday", "startTime": "10:00", "endTime": "09:00", "title": "x" }),
        ),
        "bad_params"
    );
    assert_eq!(
        s.err(
            "schedules.create",
            json!({ "sessionId": stu, "day": "Monday", "startTime": "08:00", "endTime": "09:00", "title": "x" }),
        ),
        "forbidden"
    );

    let listed = s.ok("schedules.list", json!({ "sessionId": stu }));
    let entries = listed
        .get("schedules")
        .and_then(|v| v.as_array())
        .expect("schedules")
        .clone();
    let titles: Vec<String> = entries.iter().map(|e| str_field(e, "title")).collect();
    assert_eq!(titles, vec!["Lecture", "Tutorial", "Lab"]);
    assert_eq!(str_field(&entries[1], "day"), "Monday");

    let removed = s.ok(
        "schedules.delete",
        json!({ "sessionId": lect, "scheduleId": str_field(&entries[0], "id") }),
    );
    assert_eq!(removed.get("deleted").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        s.err(
            "schedules.delete",
            json!({ "sessionId": lect, "scheduleId": str_field(&entries[0], "id") }),
        ),
        "not_found"
    );

    s.finish();
}
