use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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
    let exe = env!("CARGO_BIN_EXE_lectivod");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lectivod");
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
    value.get("error").cloned().expect("error object")
}

fn seed_conn(workspace: &Path) -> Connection {
    let conn = Connection::open(workspace.join("lectivo.sqlite3")).expect("open seed db");
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .expect("busy timeout");
    conn
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> (Connection, String, Vec<String>) {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let period = request_ok(
        stdin,
        reader,
        "setup-2",
        "periods.create",
        json!({
            "name": "2025-2026",
            "startDate": "2025-09-01",
            "endDate": "2026-07-15",
            "weights": { "insumos": 30, "proyecto": 30, "examen": 40 }
        }),
    );
    let period_id = period
        .get("id")
        .and_then(|v| v.as_str())
        .expect("period id")
        .to_string();
    let trimester_ids: Vec<String> = period
        .get("trimesters")
        .and_then(|v| v.as_array())
        .expect("trimesters")
        .iter()
        .map(|t| t.get("id").and_then(|v| v.as_str()).expect("id").to_string())
        .collect();

    let conn = seed_conn(workspace);
    conn.execute_batch(&format!(
        "INSERT INTO teachers(id, display_name) VALUES('t1', 'Mora');
         INSERT INTO course_sections(id, period_id, name, grade_level, is_final_year, estado)
           VALUES('cs1', '{p}', '2do BGU A', 11, 0, 'ACTIVO');
         INSERT INTO subject_offerings(id, period_id, section_id, subject_name, teacher_id, nature, estado)
           VALUES('o-fis', '{p}', 'cs1', 'Fisica', 't1', 'QUANTITATIVE', 'ACTIVO'),
                 ('o-qui', '{p}', 'cs1', 'Quimica', 't1', 'QUANTITATIVE', 'ACTIVO'),
                 ('o-arte', '{p}', 'cs1', 'Arte', NULL, 'QUALITATIVE', 'ACTIVO');
         INSERT INTO students(id, last_name, first_name, estado, current_section_id)
           VALUES('s1', 'Andrade', 'Ana', 'ACTIVO', 'cs1'),
                 ('s2', 'Zambrano', 'Luis', 'ACTIVO', 'cs1');
         INSERT INTO enrollments(id, student_id, section_id, period_id, estado)
           VALUES('e1', 's1', 'cs1', '{p}', 'ACTIVO'),
                 ('e2', 's2', 'cs1', '{p}', 'ACTIVO');",
        p = period_id
    ))
    .expect("seed roster");
    (conn, period_id, trimester_ids)
}

fn record(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    request_ok(stdin, reader, id, "scores.record", params)
}

fn full_scores(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
    offering: &str,
    student: &str,
    trimester: &str,
    scores: [f64; 3],
) {
    for (kind, score) in ["INSUMOS", "PROYECTO", "EXAMEN"].iter().zip(scores) {
        let _ = record(
            stdin,
            reader,
            &format!("{}-{}", tag, kind),
            json!({
                "offeringId": offering,
                "studentId": student,
                "trimesterId": trimester,
                "evaluationType": kind,
                "score": score,
            }),
        );
    }
}

#[test]
fn gate_groups_every_missing_grade_by_teacher_and_blocks_finalize() {
    let workspace = temp_dir("lectivod-trimester-gate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_conn, period_id, trimesters) = setup(&mut stdin, &mut reader, &workspace);
    let t1 = trimesters[0].as_str();

    // Out of order and double activation are both refused.
    let early = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "trimesters.activate",
        json!({ "trimesterId": trimesters[2] }),
    );
    assert_eq!(
        early.get("code").and_then(|v| v.as_str()),
        Some("precondition_failed")
    );
    assert_eq!(
        early
            .pointer("/details/violations")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "trimesters.activate",
        json!({ "trimesterId": t1 }),
    );
    let twice = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "trimesters.activate",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(
        twice.get("code").and_then(|v| v.as_str()),
        Some("illegal_transition")
    );

    // Ana: Fisica complete, Quimica insumos only. Luis: nothing. Arte: Ana has a letter.
    full_scores(&mut stdin, &mut reader, "4", "o-fis", "s1", t1, [8.0, 7.0, 6.0]);
    let _ = record(
        &mut stdin,
        &mut reader,
        "5",
        json!({
            "offeringId": "o-qui",
            "studentId": "s1",
            "trimesterId": t1,
            "evaluationType": "INSUMOS",
            "score": 9.0,
        }),
    );
    let _ = record(
        &mut stdin,
        &mut reader,
        "6",
        json!({ "offeringId": "o-arte", "studentId": "s1", "trimesterId": t1, "qualitative": "AA" }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "trimesters.checkClosable",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(report.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(report.pointer("/stats/total").and_then(|v| v.as_u64()), Some(6));
    assert_eq!(report.pointer("/stats/complete").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(report.pointer("/stats/incomplete").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(report.pointer("/stats/students").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        report.pointer("/stats/studentsIncomplete").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        report.pointer("/stats/percentComplete").and_then(|v| v.as_f64()),
        Some(33.33)
    );
    let groups = report
        .get("blockingIssuesByTeacher")
        .and_then(|v| v.as_array())
        .expect("groups");
    assert_eq!(groups.len(), 2);
    let mora = groups
        .iter()
        .find(|g| g.get("teacherId").and_then(|v| v.as_str()) == Some("t1"))
        .expect("teacher group");
    assert_eq!(mora.get("incompleteCount").and_then(|v| v.as_u64()), Some(3));
    let items: Vec<&str> = mora
        .get("items")
        .and_then(|v| v.as_array())
        .expect("items")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(items
        .iter()
        .any(|i| i.contains("Andrade, Ana missing PROYECTO, EXAMEN score in Subject Quimica")));
    let unassigned = groups
        .iter()
        .find(|g| g.get("teacherId").map(|v| v.is_null()).unwrap_or(true))
        .expect("unassigned group");
    assert_eq!(unassigned.get("incompleteCount").and_then(|v| v.as_u64()), Some(1));

    let refused = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "trimesters.finalize",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(
        refused.get("code").and_then(|v| v.as_str()),
        Some("incomplete_data")
    );
    assert_eq!(
        refused
            .pointer("/details/blockingIssuesByTeacher")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    // The 8/7/6 example lands at 6.9, band PA.
    let avg = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.trimesterAverage",
        json!({ "studentId": "s1", "offeringId": "o-fis", "trimesterId": t1 }),
    );
    assert_eq!(avg.get("ponderadoInsumos").and_then(|v| v.as_f64()), Some(2.4));
    assert_eq!(avg.get("ponderadoProyecto").and_then(|v| v.as_f64()), Some(2.1));
    assert_eq!(avg.get("ponderadoExamen").and_then(|v| v.as_f64()), Some(2.4));
    assert_eq!(avg.get("notaFinalTrimestre").and_then(|v| v.as_f64()), Some(6.9));
    assert_eq!(avg.get("cualitativa").and_then(|v| v.as_str()), Some("PA"));

    let partial = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "grades.trimesterAverage",
        json!({ "studentId": "s1", "offeringId": "o-qui", "trimesterId": t1 }),
    );
    assert_eq!(
        partial.get("code").and_then(|v| v.as_str()),
        Some("incomplete_data")
    );
    assert_eq!(
        partial.pointer("/details/partial/notaFinalTrimestre"),
        Some(&json!(null))
    );

    // Fill in the rest and close.
    let _ = record(
        &mut stdin,
        &mut reader,
        "11-p",
        json!({ "offeringId": "o-qui", "studentId": "s1", "trimesterId": t1, "evaluationType": "PROYECTO", "score": 9.0 }),
    );
    let _ = record(
        &mut stdin,
        &mut reader,
        "11-e",
        json!({ "offeringId": "o-qui", "studentId": "s1", "trimesterId": t1, "evaluationType": "EXAMEN", "score": 9.0 }),
    );
    full_scores(&mut stdin, &mut reader, "12", "o-fis", "s2", t1, [10.0, 10.0, 10.0]);
    full_scores(&mut stdin, &mut reader, "13", "o-qui", "s2", t1, [4.0, 4.0, 4.0]);
    let _ = record(
        &mut stdin,
        &mut reader,
        "14",
        json!({ "offeringId": "o-arte", "studentId": "s2", "trimesterId": t1, "qualitative": "da" }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "grades.offeringSummary",
        json!({ "offeringId": "o-fis", "trimesterId": t1 }),
    );
    assert_eq!(
        summary.get("rows").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
    // (6.9 + 10.0) / 2
    assert_eq!(
        summary.pointer("/promedios/notaFinalTrimestre").and_then(|v| v.as_f64()),
        Some(8.45)
    );

    let closable = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "trimesters.checkClosable",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(closable.get("ok").and_then(|v| v.as_bool()), Some(true));
    let fin = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "trimesters.finalize",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(fin.pointer("/trimester/estado").and_then(|v| v.as_str()), Some("FINALIZADO"));
    assert_eq!(fin.get("averagesWritten").and_then(|v| v.as_u64()), Some(6));

    // Entry is closed once the trimester is FINALIZADO.
    let late = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "scores.record",
        json!({ "offeringId": "o-fis", "studentId": "s1", "trimesterId": t1, "evaluationType": "EXAMEN", "score": 10.0 }),
    );
    assert_eq!(
        late.pointer("/details/violations/0/code").and_then(|v| v.as_str()),
        Some("trimester_not_active")
    );

    // Weights lock once a trimester has closed.
    let locked = request_err(
        &mut stdin,
        &mut reader,
        "19",
        "weights.set",
        json!({ "periodId": period_id, "insumos": 40, "proyecto": 20, "examen": 40 }),
    );
    assert_eq!(
        locked.get("code").and_then(|v| v.as_str()),
        Some("precondition_failed")
    );
}

#[test]
fn weights_off_100_refuse_aggregation_and_the_gate() {
    let workspace = temp_dir("lectivod-trimester-weights");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_conn, period_id, trimesters) = setup(&mut stdin, &mut reader, &workspace);
    let t1 = trimesters[0].as_str();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "trimesters.activate",
        json!({ "trimesterId": t1 }),
    );
    full_scores(&mut stdin, &mut reader, "2", "o-fis", "s1", t1, [8.0, 7.0, 6.0]);

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "weights.set",
        json!({ "periodId": period_id, "insumos": 30, "proyecto": 30, "examen": 30 }),
    );
    assert_eq!(saved.get("valid").and_then(|v| v.as_bool()), Some(false));

    let avg = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "grades.trimesterAverage",
        json!({ "studentId": "s1", "offeringId": "o-fis", "trimesterId": t1 }),
    );
    assert_eq!(
        avg.get("code").and_then(|v| v.as_str()),
        Some("configuration_error")
    );
    let gate = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "trimesters.checkClosable",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(
        gate.get("code").and_then(|v| v.as_str()),
        Some("configuration_error")
    );

    let out_of_range = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "weights.set",
        json!({ "periodId": period_id, "insumos": 130, "proyecto": -10, "examen": -20 }),
    );
    assert_eq!(
        out_of_range.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
}

#[test]
fn unknown_offering_nature_is_refused_not_guessed() {
    let workspace = temp_dir("lectivod-trimester-nature");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (conn, period_id, trimesters) = setup(&mut stdin, &mut reader, &workspace);
    let t1 = trimesters[0].as_str();
    conn.execute(
        "INSERT INTO subject_offerings(id, period_id, section_id, subject_name, teacher_id, nature, estado)
         VALUES('o-bad', ?, 'cs1', 'Dibujo', NULL, 'NUMERIC', 'ACTIVO')",
        [&period_id],
    )
    .expect("seed offering");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "trimesters.activate",
        json!({ "trimesterId": t1 }),
    );

    let entry = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "scores.record",
        json!({
            "offeringId": "o-bad",
            "studentId": "s1",
            "trimesterId": t1,
            "evaluationType": "INSUMOS",
            "score": 8.0,
        }),
    );
    assert_eq!(entry.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let gate = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "trimesters.checkClosable",
        json!({ "trimesterId": t1 }),
    );
    assert_eq!(gate.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}
