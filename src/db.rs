use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::scoring::{
    ActivityEntry, AttendanceMark, AttendanceStatus, ComponentsConfig, LabSubmission, Period,
    PeriodConfig, StudentInputs, TestSubmission,
};

pub const DB_FILE: &str = "attestation.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at INTEGER,
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group_sort ON students(group_id, sort_order)",
        [],
    )?;

    // The session calendar is the attendance denominator. Entered by the
    // caller (schedule sync is an external concern), never inferred.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_sessions(
            group_id TEXT NOT NULL,
            period TEXT NOT NULL,
            session_date TEXT NOT NULL,
            PRIMARY KEY(group_id, period, session_date),
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lab_submissions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            lab_no INTEGER NOT NULL,
            grade REAL,
            submitted_at TEXT,
            deadline TEXT,
            updated_at INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, period, lab_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lab_submissions_student ON lab_submissions(student_id, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_marks(
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            session_date TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, period, session_date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_marks_student ON attendance_marks(student_id, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            points REAL,
            description TEXT NOT NULL,
            created_at INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_entries_student ON activity_entries(student_id, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS test_submissions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            test_no INTEGER NOT NULL,
            attempt INTEGER NOT NULL,
            grade REAL,
            taken_at TEXT,
            deadline TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, period, test_no, attempt)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_test_submissions_student ON test_submissions(student_id, period)",
        [],
    )?;

    // Frozen results. The UNIQUE triple is the idempotence guard for
    // concurrent transfer requests.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_snapshots(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            group_id TEXT NOT NULL,
            taken_at INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            result_json TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(group_id) REFERENCES groups(id),
            UNIQUE(student_id, period, group_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_snapshots_group ON score_snapshots(group_id, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    ensure_students_updated_at(&conn)?;
    ensure_lab_submissions_updated_at(&conn)?;

    Ok(conn)
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at INTEGER", [])?;
    Ok(())
}

fn ensure_lab_submissions_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "lab_submissions", "updated_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE lab_submissions ADD COLUMN updated_at INTEGER",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn period_config_key(period: Period) -> String {
    format!("attestation.period.{}", period.key())
}

pub fn components_config_key(period: Period) -> String {
    format!("attestation.components.{}", period.key())
}

/// Institution defaults used until an administrator saves a config:
/// a 100-point period with a four-band scale, labs 60 / attendance 30 /
/// activity 10, tests disabled.
pub fn default_period_config(period: Period) -> serde_json::Value {
    serde_json::json!({
        "period": period.key(),
        "maxPoints": 100.0,
        "minPassingPoints": 60.0,
        "gradeBands": [
            { "label": "excellent", "lower": 85.0, "upper": 100.0 },
            { "label": "good", "lower": 70.0, "upper": 85.0 },
            { "label": "satisfactory", "lower": 60.0, "upper": 70.0 },
            { "label": "unsatisfactory", "lower": 0.0, "upper": 60.0 }
        ]
    })
}

pub fn default_components_config() -> serde_json::Value {
    serde_json::json!({
        "labs": {
            "enabled": true,
            "weight": 60.0,
            "gradingMode": "graded",
            "gradingScale": 5.0,
            "requiredCount": 5,
            "bonusPerExtra": 1.0,
            "softDeadlineDays": 7,
            "softDeadlinePenalty": 0.8,
            "hardDeadlinePenalty": 0.5,
            "bonusCappedByReserve": false
        },
        "attendance": {
            "enabled": true,
            "weight": 30.0,
            "mode": "per_class",
            "pointsPerClass": 1.0,
            "maxPoints": 30.0,
            "lateWeight": 1.0,
            "excusedCounts": true,
            "penaltyEnabled": false,
            "penaltyPerAbsence": 0.0
        },
        "tests": {
            "enabled": false,
            "weight": 0.0,
            "gradingScale": 100.0,
            "requiredCount": 2,
            "retakesAllowed": true,
            "maxRetakes": 1,
            "retakePenalty": 0.2,
            "bestOf": null
        },
        "activity": {
            "enabled": true,
            "weight": 10.0,
            "maxPoints": 10.0,
            "pointsPerEntry": 1.0,
            "allowNegative": true,
            "negativeLimit": 10.0
        }
    })
}

pub fn load_period_config(conn: &Connection, period: Period) -> anyhow::Result<PeriodConfig> {
    let value = settings_get_json(conn, &period_config_key(period))?
        .unwrap_or_else(|| default_period_config(period));
    Ok(serde_json::from_value(value)?)
}

pub fn load_components_config(
    conn: &Connection,
    period: Period,
) -> anyhow::Result<ComponentsConfig> {
    let value = settings_get_json(conn, &components_config_key(period))?
        .unwrap_or_else(default_components_config);
    Ok(serde_json::from_value(value)?)
}

pub fn student_group(conn: &Connection, student_id: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT group_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn group_exists(conn: &Connection, group_id: &str) -> anyhow::Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM groups WHERE id = ?", [group_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn list_group_member_ids(conn: &Connection, group_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM students WHERE group_id = ? AND active = 1 ORDER BY sort_order, id",
    )?;
    let ids = stmt
        .query_map([group_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn list_all_student_ids(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE active = 1 ORDER BY id")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

pub fn session_count(conn: &Connection, group_id: &str, period: Period) -> anyhow::Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM class_sessions WHERE group_id = ? AND period = ?",
        (group_id, period.key()),
        |r| r.get(0),
    )?;
    Ok(n as usize)
}

/// Read-only input snapshot for one student and period — everything the
/// engine consumes for a single `compute_one` call.
pub fn fetch_student_inputs(
    conn: &Connection,
    student_id: &str,
    period: Period,
) -> anyhow::Result<StudentInputs> {
    let mut labs_stmt = conn.prepare(
        "SELECT grade, submitted_at, deadline
         FROM lab_submissions
         WHERE student_id = ? AND period = ?
         ORDER BY lab_no",
    )?;
    let labs = labs_stmt
        .query_map((student_id, period.key()), |r| {
            Ok(LabSubmission {
                grade: r.get(0)?,
                submitted_at: parse_date(r.get(1)?),
                deadline: parse_date(r.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut att_stmt = conn.prepare(
        "SELECT session_date, status
         FROM attendance_marks
         WHERE student_id = ? AND period = ?
         ORDER BY session_date",
    )?;
    let attendance: Vec<AttendanceMark> = att_stmt
        .query_map((student_id, period.key()), |r| {
            let date: String = r.get(0)?;
            let status: String = r.get(1)?;
            Ok((date, status))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|(date, status)| {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?;
            let status = AttendanceStatus::parse(&status)?;
            Some(AttendanceMark { date, status })
        })
        .collect();

    let total_classes = match student_group(conn, student_id)? {
        Some(group_id) => session_count(conn, &group_id, period)?,
        None => 0,
    };

    let mut tests_stmt = conn.prepare(
        "SELECT test_no, attempt, grade, taken_at, deadline
         FROM test_submissions
         WHERE student_id = ? AND period = ?
         ORDER BY test_no, attempt",
    )?;
    let tests = tests_stmt
        .query_map((student_id, period.key()), |r| {
            Ok(TestSubmission {
                test_no: r.get(0)?,
                attempt: r.get(1)?,
                grade: r.get(2)?,
                taken_at: parse_date(r.get(3)?),
                deadline: parse_date(r.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut act_stmt = conn.prepare(
        "SELECT points, description
         FROM activity_entries
         WHERE student_id = ? AND period = ?
         ORDER BY created_at, id",
    )?;
    let activity = act_stmt
        .query_map((student_id, period.key()), |r| {
            Ok(ActivityEntry {
                points: r.get(0)?,
                description: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StudentInputs {
        labs,
        attendance,
        total_classes,
        tests,
        activity,
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: String,
    pub student_id: String,
    pub period: String,
    pub group_id: String,
    pub taken_at: i64,
    pub checksum: String,
    pub result_json: String,
}

pub fn find_snapshot(
    conn: &Connection,
    student_id: &str,
    period: Period,
    group_id: &str,
) -> anyhow::Result<Option<SnapshotRow>> {
    Ok(conn
        .query_row(
            "SELECT id, student_id, period, group_id, taken_at, checksum, result_json
             FROM score_snapshots
             WHERE student_id = ? AND period = ? AND group_id = ?",
            (student_id, period.key(), group_id),
            snapshot_from_row,
        )
        .optional()?)
}

pub fn list_group_snapshots(
    conn: &Connection,
    group_id: &str,
    period: Period,
) -> anyhow::Result<Vec<SnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, period, group_id, taken_at, checksum, result_json
         FROM score_snapshots
         WHERE group_id = ? AND period = ?
         ORDER BY student_id",
    )?;
    let rows = stmt
        .query_map((group_id, period.key()), snapshot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn snapshot_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        period: r.get(2)?,
        group_id: r.get(3)?,
        taken_at: r.get(4)?,
        checksum: r.get(5)?,
        result_json: r.get(6)?,
    })
}

/// Inserts a snapshot; a UNIQUE-constraint conflict is the success path
/// for concurrent transfers and returns the row that won the race.
pub fn insert_snapshot(conn: &Connection, row: &SnapshotRow) -> anyhow::Result<SnapshotRow> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO score_snapshots(
            id, student_id, period, group_id, taken_at, checksum, result_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.student_id,
            &row.period,
            &row.group_id,
            row.taken_at,
            &row.checksum,
            &row.result_json,
        ),
    )?;
    if inserted > 0 {
        return Ok(row.clone());
    }
    let period = Period::parse(&row.period)
        .ok_or_else(|| anyhow::anyhow!("invalid period on snapshot row: {}", row.period))?;
    find_snapshot(conn, &row.student_id, period, &row.group_id)?
        .ok_or_else(|| anyhow::anyhow!("snapshot insert raced but no existing row found"))
}
