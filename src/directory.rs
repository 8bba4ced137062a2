use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Entity kinds the directory knows how to list and create. Field names in
/// payloads and filters follow the backend's own vocabulary (`class_obj`,
/// `academic_session`, ...), not the sidecar's wire casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Program,
    Teacher,
    Class,
    Section,
    AcademicSession,
    ClassTeacher,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "program" => Some(Self::Program),
            "teacher" => Some(Self::Teacher),
            "class" => Some(Self::Class),
            "section" => Some(Self::Section),
            "academic_session" => Some(Self::AcademicSession),
            "class_teacher" => Some(Self::ClassTeacher),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Program => "program",
            Self::Teacher => "teacher",
            Self::Class => "class",
            Self::Section => "section",
            Self::AcademicSession => "academic_session",
            Self::ClassTeacher => "class_teacher",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub fields: Value,
}

/// A create/list failure. `field_errors` carries server-side validation
/// messages keyed by payload field; `message` is the general fallback.
#[derive(Debug, Clone)]
pub struct DirectoryError {
    pub message: String,
    pub field_errors: BTreeMap<String, String>,
}

impl DirectoryError {
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_errors: BTreeMap::new(),
        }
    }

    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut field_errors = BTreeMap::new();
        field_errors.insert(field.to_string(), message.into());
        Self {
            message: "validation failed".to_string(),
            field_errors,
        }
    }
}

/// The two opaque remote capabilities the wizard consumes. No cross-call
/// atomicity is assumed; only the first page of a listing is ever returned.
pub trait Directory {
    fn list(&self, kind: EntityKind, filter: &Map<String, Value>) -> Result<Vec<Entity>, DirectoryError>;
    fn create(&self, kind: EntityKind, payload: &Map<String, Value>) -> Result<Entity, DirectoryError>;
}

const PAGE_SIZE: usize = 100;

pub struct SqliteDirectory<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDirectory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn require_str(payload: &Map<String, Value>, field: &str) -> Result<String, DirectoryError> {
    match payload.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(DirectoryError::field(field, "this field is required")),
    }
}

fn require_i64(payload: &Map<String, Value>, field: &str) -> Result<i64, DirectoryError> {
    payload
        .get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DirectoryError::field(field, "a whole number is required"))
}

fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl SqliteDirectory<'_> {
    fn row_exists(&self, sql: &str, id: &str) -> Result<bool, DirectoryError> {
        self.conn
            .query_row(sql, [id], |r| r.get::<_, i64>(0))
            .optional()
            .map(|v| v.is_some())
            .map_err(|e| DirectoryError::general(e.to_string()))
    }
}

impl Directory for SqliteDirectory<'_> {
    fn list(&self, kind: EntityKind, filter: &Map<String, Value>) -> Result<Vec<Entity>, DirectoryError> {
        // Each arm maps the backend filter vocabulary onto columns; unknown
        // filter keys (and page_size) are ignored rather than rejected.
        let (mut sql, fields): (String, &[&str]) = match kind {
            EntityKind::Program => (
                "SELECT id, name FROM programs".to_string(),
                &["name"],
            ),
            EntityKind::Teacher => (
                "SELECT id, name, email, username FROM teachers".to_string(),
                &["name", "email", "username"],
            ),
            EntityKind::Class => (
                "SELECT id, program_id, name, semester, year, max_students FROM classes".to_string(),
                &["program", "name", "semester", "year", "max_students"],
            ),
            EntityKind::Section => (
                "SELECT id, class_id, name, max_students FROM sections".to_string(),
                &["class_obj", "name", "max_students"],
            ),
            EntityKind::AcademicSession => (
                "SELECT id, name, start_date, end_date, is_active FROM academic_sessions".to_string(),
                &["name", "is_active"],
            ),
            EntityKind::ClassTeacher => (
                "SELECT id, class_id, section_id, teacher_id, academic_session_id, assigned_from
                 FROM class_teachers"
                    .to_string(),
                &["class_obj", "section", "teacher", "academic_session"],
            ),
        };

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (key, value) in filter {
            if key == "page_size" {
                continue;
            }
            let column = match (kind, key.as_str()) {
                (EntityKind::Section, "class_obj") => "class_id",
                (EntityKind::Class, "program") => "program_id",
                (EntityKind::ClassTeacher, "class_obj") => "class_id",
                (EntityKind::ClassTeacher, "section") => "section_id",
                (EntityKind::ClassTeacher, "teacher") => "teacher_id",
                (EntityKind::ClassTeacher, "academic_session") => "academic_session_id",
                _ => key.as_str(),
            };
            let known = fields.contains(&key.as_str());
            if !known {
                continue;
            }
            clauses.push(format!("{} = ?", column));
            params.push(match value {
                Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
                Value::Number(n) if n.is_i64() => {
                    // Reference filters compare against TEXT id columns.
                    if matches!(key.as_str(), "class_obj" | "program" | "section" | "teacher" | "academic_session") {
                        SqlValue::Text(n.to_string())
                    } else {
                        SqlValue::Integer(n.as_i64().unwrap_or_default())
                    }
                }
                Value::String(s) => SqlValue::Text(s.clone()),
                other => SqlValue::Text(other.to_string()),
            });
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid LIMIT ");
        sql.push_str(&PAGE_SIZE.to_string());

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| DirectoryError::general(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                let id: String = row.get(0)?;
                let fields = match kind {
                    EntityKind::Program => json!({ "name": row.get::<_, String>(1)? }),
                    EntityKind::Teacher => json!({
                        "name": row.get::<_, String>(1)?,
                        "email": row.get::<_, String>(2)?,
                        "username": row.get::<_, String>(3)?,
                    }),
                    EntityKind::Class => json!({
                        "program": row.get::<_, String>(1)?,
                        "name": row.get::<_, String>(2)?,
                        "semester": row.get::<_, i64>(3)?,
                        "year": row.get::<_, i64>(4)?,
                        "max_students": row.get::<_, i64>(5)?,
                    }),
                    EntityKind::Section => json!({
                        "class_obj": row.get::<_, String>(1)?,
                        "name": row.get::<_, String>(2)?,
                        "max_students": row.get::<_, i64>(3)?,
                    }),
                    EntityKind::AcademicSession => json!({
                        "name": row.get::<_, String>(1)?,
                        "start_date": row.get::<_, Option<String>>(2)?,
                        "end_date": row.get::<_, Option<String>>(3)?,
                        "is_active": row.get::<_, i64>(4)? != 0,
                    }),
                    EntityKind::ClassTeacher => json!({
                        "class_obj": row.get::<_, String>(1)?,
                        "section": row.get::<_, String>(2)?,
                        "teacher": row.get::<_, String>(3)?,
                        "academic_session": row.get::<_, String>(4)?,
                        "assigned_from": row.get::<_, String>(5)?,
                    }),
                };
                Ok(Entity { id, fields })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| DirectoryError::general(e.to_string()))?;

        Ok(rows)
    }

    fn create(&self, kind: EntityKind, payload: &Map<String, Value>) -> Result<Entity, DirectoryError> {
        let id = Uuid::new_v4().to_string();
        match kind {
            EntityKind::Program => {
                let name = require_str(payload, "name")?;
                self.conn
                    .execute("INSERT INTO programs(id, name) VALUES(?, ?)", (&id, &name))
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({ "name": name }),
                })
            }
            EntityKind::Teacher => {
                let name = require_str(payload, "name")?;
                let email = require_str(payload, "email")?;
                let username = require_str(payload, "username")?;
                let password = require_str(payload, "password")?;

                let taken = self.conn
                    .query_row("SELECT 1 FROM teachers WHERE username = ?", [&username], |r| {
                        r.get::<_, i64>(0)
                    })
                    .optional()
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                if taken.is_some() {
                    return Err(DirectoryError::field("username", "username already taken"));
                }

                self.conn
                    .execute(
                        "INSERT INTO teachers(id, name, email, username, password_digest)
                         VALUES(?, ?, ?, ?, ?)",
                        (&id, &name, &email, &username, password_digest(&password)),
                    )
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({ "name": name, "email": email, "username": username }),
                })
            }
            EntityKind::Class => {
                let program = require_str(payload, "program")?;
                let name = require_str(payload, "name")?;
                let semester = require_i64(payload, "semester")?;
                let year = require_i64(payload, "year")?;
                let max_students = require_i64(payload, "max_students")?;

                if !self.row_exists("SELECT 1 FROM programs WHERE id = ?", &program)? {
                    return Err(DirectoryError::field("program", "unknown program"));
                }
                let dup = self.conn
                    .query_row(
                        "SELECT 1 FROM classes WHERE program_id = ? AND name = ?",
                        (&program, &name),
                        |r| r.get::<_, i64>(0),
                    )
                    .optional()
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                if dup.is_some() {
                    return Err(DirectoryError::field(
                        "name",
                        "a class with this name already exists in the program",
                    ));
                }

                self.conn
                    .execute(
                        "INSERT INTO classes(id, program_id, name, semester, year, max_students)
                         VALUES(?, ?, ?, ?, ?, ?)",
                        (&id, &program, &name, semester, year, max_students),
                    )
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({
                        "program": program, "name": name, "semester": semester,
                        "year": year, "max_students": max_students,
                    }),
                })
            }
            EntityKind::Section => {
                let class_obj = require_str(payload, "class_obj")?;
                let name = require_str(payload, "name")?;
                let max_students = require_i64(payload, "max_students")?;

                let capacity: Option<i64> = self.conn
                    .query_row(
                        "SELECT max_students FROM classes WHERE id = ?",
                        [&class_obj],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                let Some(capacity) = capacity else {
                    return Err(DirectoryError::field("class_obj", "unknown class"));
                };
                if max_students > capacity {
                    return Err(DirectoryError::field(
                        "max_students",
                        format!("cannot exceed class capacity ({capacity})"),
                    ));
                }

                self.conn
                    .execute(
                        "INSERT INTO sections(id, class_id, name, max_students) VALUES(?, ?, ?, ?)",
                        (&id, &class_obj, &name, max_students),
                    )
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({ "class_obj": class_obj, "name": name, "max_students": max_students }),
                })
            }
            EntityKind::AcademicSession => {
                let name = require_str(payload, "name")?;
                let start_date = payload.get("start_date").and_then(|v| v.as_str()).map(str::to_string);
                let end_date = payload.get("end_date").and_then(|v| v.as_str()).map(str::to_string);
                let is_active = payload
                    .get("is_active")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                for (field, value) in [("start_date", &start_date), ("end_date", &end_date)] {
                    if let Some(d) = value {
                        if chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() {
                            return Err(DirectoryError::field(field, "expected an ISO date (YYYY-MM-DD)"));
                        }
                    }
                }

                self.conn
                    .execute(
                        "INSERT INTO academic_sessions(id, name, start_date, end_date, is_active)
                         VALUES(?, ?, ?, ?, ?)",
                        (&id, &name, &start_date, &end_date, i64::from(is_active)),
                    )
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({
                        "name": name, "start_date": start_date,
                        "end_date": end_date, "is_active": is_active,
                    }),
                })
            }
            EntityKind::ClassTeacher => {
                let class_obj = require_str(payload, "class_obj")?;
                let section = require_str(payload, "section")?;
                let teacher = require_str(payload, "teacher")?;
                let academic_session = require_str(payload, "academic_session")?;
                let assigned_from = require_str(payload, "assigned_from")?;
                if chrono::NaiveDate::parse_from_str(&assigned_from, "%Y-%m-%d").is_err() {
                    return Err(DirectoryError::field(
                        "assigned_from",
                        "expected an ISO date (YYYY-MM-DD)",
                    ));
                }

                for (field, table, value) in [
                    ("class_obj", "classes", &class_obj),
                    ("section", "sections", &section),
                    ("teacher", "teachers", &teacher),
                    ("academic_session", "academic_sessions", &academic_session),
                ] {
                    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
                    if !self.row_exists(&sql, value)? {
                        return Err(DirectoryError::field(field, format!("unknown {}", field)));
                    }
                }

                let created_at = chrono::Utc::now().to_rfc3339();
                self.conn
                    .execute(
                        "INSERT INTO class_teachers(
                            id, class_id, section_id, teacher_id, academic_session_id,
                            assigned_from, created_at)
                         VALUES(?, ?, ?, ?, ?, ?, ?)",
                        (
                            &id, &class_obj, &section, &teacher, &academic_session,
                            &assigned_from, &created_at,
                        ),
                    )
                    .map_err(|e| DirectoryError::general(e.to_string()))?;
                Ok(Entity {
                    id,
                    fields: json!({
                        "class_obj": class_obj, "section": section, "teacher": teacher,
                        "academic_session": academic_session, "assigned_from": assigned_from,
                    }),
                })
            }
        }
    }
}
