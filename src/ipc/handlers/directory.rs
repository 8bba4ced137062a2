use crate::directory::{Directory, DirectoryError, Entity, EntityKind, SqliteDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

pub fn entity_json(e: &Entity) -> Value {
    json!({ "id": e.id, "fields": e.fields })
}

/// Envelope for a directory failure: field-level messages in the details,
/// the general message on top.
pub fn directory_err(id: &str, code: &str, e: DirectoryError) -> Value {
    let details = json!({ "fields": e.field_errors });
    err(id, code, e.message, Some(details))
}

fn parse_kind(req: &Request) -> Result<EntityKind, serde_json::Value> {
    let raw = req
        .params
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "bad_params", "missing kind", None))?;
    EntityKind::parse(raw)
        .ok_or_else(|| err(&req.id, "bad_params", format!("unknown entity kind: {raw}"), None))
}

fn parse_object(req: &Request, field: &str) -> Result<Map<String, Value>, serde_json::Value> {
    match req.params.get(field) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{field} must be an object"),
            None,
        )),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match parse_kind(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let filter = match parse_object(req, "filter") {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match SqliteDirectory::new(conn).list(kind, &filter) {
        Ok(results) => ok(
            &req.id,
            json!({ "results": results.iter().map(entity_json).collect::<Vec<_>>() }),
        ),
        Err(e) => directory_err(&req.id, "list_failed", e),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let kind = match parse_kind(req) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let payload = match parse_object(req, "payload") {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match SqliteDirectory::new(conn).create(kind, &payload) {
        Ok(entity) => ok(&req.id, json!({ "entity": entity_json(&entity) })),
        Err(e) => directory_err(&req.id, "create_failed", e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "directory.list" => Some(handle_list(state, req)),
        "directory.create" => Some(handle_create(state, req)),
        _ => None,
    }
}
