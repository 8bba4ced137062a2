use crate::directory::{Directory, DirectoryError, SqliteDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::directory::{directory_err, entity_json};
use crate::ipc::types::{AppState, Request};
use crate::wizard::{
    class_teacher_plan, DraftKeys, DraftStore, SqliteDraftStore, StepMode, SubmitError,
    WizardController, WizardError,
};
use rusqlite::Connection;
use serde_json::{json, Value};

const CLASS_TEACHER_WIZARD: &str = "assign_class_teacher";

/// Run every pending candidate-list fetch against the directory. Synchronous
/// here, but the controller still tags each fetch with a generation, so the
/// same core suppresses stale responses under an async embedding.
fn run_fetches(
    controller: &mut WizardController,
    conn: &Connection,
) -> Result<(), DirectoryError> {
    let dir = SqliteDirectory::new(conn);
    let store = SqliteDraftStore::new(conn);
    loop {
        let plans = controller.pending_fetches();
        if plans.is_empty() {
            return Ok(());
        }
        for plan in plans {
            let entities = dir.list(plan.kind, &plan.filter)?;
            controller.apply_fetch(&store, &plan, entities);
        }
    }
}

fn snapshot(controller: &WizardController) -> Value {
    let plan = controller.plan();
    let steps: Vec<Value> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, desc)| {
            let candidates = controller
                .candidates(i)
                .map(|es| es.iter().map(entity_json).collect::<Vec<_>>());
            json!({
                "key": desc.key,
                "entityKind": desc.entity_kind.as_str(),
                "dependsOn": desc.depends_on,
                "state": &controller.state().steps[i],
                "candidates": candidates,
                "loading": controller.is_loading(i),
                "resolution": controller.resolution(i),
            })
        })
        .collect();
    json!({
        "wizardId": plan.id,
        "stepIndex": controller.step_index(),
        "scalars": &controller.state().scalars,
        "steps": steps,
    })
}

fn wizard_err(id: &str, e: WizardError) -> Value {
    match &e {
        WizardError::Validation { step, errors } => err(
            id,
            "validation_failed",
            e.to_string(),
            Some(json!({ "step": step, "fields": errors.field_errors })),
        ),
        WizardError::StaleCandidates(step) => err(
            id,
            "stale_selection",
            e.to_string(),
            Some(json!({ "step": step })),
        ),
        WizardError::UnknownCandidate { step, .. } => err(
            id,
            "stale_selection",
            e.to_string(),
            Some(json!({ "step": step })),
        ),
        WizardError::JumpNotAllowed(_) | WizardError::AtFinalStep => {
            err(id, "bad_transition", e.to_string(), None)
        }
        _ => err(id, "bad_params", e.to_string(), None),
    }
}

fn session<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<(&'a Connection, &'a mut WizardController), Value> {
    let AppState { db, wizard, .. } = state;
    let Some(conn) = db.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let Some(controller) = wizard.as_mut() else {
        return Err(err(&req.id, "no_wizard", "open a wizard first", None));
    };
    Ok((conn, controller))
}

fn param_usize(req: &Request, field: &str) -> Result<usize, Value> {
    req.params
        .get(field)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {field}"), None))
}

fn param_str<'a>(req: &'a Request, field: &str) -> Result<&'a str, Value> {
    req.params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {field}"), None))
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let wizard_id = match param_str(req, "wizardId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if wizard_id != CLASS_TEACHER_WIZARD {
        return err(&req.id, "bad_params", format!("unknown wizard: {wizard_id}"), None);
    }

    let store = SqliteDraftStore::new(conn);
    let mut controller = WizardController::open(
        class_teacher_plan(),
        DraftKeys::for_wizard(wizard_id),
        &store,
    );
    if let Err(e) = run_fetches(&mut controller, conn) {
        return directory_err(&req.id, "list_failed", e);
    }
    let body = snapshot(&controller);
    state.wizard = Some(controller);
    ok(&req.id, body)
}

fn handle_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    match session(state, req) {
        Ok((_, controller)) => ok(&req.id, snapshot(controller)),
        Err(resp) => resp,
    }
}

fn handle_candidates(state: &mut AppState, req: &Request) -> serde_json::Value {
    let step = match param_usize(req, "step") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match session(state, req) {
        Ok((_, controller)) => {
            if step >= controller.plan().steps.len() {
                return err(&req.id, "bad_params", format!("no such step: {step}"), None);
            }
            let candidates = controller
                .candidates(step)
                .map(|es| es.iter().map(entity_json).collect::<Vec<_>>());
            ok(
                &req.id,
                json!({ "candidates": candidates, "loading": controller.is_loading(step) }),
            )
        }
        Err(resp) => resp,
    }
}

/// Apply one controller mutation, then refresh any candidate lists the
/// mutation invalidated, and answer with the full snapshot.
fn mutate(
    state: &mut AppState,
    req: &Request,
    apply: impl FnOnce(&mut WizardController, &dyn DraftStore) -> Result<(), WizardError>,
) -> serde_json::Value {
    let (conn, controller) = match session(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let store = SqliteDraftStore::new(conn);
    if let Err(e) = apply(controller, &store) {
        return wizard_err(&req.id, e);
    }
    if let Err(e) = run_fetches(controller, conn) {
        return directory_err(&req.id, "list_failed", e);
    }
    ok(&req.id, snapshot(controller))
}

fn handle_set_mode(state: &mut AppState, req: &Request) -> serde_json::Value {
    let step = match param_usize(req, "step") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mode = match param_str(req, "mode") {
        Ok("existing") => StepMode::Existing,
        Ok("create") => StepMode::Create,
        Ok(other) => return err(&req.id, "bad_params", format!("unknown mode: {other}"), None),
        Err(resp) => return resp,
    };
    mutate(state, req, |c, s| c.set_mode(s, step, mode))
}

fn handle_set_field(state: &mut AppState, req: &Request) -> serde_json::Value {
    let step = match param_usize(req, "step") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let field = match param_str(req, "field") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let value = req.params.get("value").cloned().unwrap_or(Value::Null);
    mutate(state, req, |c, s| c.set_field(s, step, &field, value))
}

fn handle_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let step = match param_usize(req, "step") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let id = match param_str(req, "id") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    mutate(state, req, |c, s| c.select_existing(s, step, &id))
}

fn handle_set_scalar(state: &mut AppState, req: &Request) -> serde_json::Value {
    let field = match param_str(req, "field") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let value = req.params.get("value").cloned().unwrap_or(Value::Null);
    mutate(state, req, |c, s| c.set_scalar(s, &field, value))
}

fn handle_advance(state: &mut AppState, req: &Request) -> serde_json::Value {
    mutate(state, req, |c, s| c.advance(s).map(|_| ()))
}

fn handle_retreat(state: &mut AppState, req: &Request) -> serde_json::Value {
    mutate(state, req, |c, s| {
        c.retreat(s);
        Ok(())
    })
}

fn handle_jump(state: &mut AppState, req: &Request) -> serde_json::Value {
    let step = match param_usize(req, "step") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    mutate(state, req, |c, s| c.jump_to(s, step).map(|_| ()))
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resp = match session(state, req) {
        Ok((conn, controller)) => {
            controller.cancel(&SqliteDraftStore::new(conn));
            ok(&req.id, json!({}))
        }
        Err(resp) => return resp,
    };
    state.wizard = None;
    resp
}

fn resolved_so_far(controller: &WizardController) -> Vec<Value> {
    controller
        .plan()
        .steps
        .iter()
        .enumerate()
        .filter_map(|(i, desc)| {
            controller.resolution(i).map(|r| {
                json!({ "step": i, "key": desc.key, "id": r.id, "source": r.source })
            })
        })
        .collect()
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (conn, controller) = match session(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let dir = SqliteDirectory::new(conn);
    let store = SqliteDraftStore::new(conn);

    match controller.submit(&dir, &store) {
        Ok(success) => {
            let body = json!({
                "entity": entity_json(&success.entity),
                "composite": success.composite_payload,
                "report": success.report,
            });
            // The controller reset itself; reload the mount-time candidate
            // lists so the session is immediately reusable.
            let _ = run_fetches(controller, conn);
            ok(&req.id, body)
        }
        Err(SubmitError::NotAtFinalStep) => err(
            &req.id,
            "bad_transition",
            "submit is only allowed from the final step",
            None,
        ),
        Err(SubmitError::Validation { step, errors }) => err(
            &req.id,
            "validation_failed",
            match step {
                Some(step) => format!("step {step} is incomplete"),
                None => "wizard fields are incomplete".to_string(),
            },
            Some(json!({ "step": step, "fields": errors.field_errors })),
        ),
        Err(SubmitError::Remote {
            step,
            step_key,
            entity_kind,
            error,
        }) => err(
            &req.id,
            "create_failed",
            format!("creating the {step_key} failed: {}", error.message),
            Some(json!({
                "step": step,
                "stepKey": step_key,
                "entityKind": entity_kind.as_str(),
                "fields": error.field_errors,
                "resolved": resolved_so_far(controller),
            })),
        ),
        Err(SubmitError::Composite { error }) => err(
            &req.id,
            "create_failed",
            format!("creating the assignment failed: {}", error.message),
            Some(json!({
                "step": Value::Null,
                "stepKey": "class_teacher",
                "entityKind": "class_teacher",
                "fields": error.field_errors,
                "resolved": resolved_so_far(controller),
            })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "wizard.open" => Some(handle_open(state, req)),
        "wizard.state" => Some(handle_state(state, req)),
        "wizard.candidates" => Some(handle_candidates(state, req)),
        "wizard.set_mode" => Some(handle_set_mode(state, req)),
        "wizard.set_field" => Some(handle_set_field(state, req)),
        "wizard.select" => Some(handle_select(state, req)),
        "wizard.set_scalar" => Some(handle_set_scalar(state, req)),
        "wizard.advance" => Some(handle_advance(state, req)),
        "wizard.retreat" => Some(handle_retreat(state, req)),
        "wizard.jump" => Some(handle_jump(state, req)),
        "wizard.submit" => Some(handle_submit(state, req)),
        "wizard.cancel" => Some(handle_cancel(state, req)),
        _ => None,
    }
}
