use crate::directory::EntityKind;
use crate::wizard::state::StepState;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Date,
    Password,
    /// An identifier referencing another entity, either operator-picked
    /// (e.g. a class's program) or injected from an earlier step at submit.
    Reference,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Validation-only fields (password confirmation) are stripped from the
    /// payload before it reaches the directory.
    pub local_only: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            local_only: false,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            local_only: false,
        }
    }

    pub fn local(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            local_only: true,
        }
    }
}

/// Two payload fields that must hold the same value in create mode.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmRule {
    pub field: &'static str,
    pub must_match: &'static str,
}

/// Immutable per-step metadata. Dependency references must point to strictly
/// earlier steps; `WizardPlan::new` rejects anything else.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    pub key: &'static str,
    pub entity_kind: EntityKind,
    pub depends_on: Option<usize>,
    /// Filter key used to narrow this step's candidate list by the
    /// dependency's resolved identifier.
    pub dependency_filter_field: Option<&'static str>,
    /// Create-payload field that receives the dependency's resolved
    /// identifier during submission.
    pub inject_field: Option<&'static str>,
    pub base_filter: Vec<(&'static str, Value)>,
    pub create_fields: Vec<FieldSpec>,
    pub confirm_rules: Vec<ConfirmRule>,
    /// Field name this step's resolution occupies in the composite payload.
    pub link_field: &'static str,
}

#[derive(Debug, Clone)]
pub struct WizardPlan {
    pub id: &'static str,
    pub steps: Vec<StepDescriptor>,
    pub scalar_fields: Vec<FieldSpec>,
    pub composite_kind: EntityKind,
}

impl WizardPlan {
    pub fn new(
        id: &'static str,
        steps: Vec<StepDescriptor>,
        scalar_fields: Vec<FieldSpec>,
        composite_kind: EntityKind,
    ) -> anyhow::Result<Self> {
        for (i, step) in steps.iter().enumerate() {
            if let Some(dep) = step.depends_on {
                if dep >= i {
                    anyhow::bail!(
                        "step '{}' depends on step {} which is not strictly earlier",
                        step.key,
                        dep
                    );
                }
            }
            if step.inject_field.is_some() && step.depends_on.is_none() {
                anyhow::bail!("step '{}' injects a dependency it does not declare", step.key);
            }
        }
        Ok(Self {
            id,
            steps,
            scalar_fields,
            composite_kind,
        })
    }

    /// Steps that declare `step` as their dependency.
    pub fn dependents_of(&self, step: usize) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.depends_on == Some(step))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Field-level validation failures for one step (or the scalar fields).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field_errors: BTreeMap<String, String>,
}

impl ValidationError {
    fn new() -> Self {
        Self {
            field_errors: BTreeMap::new(),
        }
    }

    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.field_errors
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    fn into_result(self) -> Result<(), ValidationError> {
        if self.field_errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn check_field(errors: &mut ValidationError, spec: &FieldSpec, value: Option<&Value>) {
    let missing = match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if missing {
        if spec.required {
            errors.push(spec.name, "this field is required");
        }
        return;
    }
    let value = value.unwrap_or(&Value::Null);
    match spec.kind {
        FieldKind::Text | FieldKind::Password => {
            if !value.is_string() {
                errors.push(spec.name, "expected text");
            }
        }
        FieldKind::Integer => {
            if value.as_i64().is_none() {
                errors.push(spec.name, "expected a whole number");
            }
        }
        FieldKind::Date => match value.as_str() {
            Some(s) if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => {}
            _ => errors.push(spec.name, "expected an ISO date (YYYY-MM-DD)"),
        },
        FieldKind::Reference => {
            let ok = match value {
                Value::String(s) => !s.trim().is_empty(),
                Value::Number(n) => n.is_i64(),
                _ => false,
            };
            if !ok {
                errors.push(spec.name, "expected an identifier");
            }
        }
    }
}

/// Validate one step against its active mode. Only the mode's own shape is
/// inspected; injected reference fields are filled at submit and skipped here.
pub fn validate_step(desc: &StepDescriptor, state: &StepState) -> Result<(), ValidationError> {
    let mut errors = ValidationError::new();
    match state {
        StepState::Unset => {
            errors.push("mode", "choose an existing entry or create a new one");
        }
        StepState::Existing { selected } => {
            if selected.trim().is_empty() {
                errors.push("selected", "a selection is required");
            }
        }
        StepState::Create { payload } => {
            for spec in &desc.create_fields {
                if desc.inject_field == Some(spec.name) {
                    continue;
                }
                check_field(&mut errors, spec, payload.get(spec.name));
            }
            for rule in &desc.confirm_rules {
                let a = payload.get(rule.field).and_then(|v| v.as_str());
                let b = payload.get(rule.must_match).and_then(|v| v.as_str());
                if a.is_some() && a != b {
                    errors.push(rule.field, format!("must match {}", rule.must_match));
                }
            }
        }
    }
    errors.into_result()
}

pub fn validate_scalars(plan: &WizardPlan, scalars: &Map<String, Value>) -> Result<(), ValidationError> {
    let mut errors = ValidationError::new();
    for spec in &plan.scalar_fields {
        check_field(&mut errors, spec, scalars.get(spec.name));
    }
    errors.into_result()
}

/// The "assign class teacher" wizard: pick-or-create a teacher, a class, a
/// section within that class, and an academic session, then link them all.
pub fn class_teacher_plan() -> WizardPlan {
    let steps = vec![
        StepDescriptor {
            key: "teacher",
            entity_kind: EntityKind::Teacher,
            depends_on: None,
            dependency_filter_field: None,
            inject_field: None,
            base_filter: Vec::new(),
            create_fields: vec![
                FieldSpec::required("name", FieldKind::Text),
                FieldSpec::required("email", FieldKind::Text),
                FieldSpec::required("username", FieldKind::Text),
                FieldSpec::required("password", FieldKind::Password),
                FieldSpec::local("confirm_password", FieldKind::Password),
            ],
            confirm_rules: vec![ConfirmRule {
                field: "confirm_password",
                must_match: "password",
            }],
            link_field: "teacher",
        },
        StepDescriptor {
            key: "class",
            entity_kind: EntityKind::Class,
            depends_on: None,
            dependency_filter_field: None,
            inject_field: None,
            base_filter: Vec::new(),
            create_fields: vec![
                FieldSpec::required("program", FieldKind::Reference),
                FieldSpec::required("name", FieldKind::Text),
                FieldSpec::required("semester", FieldKind::Integer),
                FieldSpec::required("year", FieldKind::Integer),
                FieldSpec::required("max_students", FieldKind::Integer),
            ],
            confirm_rules: Vec::new(),
            link_field: "class_obj",
        },
        StepDescriptor {
            key: "section",
            entity_kind: EntityKind::Section,
            depends_on: Some(1),
            dependency_filter_field: Some("class_obj"),
            inject_field: Some("class_obj"),
            base_filter: Vec::new(),
            create_fields: vec![
                FieldSpec::required("class_obj", FieldKind::Reference),
                FieldSpec::required("name", FieldKind::Text),
                FieldSpec::required("max_students", FieldKind::Integer),
            ],
            confirm_rules: Vec::new(),
            link_field: "section",
        },
        StepDescriptor {
            key: "academic_session",
            entity_kind: EntityKind::AcademicSession,
            depends_on: None,
            dependency_filter_field: None,
            inject_field: None,
            base_filter: vec![("is_active", Value::Bool(true))],
            create_fields: vec![
                FieldSpec::required("name", FieldKind::Text),
                FieldSpec::optional("start_date", FieldKind::Date),
                FieldSpec::optional("end_date", FieldKind::Date),
            ],
            confirm_rules: Vec::new(),
            link_field: "academic_session",
        },
    ];
    let scalars = vec![FieldSpec::required("assigned_from", FieldKind::Date)];

    // The section step's dependency on the class step is the only edge;
    // construction of this static plan cannot fail.
    WizardPlan::new("assign_class_teacher", steps, scalars, EntityKind::ClassTeacher)
        .unwrap_or_else(|_| unreachable!("static plan is acyclic"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn plan_rejects_forward_dependency() {
        let mut steps = class_teacher_plan().steps;
        steps[0].depends_on = Some(2);
        let res = WizardPlan::new("broken", steps, Vec::new(), EntityKind::ClassTeacher);
        assert!(res.is_err());
    }

    #[test]
    fn plan_rejects_self_dependency() {
        let mut steps = class_teacher_plan().steps;
        steps[2].depends_on = Some(2);
        let res = WizardPlan::new("broken", steps, Vec::new(), EntityKind::ClassTeacher);
        assert!(res.is_err());
    }

    #[test]
    fn unset_step_never_validates() {
        let plan = class_teacher_plan();
        let err = validate_step(&plan.steps[0], &StepState::Unset).expect_err("unset");
        assert!(err.field_errors.contains_key("mode"));
    }

    #[test]
    fn existing_mode_only_requires_a_selection() {
        let plan = class_teacher_plan();
        let err = validate_step(
            &plan.steps[0],
            &StepState::Existing {
                selected: String::new(),
            },
        )
        .expect_err("empty selection");
        assert!(err.field_errors.contains_key("selected"));

        validate_step(
            &plan.steps[0],
            &StepState::Existing {
                selected: "teacher#7".to_string(),
            },
        )
        .expect("selection is enough; create fields are not consulted");
    }

    #[test]
    fn create_mode_checks_required_fields_and_password_confirmation() {
        let plan = class_teacher_plan();
        let err = validate_step(
            &plan.steps[0],
            &StepState::Create {
                payload: payload(&[
                    ("name", json!("New Teacher")),
                    ("email", json!("nt@example.edu")),
                    ("username", json!("nteacher")),
                    ("password", json!("s3cret")),
                    ("confirm_password", json!("s3cret!")),
                ]),
            },
        )
        .expect_err("mismatched confirmation");
        assert!(err.field_errors.contains_key("confirm_password"));

        let err = validate_step(
            &plan.steps[0],
            &StepState::Create {
                payload: payload(&[("name", json!("New Teacher"))]),
            },
        )
        .expect_err("missing fields");
        assert!(err.field_errors.contains_key("email"));
        assert!(err.field_errors.contains_key("password"));
    }

    #[test]
    fn create_mode_skips_the_injected_reference() {
        let plan = class_teacher_plan();
        // class_obj is injected at submit from step 2's resolution.
        validate_step(
            &plan.steps[2],
            &StepState::Create {
                payload: payload(&[("name", json!("Section A")), ("max_students", json!(60))]),
            },
        )
        .expect("injected field not required before submit");
    }

    #[test]
    fn integer_and_date_kinds_are_typed() {
        let plan = class_teacher_plan();
        let err = validate_step(
            &plan.steps[1],
            &StepState::Create {
                payload: payload(&[
                    ("program", json!("prog#3")),
                    ("name", json!("BCA 2024")),
                    ("semester", json!("one")),
                    ("year", json!(1)),
                    ("max_students", json!(60)),
                ]),
            },
        )
        .expect_err("semester must be a number");
        assert!(err.field_errors.contains_key("semester"));

        let err = validate_scalars(
            &plan,
            &payload(&[("assigned_from", json!("01/01/2025"))]),
        )
        .expect_err("not an ISO date");
        assert!(err.field_errors.contains_key("assigned_from"));

        validate_scalars(&plan, &payload(&[("assigned_from", json!("2025-01-01"))]))
            .expect("valid date");
    }
}
