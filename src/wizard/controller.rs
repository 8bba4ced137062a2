use crate::directory::{Directory, DirectoryError, Entity, EntityKind};
use crate::wizard::cascade::{CascadeResolver, FetchPlan};
use crate::wizard::draft::{self, DraftKeys, DraftStore};
use crate::wizard::state::{Resolution, ResolutionSource, StepMode, StepState, WizardState};
use crate::wizard::steps::{validate_scalars, validate_step, ValidationError, WizardPlan};
use serde_json::{Map, Value};
use std::fmt;

/// A transition or mutation the wizard refused. These never leave the
/// process; the IPC layer maps them onto error envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardError {
    UnknownStep(usize),
    NotVisited(usize),
    UnknownField(String),
    NotCreateMode(usize),
    NotExistingMode(usize),
    /// The step's candidate list is missing or tagged with a different
    /// dependency value than the current one.
    StaleCandidates(usize),
    UnknownCandidate { step: usize, id: String },
    JumpNotAllowed(usize),
    AtFinalStep,
    Validation { step: usize, errors: ValidationError },
}

impl fmt::Display for WizardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WizardError::UnknownStep(n) => write!(f, "no such step: {n}"),
            WizardError::NotVisited(n) => write!(f, "step {n} has not been visited yet"),
            WizardError::UnknownField(name) => write!(f, "unknown field: {name}"),
            WizardError::NotCreateMode(n) => write!(f, "step {n} is not in create mode"),
            WizardError::NotExistingMode(n) => write!(f, "step {n} is not in existing mode"),
            WizardError::StaleCandidates(n) => {
                write!(f, "step {n}'s candidate list is stale; wait for it to reload")
            }
            WizardError::UnknownCandidate { step, id } => {
                write!(f, "'{id}' is not in step {step}'s candidate list")
            }
            WizardError::JumpNotAllowed(n) => write!(f, "cannot skip ahead to step {n}"),
            WizardError::AtFinalStep => write!(f, "already at the final step"),
            WizardError::Validation { step, .. } => write!(f, "step {step} is incomplete"),
        }
    }
}

/// Why a submission stopped. Remote failures identify the step so the
/// operator can decide whether to retry; resolutions already obtained stay
/// in the controller either way.
#[derive(Debug)]
pub enum SubmitError {
    NotAtFinalStep,
    /// `step` is `None` for wizard-level scalar fields.
    Validation {
        step: Option<usize>,
        errors: ValidationError,
    },
    Remote {
        step: usize,
        step_key: &'static str,
        entity_kind: EntityKind,
        error: DirectoryError,
    },
    Composite { error: DirectoryError },
}

/// Per-step outcome of a successful submission. `carried_over` marks steps
/// whose resolution predates this attempt, i.e. resources that already
/// existed when the operator retried.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step: usize,
    pub key: &'static str,
    pub id: String,
    pub source: ResolutionSource,
    pub carried_over: bool,
}

#[derive(Debug)]
pub struct SubmitSuccess {
    pub entity: Entity,
    pub composite_payload: Map<String, Value>,
    pub report: Vec<StepReport>,
}

/// Owns the wizard state and drives every transition. The draft store is a
/// passive mirror: written on each mutation, read once at open, cleared only
/// on success or cancel.
pub struct WizardController {
    plan: WizardPlan,
    keys: DraftKeys,
    state: WizardState,
    step_index: usize,
    furthest: usize,
    cascade: CascadeResolver,
    resolutions: Vec<Option<Resolution>>,
}

impl WizardController {
    /// Restore from the draft store, falling back to the default empty state
    /// when no snapshot exists or the snapshot does not fit the plan.
    pub fn open(plan: WizardPlan, keys: DraftKeys, store: &dyn DraftStore) -> Self {
        let step_count = plan.steps.len();
        let restored = draft::load(store, &keys)
            .filter(|(state, _)| state.steps.len() == step_count);
        let (state, step_index) = match restored {
            Some((state, step)) => (state, step.min(step_count.saturating_sub(1))),
            None => (WizardState::empty(step_count), 0),
        };
        Self {
            furthest: step_index,
            cascade: CascadeResolver::new(step_count),
            resolutions: vec![None; step_count],
            plan,
            keys,
            state,
            step_index,
        }
    }

    pub fn plan(&self) -> &WizardPlan {
        &self.plan
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn candidates(&self, step: usize) -> Option<&[Entity]> {
        self.cascade.candidates(step)
    }

    pub fn is_loading(&self, step: usize) -> bool {
        self.cascade.is_loading(step)
    }

    fn check_step(&self, step: usize) -> Result<(), WizardError> {
        if step >= self.plan.steps.len() {
            return Err(WizardError::UnknownStep(step));
        }
        if step > self.furthest {
            return Err(WizardError::NotVisited(step));
        }
        Ok(())
    }

    /// The dependency's resolved value, when known before submission: the
    /// dependency step's existing selection. A create-mode dependency has no
    /// identifier until submit, so dependents cannot list candidates.
    fn dependency_value(&self, step: usize) -> Option<String> {
        let dep = self.plan.steps[step].depends_on?;
        self.state.steps[dep].selected().map(str::to_string)
    }

    fn dependency_satisfied(&self, step: usize) -> bool {
        match self.plan.steps[step].depends_on {
            None => true,
            Some(dep) => self.state.steps[dep].selected().is_some(),
        }
    }

    /// Fetch plans for every step whose candidate list is missing or stale
    /// and whose dependency is satisfied. Used at open (mount) and after any
    /// mutation; the embedding layer runs each plan against the directory
    /// and hands results back via [`apply_fetch`].
    pub fn pending_fetches(&mut self) -> Vec<FetchPlan> {
        let mut plans = Vec::new();
        for step in 0..self.plan.steps.len() {
            if !self.dependency_satisfied(step) || self.cascade.is_loading(step) {
                continue;
            }
            let dep_value = self.dependency_value(step);
            if self.cascade.is_fresh(step, dep_value.as_deref()) {
                continue;
            }
            let desc = &self.plan.steps[step];
            let mut filter = Map::new();
            for (key, value) in &desc.base_filter {
                filter.insert((*key).to_string(), value.clone());
            }
            if let (Some(field), Some(value)) = (desc.dependency_filter_field, dep_value) {
                filter.insert(field.to_string(), Value::String(value));
            }
            plans.push(self.cascade.plan_fetch(step, desc.entity_kind, filter));
        }
        plans
    }

    /// Accept a candidate-list response. Stale responses (superseded
    /// generation) are dropped and `false` is returned. A restored selection
    /// that no longer appears in the fresh list is cleared.
    pub fn apply_fetch(
        &mut self,
        store: &dyn DraftStore,
        plan: &FetchPlan,
        entities: Vec<Entity>,
    ) -> bool {
        let dep_value = self.dependency_value(plan.step);
        if !self.cascade.apply(plan.step, plan.generation, dep_value, entities) {
            return false;
        }
        let restored = self.state.steps[plan.step].selected().map(str::to_string);
        if let Some(selected) = restored {
            if !self.cascade.contains(plan.step, &selected) {
                self.state.steps[plan.step] = StepState::Unset;
                self.invalidate_dependents(plan.step);
                self.save(store);
            }
        }
        true
    }

    fn invalidate_dependents(&mut self, step: usize) {
        for dependent in self.plan.dependents_of(step) {
            self.cascade.invalidate(dependent);
            if matches!(self.state.steps[dependent], StepState::Existing { .. }) {
                self.state.steps[dependent] = StepState::Unset;
                self.invalidate_dependents(dependent);
            }
        }
    }

    fn save(&self, store: &dyn DraftStore) {
        draft::save(store, &self.keys, &self.state, self.step_index);
    }

    pub fn set_mode(
        &mut self,
        store: &dyn DraftStore,
        step: usize,
        mode: StepMode,
    ) -> Result<(), WizardError> {
        self.check_step(step)?;
        let had_value = self.state.steps[step].selected().is_some();
        self.state.steps[step] = match mode {
            StepMode::Existing => StepState::Existing {
                selected: String::new(),
            },
            StepMode::Create => StepState::Create {
                payload: Map::new(),
            },
        };
        if had_value {
            self.invalidate_dependents(step);
        }
        self.save(store);
        Ok(())
    }

    pub fn set_field(
        &mut self,
        store: &dyn DraftStore,
        step: usize,
        field: &str,
        value: Value,
    ) -> Result<(), WizardError> {
        self.check_step(step)?;
        if !self.plan.steps[step]
            .create_fields
            .iter()
            .any(|f| f.name == field)
        {
            return Err(WizardError::UnknownField(field.to_string()));
        }
        match &mut self.state.steps[step] {
            StepState::Create { payload } => {
                payload.insert(field.to_string(), value);
            }
            _ => return Err(WizardError::NotCreateMode(step)),
        }
        self.save(store);
        Ok(())
    }

    /// Select an existing candidate. Rejected while the step's candidate
    /// list is stale, so a selection can never be made against a list that
    /// was produced for a different dependency value.
    pub fn select_existing(
        &mut self,
        store: &dyn DraftStore,
        step: usize,
        id: &str,
    ) -> Result<(), WizardError> {
        self.check_step(step)?;
        if !matches!(self.state.steps[step], StepState::Existing { .. }) {
            return Err(WizardError::NotExistingMode(step));
        }
        let dep_value = self.dependency_value(step);
        if !self.cascade.is_fresh(step, dep_value.as_deref()) {
            return Err(WizardError::StaleCandidates(step));
        }
        if !self.cascade.contains(step, id) {
            return Err(WizardError::UnknownCandidate {
                step,
                id: id.to_string(),
            });
        }
        let changed = self.state.steps[step].selected() != Some(id);
        self.state.steps[step] = StepState::Existing {
            selected: id.to_string(),
        };
        if changed {
            self.invalidate_dependents(step);
        }
        self.save(store);
        Ok(())
    }

    pub fn set_scalar(
        &mut self,
        store: &dyn DraftStore,
        field: &str,
        value: Value,
    ) -> Result<(), WizardError> {
        if !self.plan.scalar_fields.iter().any(|f| f.name == field) {
            return Err(WizardError::UnknownField(field.to_string()));
        }
        self.state.scalars.insert(field.to_string(), value);
        self.save(store);
        Ok(())
    }

    /// Move forward one step, gated by the current step's validation for its
    /// active mode. On failure the index is unchanged and the field-level
    /// reasons are returned.
    pub fn advance(&mut self, store: &dyn DraftStore) -> Result<usize, WizardError> {
        if self.step_index + 1 >= self.plan.steps.len() {
            return Err(WizardError::AtFinalStep);
        }
        self.validate_current()?;
        self.step_index += 1;
        self.furthest = self.furthest.max(self.step_index);
        self.save(store);
        Ok(self.step_index)
    }

    /// Move back one step unconditionally; never touches field values.
    pub fn retreat(&mut self, store: &dyn DraftStore) -> usize {
        if self.step_index > 0 {
            self.step_index -= 1;
            self.save(store);
        }
        self.step_index
    }

    /// Jump to an already-visited step freely, or to the immediate next step
    /// through the same gate as `advance`. Anything further is refused.
    pub fn jump_to(&mut self, store: &dyn DraftStore, target: usize) -> Result<usize, WizardError> {
        if target >= self.plan.steps.len() {
            return Err(WizardError::UnknownStep(target));
        }
        if target <= self.furthest {
            self.step_index = target;
            self.save(store);
            return Ok(self.step_index);
        }
        if target == self.step_index + 1 {
            return self.advance(store);
        }
        Err(WizardError::JumpNotAllowed(target))
    }

    fn validate_current(&self) -> Result<(), WizardError> {
        let step = self.step_index;
        validate_step(&self.plan.steps[step], &self.state.steps[step])
            .map_err(|errors| WizardError::Validation { step, errors })
    }

    /// Discard the draft and all in-memory progress, including retained
    /// resolutions from failed submissions.
    pub fn cancel(&mut self, store: &dyn DraftStore) {
        draft::clear(store, &self.keys);
        let step_count = self.plan.steps.len();
        self.state = WizardState::empty(step_count);
        self.step_index = 0;
        self.furthest = 0;
        self.cascade = CascadeResolver::new(step_count);
        self.resolutions = vec![None; step_count];
    }

    /// Per-step resolution retained from submission attempts. Present for
    /// the contiguous prefix of steps that resolved before a failure.
    pub fn resolution(&self, step: usize) -> Option<&Resolution> {
        self.resolutions.get(step).and_then(Option::as_ref)
    }

    /// Resolve every step in ascending order, then issue the composite
    /// creation. Strictly sequential: step k+1 is not touched until step k's
    /// resolution is known, because later payloads reference earlier ids.
    ///
    /// Non-atomic by contract: a failure at step k leaves steps < k
    /// committed (their resolutions retained here) and steps > k untouched.
    /// A retry reuses retained resolutions instead of re-creating them.
    pub fn submit(
        &mut self,
        directory: &dyn Directory,
        store: &dyn DraftStore,
    ) -> Result<SubmitSuccess, SubmitError> {
        if self.step_index + 1 != self.plan.steps.len() {
            return Err(SubmitError::NotAtFinalStep);
        }

        // Re-validate everything locally before the first remote call; an
        // earlier step may have been edited after it was advanced past.
        for (step, desc) in self.plan.steps.iter().enumerate() {
            validate_step(desc, &self.state.steps[step]).map_err(|errors| {
                SubmitError::Validation {
                    step: Some(step),
                    errors,
                }
            })?;
        }
        validate_scalars(&self.plan, &self.state.scalars)
            .map_err(|errors| SubmitError::Validation { step: None, errors })?;

        let carried: Vec<bool> = self.resolutions.iter().map(Option::is_some).collect();

        for step in 0..self.plan.steps.len() {
            if self.resolutions[step].is_some() {
                continue;
            }
            let desc = &self.plan.steps[step];
            let resolution = match &self.state.steps[step] {
                StepState::Existing { selected } => Resolution {
                    id: selected.clone(),
                    source: ResolutionSource::Reused,
                },
                StepState::Create { payload } => {
                    let mut outgoing = Map::new();
                    for spec in &desc.create_fields {
                        if spec.local_only {
                            continue;
                        }
                        if desc.inject_field == Some(spec.name) {
                            let dep = desc
                                .depends_on
                                .and_then(|d| self.resolutions[d].as_ref());
                            if let Some(dep) = dep {
                                outgoing.insert(
                                    spec.name.to_string(),
                                    Value::String(dep.id.clone()),
                                );
                            }
                            continue;
                        }
                        if let Some(value) = payload.get(spec.name) {
                            outgoing.insert(spec.name.to_string(), value.clone());
                        }
                    }
                    let created = directory
                        .create(desc.entity_kind, &outgoing)
                        .map_err(|error| SubmitError::Remote {
                            step,
                            step_key: desc.key,
                            entity_kind: desc.entity_kind,
                            error,
                        })?;
                    Resolution {
                        id: created.id,
                        source: ResolutionSource::Created,
                    }
                }
                StepState::Unset => {
                    return Err(SubmitError::Validation {
                        step: Some(step),
                        errors: ValidationError {
                            field_errors: [(
                                "mode".to_string(),
                                "choose an existing entry or create a new one".to_string(),
                            )]
                            .into_iter()
                            .collect(),
                        },
                    })
                }
            };
            self.resolutions[step] = Some(resolution);
        }

        let mut composite = Map::new();
        for (step, desc) in self.plan.steps.iter().enumerate() {
            if let Some(resolution) = &self.resolutions[step] {
                composite.insert(
                    desc.link_field.to_string(),
                    Value::String(resolution.id.clone()),
                );
            }
        }
        for spec in &self.plan.scalar_fields {
            if let Some(value) = self.state.scalars.get(spec.name) {
                composite.insert(spec.name.to_string(), value.clone());
            }
        }

        let entity = directory
            .create(self.plan.composite_kind, &composite)
            .map_err(|error| SubmitError::Composite { error })?;

        let report = self
            .plan
            .steps
            .iter()
            .enumerate()
            .map(|(step, desc)| {
                let resolution = self.resolutions[step]
                    .as_ref()
                    .cloned()
                    .unwrap_or_else(|| Resolution {
                        id: String::new(),
                        source: ResolutionSource::Reused,
                    });
                StepReport {
                    step,
                    key: desc.key,
                    id: resolution.id,
                    source: resolution.source,
                    carried_over: carried[step],
                }
            })
            .collect();

        draft::clear(store, &self.keys);
        let step_count = self.plan.steps.len();
        self.state = WizardState::empty(step_count);
        self.step_index = 0;
        self.furthest = 0;
        self.cascade = CascadeResolver::new(step_count);
        self.resolutions = vec![None; step_count];

        Ok(SubmitSuccess {
            entity,
            composite_payload: composite,
            report,
        })
    }
}
