use crate::directory::{Entity, EntityKind};
use serde_json::{Map, Value};

/// A candidate-list fetch the embedding layer must run against the directory
/// and hand back via [`CascadeResolver::apply`]. The generation tag makes
/// superseded fetches detectable regardless of response arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub step: usize,
    pub generation: u64,
    pub kind: EntityKind,
    pub filter: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct StepCandidates {
    entities: Vec<Entity>,
    /// Dependency value the current list was fetched for. `None` both for
    /// dependency-free steps and for lists that were never loaded; `loaded`
    /// disambiguates.
    dep_value: Option<String>,
    loaded: bool,
    generation: u64,
    in_flight: Option<u64>,
}

/// Owns every step's CandidateList. Lists are only ever replaced wholesale:
/// a dependency change clears the list immediately, bumps the generation,
/// and any response tagged with an older generation is dropped on arrival.
#[derive(Debug)]
pub struct CascadeResolver {
    steps: Vec<StepCandidates>,
}

impl CascadeResolver {
    pub fn new(step_count: usize) -> Self {
        Self {
            steps: vec![StepCandidates::default(); step_count],
        }
    }

    /// Discard a step's candidate list because its dependency value changed.
    /// Any in-flight fetch for the step becomes stale.
    pub fn invalidate(&mut self, step: usize) {
        let s = &mut self.steps[step];
        s.entities.clear();
        s.dep_value = None;
        s.loaded = false;
        s.generation += 1;
        s.in_flight = None;
    }

    /// Register a fetch about to be issued. Supersedes any earlier fetch for
    /// the same step, even one issued for the same dependency value.
    pub fn plan_fetch(
        &mut self,
        step: usize,
        kind: EntityKind,
        filter: Map<String, Value>,
    ) -> FetchPlan {
        let s = &mut self.steps[step];
        s.generation += 1;
        s.in_flight = Some(s.generation);
        FetchPlan {
            step,
            generation: s.generation,
            kind,
            filter,
        }
    }

    /// Accept a fetch response. Returns false (and changes nothing) when the
    /// response's generation is no longer current.
    pub fn apply(
        &mut self,
        step: usize,
        generation: u64,
        dep_value: Option<String>,
        entities: Vec<Entity>,
    ) -> bool {
        let s = &mut self.steps[step];
        if s.in_flight != Some(generation) || s.generation != generation {
            return false;
        }
        s.entities = entities;
        s.dep_value = dep_value;
        s.loaded = true;
        s.in_flight = None;
        true
    }

    pub fn is_loading(&self, step: usize) -> bool {
        self.steps[step].in_flight.is_some()
    }

    /// A list is fresh only while its tag matches the step's current
    /// dependency value; selections may only be made against a fresh list.
    pub fn is_fresh(&self, step: usize, current_dep_value: Option<&str>) -> bool {
        let s = &self.steps[step];
        s.loaded && s.dep_value.as_deref() == current_dep_value
    }

    pub fn candidates(&self, step: usize) -> Option<&[Entity]> {
        let s = &self.steps[step];
        s.loaded.then_some(s.entities.as_slice())
    }

    pub fn contains(&self, step: usize, id: &str) -> bool {
        self.steps[step]
            .entities
            .iter()
            .any(|e| e.id == id)
    }
}
