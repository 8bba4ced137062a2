use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Existing,
    Create,
}

/// Per-step state as a tagged union: exactly one shape is authoritative for
/// the step's current mode, so an "existing" step can never leak a stale
/// create payload into a submit (and vice versa).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StepState {
    Unset,
    Existing { selected: String },
    Create { payload: Map<String, Value> },
}

impl StepState {
    pub fn mode(&self) -> Option<StepMode> {
        match self {
            StepState::Unset => None,
            StepState::Existing { .. } => Some(StepMode::Existing),
            StepState::Create { .. } => Some(StepMode::Create),
        }
    }

    /// The step's resolved value before submission: the selected existing
    /// identifier, if any. Create-mode steps have none until submit.
    pub fn selected(&self) -> Option<&str> {
        match self {
            StepState::Existing { selected } if !selected.is_empty() => Some(selected),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Map<String, Value>> {
        match self {
            StepState::Create { payload } => Some(payload),
            _ => None,
        }
    }
}

/// Every field from every step plus the wizard-level scalar fields. The
/// controller owns the single instance; the draft store only mirrors it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardState {
    pub steps: Vec<StepState>,
    #[serde(default)]
    pub scalars: Map<String, Value>,
}

impl WizardState {
    pub fn empty(step_count: usize) -> Self {
        Self {
            steps: vec![StepState::Unset; step_count],
            scalars: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// An existing entity was selected; no create call was made.
    Reused,
    /// A create call minted this identifier during the current attempt.
    Created,
}

/// The identifier obtained for one step during submission. Retained across
/// failed attempts so a retry never re-creates an already-committed entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub id: String,
    pub source: ResolutionSource,
}
