mod cascade;
mod controller;
mod draft;
mod state;
mod steps;

pub use controller::{SubmitError, WizardController, WizardError};
pub use draft::{DraftKeys, DraftStore, SqliteDraftStore};
pub use state::StepMode;
pub use steps::class_teacher_plan;
