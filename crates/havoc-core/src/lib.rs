pub mod chaos;
pub mod config;
pub mod duration;
pub mod events;
pub mod experiment;
pub mod schedule;
pub mod selector;
pub mod state;
pub mod types;
pub mod validation;
pub mod workflow;

pub use chaos::{ChaosKind, ChaosSpec, SpecError};
pub use config::*;
pub use duration::{parse_duration, DurationParseError};
pub use events::*;
pub use experiment::*;
pub use schedule::*;
pub use selector::SelectorSpec;
pub use state::*;
pub use types::*;
pub use validation::*;
pub use workflow::*;
