pub mod conditions;
pub mod context;
pub mod engine;
pub mod error;
pub mod progress;
pub mod provider;
pub mod results;
pub mod rules;
pub mod scope;
pub mod settings;
pub mod snippet;

mod compile;
mod incidents;
mod tagging;
mod templating;

pub use conditions::{ChainRef, Condition, ProviderCall, HAS_TAGS_CAPABILITY};
pub use context::{ConditionContext, ConditionResponse, IncidentContext, Location, Position};
pub use engine::{CancellationToken, RuleEngine, RunOptions, DEFAULT_WORKERS};
pub use error::EngineError;
pub use progress::{LogReporter, ProgressEvent, ProgressReporter};
pub use provider::{Provider, ProviderContext, ProviderRegistry, ProviderResponse};
pub use results::{Incident, RuleSetResult, Violation};
pub use rules::{Category, CustomVariable, Link, Message, Perform, Rule, RuleSelector, RuleSet};
pub use scope::{PathScope, Scope};
pub use settings::{EngineSettings, Options};
pub use snippet::CodeSnipper;

pub use scrutiny_labels::{Label, LabelSelector, SelectorSyntaxError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
