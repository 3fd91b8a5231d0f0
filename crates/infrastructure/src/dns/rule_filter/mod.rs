pub mod ruleset;

pub use ruleset::{RuleAction, RuleSet};
