pub mod rule_filter;
pub mod upstream;
pub mod wire;

pub use rule_filter::{RuleAction, RuleSet};
pub use upstream::{Caller, HttpsCaller, PlainCaller, TlsCaller};
