//! Signal ingress: heuristic filter, message parsers and the pure validator.
//!
//! A channel's messages flow `looks_like_signal` → the parser assigned to the
//! channel → `SignalValidator`. Parsers are registered under stable names so
//! supporting a new channel format never touches another component.

pub mod filter;
pub mod parsers;
pub mod validator;

pub use filter::looks_like_signal;
pub use parsers::{DollarParser, HashtagParser, ParseError, SignalParser};
pub use validator::{SignalValidator, ValidationError};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

/// Name-keyed set of available parsers. Built once at boot from config.
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn SignalParser>>,
}

impl ParserRegistry {
    /// Registry with the two built-in formats.
    pub fn with_default_parsers() -> Self {
        let mut registry = Self {
            parsers: HashMap::new(),
        };
        registry.register(Arc::new(HashtagParser::new(None)));
        registry.register(Arc::new(DollarParser::new(None)));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn SignalParser>) {
        info!(name = %parser.name(), "parser registered");
        self.parsers.insert(parser.name().to_string(), parser);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SignalParser>> {
        self.parsers.get(name).cloned()
    }

    /// Parser names, for boot-time validation of the channel table.
    pub fn names(&self) -> Vec<&str> {
        self.parsers.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_both_formats() {
        let registry = ParserRegistry::with_default_parsers();
        assert!(registry.get("hashtag").is_some());
        assert!(registry.get("dollar").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
