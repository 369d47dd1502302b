//! Startup milestone detection from server output.
//!
//! The server exposes no health endpoint, so readiness is inferred from the
//! text it prints. The marker strings are whatever the current server build
//! happens to print and can change between releases; they are configurable
//! and kept behind [`StatusClassifier`] so a structured health check can
//! replace them.

/// A milestone a line of output can signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// The server finished starting and accepts connections.
    Started,
    /// The server completed authentication.
    Authenticated,
}

/// Maps output lines to lifecycle milestones.
pub trait StatusClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Option<Milestone>;
}

/// Matches configured substrings. `Started` wins when a line matches both.
#[derive(Debug, Clone)]
pub struct SubstringClassifier {
    started: Vec<String>,
    authenticated: Vec<String>,
}

impl SubstringClassifier {
    pub fn new(started: Vec<String>, authenticated: Vec<String>) -> Self {
        Self {
            started: started.into_iter().filter(|m| !m.is_empty()).collect(),
            authenticated: authenticated.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }
}

impl Default for SubstringClassifier {
    fn default() -> Self {
        Self::new(
            vec!["Server started".to_string(), "Done".to_string()],
            vec!["Authentication successful".to_string()],
        )
    }
}

impl StatusClassifier for SubstringClassifier {
    fn classify(&self, line: &str) -> Option<Milestone> {
        if self.started.iter().any(|m| line.contains(m.as_str())) {
            Some(Milestone::Started)
        } else if self.authenticated.iter().any(|m| line.contains(m.as_str())) {
            Some(Milestone::Authenticated)
        } else {
            None
        }
    }
}
