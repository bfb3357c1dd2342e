//! Request-scoped context threaded through every server call

use std::time::{Duration, Instant};

use uuid::Uuid;

/// How hard the identity layer should check the users a request touches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentifyMode {
    /// Full identification with user-visible failures
    #[default]
    Normal,
    /// Identify, but never block on failures
    Chat,
    /// Skip identification (background work such as rekeys)
    Skip,
}

/// Carries a trace ID, identify mode and optional deadline for one logical
/// operation
#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: Uuid,
    identify_mode: IdentifyMode,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            trace_id: Uuid::new_v4(),
            identify_mode: IdentifyMode::default(),
            deadline: None,
        }
    }

    pub fn with_identify_mode(mut self, mode: IdentifyMode) -> Self {
        self.identify_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// A child context for a sub-operation: same deadline and mode, new
    /// trace ID
    pub fn child(&self) -> Self {
        RequestContext {
            trace_id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn identify_mode(&self) -> IdentifyMode {
        self.identify_mode
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn span(&self) -> tracing::Span {
        tracing::debug_span!("request", trace_id = %self.trace_id)
    }
}
