//! Middleware hooks run on every emit before listener dispatch

use tracing::debug;

use super::types::{Event, pattern_matches};

/// What the dispatch pass should do after a middleware ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    /// Stop the pass: no listener runs and the event is not recorded
    Veto,
}

/// Cross-cutting hook over every emitted event
///
/// Middleware may rewrite the payload. The listener snapshot is taken before
/// the chain runs, so renaming an event does not change who receives it.
pub trait Middleware: Send + Sync {
    /// Name reported in `DispatchReport::vetoed_by`
    fn name(&self) -> &str {
        "anonymous"
    }

    fn process(&self, event: &mut Event) -> MiddlewareAction;
}

impl<F> Middleware for F
where
    F: Fn(&mut Event) -> MiddlewareAction + Send + Sync,
{
    fn process(&self, event: &mut Event) -> MiddlewareAction {
        self(event)
    }
}

/// Traces every event that passes through the bus
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn process(&self, event: &mut Event) -> MiddlewareAction {
        debug!(
            event = %event.name,
            source = event.source.as_deref().unwrap_or("-"),
            replayed = event.replayed,
            payload = %event.payload,
            "LoggingMiddleware: event"
        );
        MiddlewareAction::Continue
    }
}

/// Vetoes replayed events unless their name matches one of the allowed patterns
///
/// Live events always pass.
#[derive(Clone, Debug, Default)]
pub struct ReplayFilter {
    allowed: Vec<String>,
}

impl ReplayFilter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Middleware for ReplayFilter {
    fn name(&self) -> &str {
        "replay-filter"
    }

    fn process(&self, event: &mut Event) -> MiddlewareAction {
        if !event.replayed {
            return MiddlewareAction::Continue;
        }
        let name = event.name.as_str();
        if self.allowed.iter().any(|pattern| pattern_matches(pattern, name)) {
            MiddlewareAction::Continue
        } else {
            debug!(event = %name, "ReplayFilter: vetoed replayed event");
            MiddlewareAction::Veto
        }
    }
}
