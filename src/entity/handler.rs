use std::sync::Arc;

use crate::{
    engine::{
        callable::{CompiledCallable, CompiledSelector},
        scope::Scope,
        value::EngineValue,
    },
    error::VeldResult,
};

/// A guarded expression producing a value for an attribute in a substep.
///
/// The selector is optional; an unguarded handler always fires.
#[derive(Clone)]
pub struct EventHandler {
    selector: Option<Arc<dyn CompiledSelector>>,
    callable: Arc<dyn CompiledCallable>,
}

impl EventHandler {
    pub fn new(callable: Arc<dyn CompiledCallable>) -> Self {
        Self {
            selector: None,
            callable,
        }
    }

    pub fn guarded(selector: Arc<dyn CompiledSelector>, callable: Arc<dyn CompiledCallable>) -> Self {
        Self {
            selector: Some(selector),
            callable,
        }
    }

    /// Evaluates the selector and, when it matches, the callable.
    /// `Ok(None)` means the guard declined.
    pub fn fire(&self, scope: &dyn Scope) -> VeldResult<Option<EngineValue>> {
        if let Some(selector) = &self.selector
            && !selector.matches(scope)?
        {
            return Ok(None);
        }
        self.callable.evaluate(scope).map(Some)
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHandler(guarded: {})", self.selector.is_some())
    }
}

/// Ordered handlers for one event key. The first handler whose selector
/// matches produces the value; if none match, the group assigns nothing and
/// the resolver falls back to the prior value.
#[derive(Clone, Debug, Default)]
pub struct EventHandlerGroup {
    handlers: Vec<EventHandler>,
}

impl EventHandlerGroup {
    pub fn new(handlers: Vec<EventHandler>) -> Self {
        Self { handlers }
    }

    pub fn single(callable: Arc<dyn CompiledCallable>) -> Self {
        Self {
            handlers: vec![EventHandler::new(callable)],
        }
    }

    pub fn push(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs handlers in order; the first match wins.
    pub fn fire_first(&self, scope: &dyn Scope) -> VeldResult<Option<EngineValue>> {
        for handler in &self.handlers {
            if let Some(value) = handler.fire(scope)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::scope::SingleValueScope;

    fn value_callable(n: i64) -> Arc<dyn CompiledCallable> {
        Arc::new(move |_: &dyn Scope| Ok(EngineValue::count(n)))
    }

    fn selector(result: bool) -> Arc<dyn CompiledSelector> {
        Arc::new(move |_: &dyn Scope| Ok(result))
    }

    #[test]
    fn test_unguarded_handler_always_fires() {
        let handler = EventHandler::new(value_callable(7));
        let scope = SingleValueScope::new(EngineValue::count(0));
        let result = handler.fire(&scope).unwrap();
        assert!(result.unwrap().approx_eq(&EngineValue::count(7)));
    }

    #[test]
    fn test_false_selector_declines() {
        let handler = EventHandler::guarded(selector(false), value_callable(7));
        let scope = SingleValueScope::new(EngineValue::count(0));
        assert!(handler.fire(&scope).unwrap().is_none());
    }

    #[test]
    fn test_group_first_match_wins() {
        let group = EventHandlerGroup::new(vec![
            EventHandler::guarded(selector(false), value_callable(1)),
            EventHandler::guarded(selector(true), value_callable(2)),
            EventHandler::new(value_callable(3)),
        ]);
        let scope = SingleValueScope::new(EngineValue::count(0));
        let result = group.fire_first(&scope).unwrap();
        assert!(result.unwrap().approx_eq(&EngineValue::count(2)));
    }

    #[test]
    fn test_group_with_no_match_assigns_nothing() {
        let group = EventHandlerGroup::new(vec![EventHandler::guarded(
            selector(false),
            value_callable(1),
        )]);
        let scope = SingleValueScope::new(EngineValue::count(0));
        assert!(group.fire_first(&scope).unwrap().is_none());
    }
}
