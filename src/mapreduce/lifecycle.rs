//! Hooks around user function execution
//!
//! The grid can use these to inject resources into user functions before
//! they run and release them afterwards.

/// Lifecycle callbacks invoked around every mapper, combiner and reducer run
pub trait TaskLifecycle: Send + Sync {
    /// Called before `function` (its type name) runs against `cache`
    fn on_pre_execute(&self, _function: &str, _cache: &str) {}

    /// Called after `function` finished, whether it succeeded or not
    fn on_post_execute(&self, _function: &str) {}
}

/// Lifecycle that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl TaskLifecycle for NoopLifecycle {}
