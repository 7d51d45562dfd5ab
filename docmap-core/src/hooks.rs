//! Lifecycle hooks attached to a model schema.
//!
//! Hooks run before queries, saves and deletes. An [`HookOutcome::Abort`] turns the
//! operation into an empty result (`None`, an empty list, `0`, an empty page, or
//! `false` for `save`/`delete`) instead of an error.

use std::fmt::Debug;

use crate::{model::Model, query::Expr};

/// The decision returned by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// Skip the operation. The reason is logged at `debug`.
    Abort(String),
}

impl HookOutcome {
    pub fn is_abort(&self) -> bool {
        matches!(self, HookOutcome::Abort(_))
    }
}

/// The kind of store operation a query hook is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Find,
    Count,
    Distinct,
    Aggregate,
    Update,
    Delete,
}

/// What a query is about to do.
#[derive(Debug)]
pub struct QueryContext<'a> {
    pub model: &'a str,
    pub action: QueryAction,
    /// The compiled filter, using stored field names.
    pub filter: Option<&'a Expr>,
}

/// Hook invoked around model operations. Every method defaults to
/// [`HookOutcome::Continue`].
///
/// # Example
///
/// ```ignore
/// #[derive(Debug)]
/// struct ReadOnly;
///
/// impl ModelHook for ReadOnly {
///     fn before_save(&self, _model: &Model) -> HookOutcome {
///         HookOutcome::Abort("read only".into())
///     }
/// }
///
/// let schema = ModelSchema::builder("Archive").hook(ReadOnly);
/// ```
pub trait ModelHook: Send + Sync + Debug {
    fn before_query(&self, _context: &QueryContext<'_>) -> HookOutcome {
        HookOutcome::Continue
    }

    fn before_save(&self, _model: &Model) -> HookOutcome {
        HookOutcome::Continue
    }

    fn before_delete(&self, _model: &Model) -> HookOutcome {
        HookOutcome::Continue
    }
}

/// Runs hooks in registration order; the first abort wins.
pub(crate) fn run<'h, H>(hooks: H, mut call: impl FnMut(&dyn ModelHook) -> HookOutcome) -> HookOutcome
where
    H: IntoIterator<Item = &'h std::sync::Arc<dyn ModelHook>>,
{
    for hook in hooks {
        let outcome = call(hook.as_ref());
        if outcome.is_abort() {
            return outcome;
        }
    }

    HookOutcome::Continue
}
