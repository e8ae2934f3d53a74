//! Per-run variable context
//!
//! A [`Context`] belongs to exactly one scenario run. Named variables live in
//! `vars` and are shared by every loop iteration of the run; loop bindings
//! (`$loopElement`, `$loopCount`) live on a scope stack that the interpreter
//! pushes on loop entry and pops on loop exit, so they are never visible
//! outside the iteration that bound them.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Binding holding the current element of a loop's `over` collection
pub const LOOP_ELEMENT: &str = "$loopElement";

/// Binding holding the 1-based iteration counter of the innermost loop
pub const LOOP_COUNT: &str = "$loopCount";

/// Variable seeded with the run id at run start
pub const RUN_UUID: &str = "$uuid";

/// One loop iteration's bindings
#[derive(Debug, Clone, PartialEq)]
struct LoopScope {
    element: Option<Value>,
    count: Value,
}

/// Mutable variable store for one scenario run
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    run_id: Uuid,

    /// Named variables, written by hooks
    pub vars: Map<String, Value>,

    /// Loop bindings, innermost last
    scopes: Vec<LoopScope>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl From<Map<String, Value>> for Context {
    fn from(vars: Map<String, Value>) -> Self {
        Self::new(vars)
    }
}

impl Context {
    /// Create a context for a new run with caller-supplied variables
    pub fn new(mut vars: Map<String, Value>) -> Self {
        let run_id = Uuid::new_v4();
        vars.entry(RUN_UUID)
            .or_insert_with(|| Value::String(run_id.to_string()));

        Self {
            run_id,
            vars,
            scopes: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Set a named variable, returning the previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// The element bound by the innermost `over` loop
    pub fn loop_element(&self) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.element.as_ref())
    }

    /// The iteration counter of the innermost loop
    pub fn loop_count(&self) -> Option<&Value> {
        self.scopes.last().map(|s| &s.count)
    }

    /// Number of loops currently entered
    pub fn loop_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Resolve a root identifier.
    ///
    /// Loop bindings shadow named variables of the same name.
    pub fn lookup(&self, root: &str) -> Option<&Value> {
        let bound = match root {
            LOOP_ELEMENT => self.loop_element(),
            LOOP_COUNT => self.loop_count(),
            _ => None,
        };

        bound.or_else(|| self.vars.get(root))
    }

    pub fn into_vars(self) -> Map<String, Value> {
        self.vars
    }

    pub(crate) fn push_scope(&mut self, element: Option<Value>, iteration: usize) {
        self.scopes.push(LoopScope {
            element,
            count: Value::from(iteration),
        });
    }

    /// Rebind the innermost scope for the next iteration
    pub(crate) fn rebind_scope(&mut self, element: Option<Value>, iteration: usize) {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.element = element;
                scope.count = Value::from(iteration);
            }
            None => self.push_scope(element, iteration),
        }
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub(crate) fn clear_scopes(&mut self) {
        self.scopes.clear();
    }
}
