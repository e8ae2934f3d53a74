//! Step compiler
//!
//! Turns [`ScenarioSpec`] descriptors into [`CompiledScenario`]s. Every
//! template is parsed here, once per scenario load, and literal hook names are
//! checked against the registry so that a typo fails the load instead of the
//! thousandth virtual user.
//!
//! Hook names that are themselves templates (`"{{ $loopElement.hook }}"`)
//! can only be checked when they resolve; those are deferred to the hook
//! point and fail the run with [`crate::hooks::HookError::Unknown`].

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::EngineSettings;
use crate::executor::Method;
use crate::hooks::{AfterResponseHook, BeforeRequestHook, FunctionHook, HookKind, HookRegistry};
use crate::scenario::{LoopSpec, OverSpec, RequestSpec, ScenarioSpec, StepSpec};
use crate::template::{Template, TemplateError, ValueTemplate};

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("{location}: {source}")]
    Template {
        location: String,
        #[source]
        source: TemplateError,
    },

    #[error("{location}: no {kind} hook named `{name}` is registered")]
    UnknownHook {
        location: String,
        kind: HookKind,
        name: String,
    },

    #[error("{location}: {message}")]
    InvalidStep { location: String, message: String },
}

/* ===================== Compiled Steps ===================== */

/// A scenario ready to run; shared read-only by every run
#[derive(Debug)]
pub struct CompiledScenario {
    pub name: Option<String>,
    pub(crate) steps: Vec<CompiledStep>,
}

impl CompiledScenario {
    /// Number of top-level steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum CompiledStep {
    Request(Box<CompiledRequest>),
    Loop(CompiledLoop),
    Function(CompiledFunction),
    Think(Duration),
    Log(Template),
}

/// A hook known at compile time, or a template naming one
pub(crate) enum HookRef<H: ?Sized> {
    Resolved { name: String, hook: Arc<H> },
    Deferred(Template),
}

impl<H: ?Sized> std::fmt::Debug for HookRef<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookRef::Resolved { name, .. } => f.debug_tuple("Resolved").field(name).finish(),
            HookRef::Deferred(template) => f.debug_tuple("Deferred").field(template).finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CompiledRequest {
    pub method: Method,
    pub uri: Template,
    pub name: Option<Template>,
    pub headers: Vec<(String, Template)>,
    pub json: Option<ValueTemplate>,
    pub body: Option<Template>,
    pub before: Vec<HookRef<dyn BeforeRequestHook>>,
    pub after: Vec<HookRef<dyn AfterResponseHook>>,
}

#[derive(Debug)]
pub(crate) enum LoopSource {
    Items(Arc<[Value]>),
    Expression(Template),
    Count(u64),
}

#[derive(Debug)]
pub(crate) struct CompiledLoop {
    pub source: LoopSource,
    pub body: Vec<CompiledStep>,
}

pub(crate) struct CompiledFunction {
    pub name: String,
    pub hook: Arc<dyn FunctionHook>,
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/* ===================== Compiler ===================== */

pub struct Compiler<'a> {
    hooks: &'a HookRegistry,
    settings: &'a EngineSettings,
}

impl<'a> Compiler<'a> {
    pub fn new(hooks: &'a HookRegistry, settings: &'a EngineSettings) -> Self {
        Self { hooks, settings }
    }

    pub fn compile(&self, spec: &ScenarioSpec) -> Result<CompiledScenario, CompileError> {
        let steps = self.compile_steps(&spec.flow, "flow")?;
        Ok(CompiledScenario {
            name: spec.name.clone(),
            steps,
        })
    }

    fn compile_steps(
        &self,
        steps: &[StepSpec],
        location: &str,
    ) -> Result<Vec<CompiledStep>, CompileError> {
        steps
            .iter()
            .enumerate()
            .map(|(idx, step)| self.compile_step(step, &format!("{}[{}]", location, idx)))
            .collect()
    }

    pub(crate) fn compile_step(
        &self,
        step: &StepSpec,
        location: &str,
    ) -> Result<CompiledStep, CompileError> {
        match step {
            StepSpec::Request(req) => Ok(CompiledStep::Request(Box::new(
                self.compile_request(req.method, &req.request, location)?,
            ))),

            StepSpec::Loop(spec) => self.compile_loop(spec, location).map(CompiledStep::Loop),

            StepSpec::Function(spec) => {
                let hook = self.hooks.function(&spec.function).ok_or_else(|| {
                    CompileError::UnknownHook {
                        location: location.to_string(),
                        kind: HookKind::Function,
                        name: spec.function.clone(),
                    }
                })?;
                Ok(CompiledStep::Function(CompiledFunction {
                    name: spec.function.clone(),
                    hook,
                }))
            }

            StepSpec::Think(spec) => {
                let seconds = spec.think * self.settings.think_scale;
                let pause = Duration::try_from_secs_f64(seconds).map_err(|e| {
                    CompileError::InvalidStep {
                        location: location.to_string(),
                        message: format!("invalid think time {}: {}", spec.think, e),
                    }
                })?;
                Ok(CompiledStep::Think(pause))
            }

            StepSpec::Log(spec) => Ok(CompiledStep::Log(template(&spec.log, location)?)),
        }
    }

    fn compile_request(
        &self,
        method: Method,
        spec: &RequestSpec,
        location: &str,
    ) -> Result<CompiledRequest, CompileError> {
        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| Ok((name.clone(), template(value, location)?)))
            .collect::<Result<Vec<_>, CompileError>>()?;

        let json = spec
            .json
            .as_ref()
            .map(ValueTemplate::compile)
            .transpose()
            .map_err(|source| CompileError::Template {
                location: location.to_string(),
                source,
            })?;

        let before = spec
            .before_request
            .iter()
            .flat_map(|names| names.as_slice())
            .map(|name| {
                self.hook_ref(name, HookKind::BeforeRequest, location, |n| {
                    self.hooks.before_request(n)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let after = spec
            .after_response
            .iter()
            .flat_map(|names| names.as_slice())
            .map(|name| {
                self.hook_ref(name, HookKind::AfterResponse, location, |n| {
                    self.hooks.after_response(n)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledRequest {
            method,
            uri: template(&spec.uri, location)?,
            name: spec.name.as_deref().map(|n| template(n, location)).transpose()?,
            headers,
            json,
            body: spec.body.as_deref().map(|b| template(b, location)).transpose()?,
            before,
            after,
        })
    }

    fn compile_loop(&self, spec: &LoopSpec, location: &str) -> Result<CompiledLoop, CompileError> {
        let source = match (&spec.over, spec.count) {
            (Some(OverSpec::Items(items)), _) => LoopSource::Items(Arc::from(items.as_slice())),
            (Some(OverSpec::Expression(expr)), _) => {
                let over = template(expr, location)?;
                if over.sole_placeholder().is_none() {
                    return Err(CompileError::InvalidStep {
                        location: location.to_string(),
                        message: format!("loop `over` must be a single `{{{{ expr }}}}`, got `{}`", expr),
                    });
                }
                LoopSource::Expression(over)
            }
            (None, Some(count)) => LoopSource::Count(count),
            (None, None) => {
                return Err(CompileError::InvalidStep {
                    location: location.to_string(),
                    message: "loop needs `over` or `count`".to_string(),
                })
            }
        };

        let body = self.compile_steps(&spec.body, &format!("{}.loop", location))?;
        Ok(CompiledLoop { source, body })
    }

    fn hook_ref<H: ?Sized>(
        &self,
        name: &str,
        kind: HookKind,
        location: &str,
        find: impl Fn(&str) -> Option<Arc<H>>,
    ) -> Result<HookRef<H>, CompileError> {
        if name.contains("{{") {
            return Ok(HookRef::Deferred(template(name, location)?));
        }

        match find(name) {
            Some(hook) => Ok(HookRef::Resolved {
                name: name.to_string(),
                hook,
            }),
            None => Err(CompileError::UnknownHook {
                location: location.to_string(),
                kind,
                name: name.to_string(),
            }),
        }
    }
}

fn template(source: &str, location: &str) -> Result<Template, CompileError> {
    Template::parse(source).map_err(|source| CompileError::Template {
        location: location.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> HookRegistry {
        HookRegistry::builder()
            .before_request("sign", |_req, _ctx, _ee, next| next.done())
            .after_response("record", |_res, _req, _ctx, _ee, next| next.done())
            .function("setup", |_ctx, _ee, next| next.done())
            .build()
    }

    fn compile(flow: serde_json::Value) -> Result<CompiledScenario, CompileError> {
        let spec = ScenarioSpec::from_json(json!({ "flow": flow })).unwrap();
        let hooks = registry();
        let settings = EngineSettings::default();
        Compiler::new(&hooks, &settings).compile(&spec)
    }

    #[test]
    fn test_compiles_all_step_kinds() {
        let scenario = compile(json!([
            {"function": "setup"},
            {"get": {"uri": "/a/{{ id }}", "beforeRequest": "sign", "afterResponse": ["record"]}},
            {"loop": [{"think": 0}], "over": "{{ ids }}"},
            {"log": "done {{ id }}"}
        ]))
        .unwrap();

        assert_eq!(scenario.len(), 4);
        assert!(matches!(scenario.steps[0], CompiledStep::Function(_)));
        match &scenario.steps[1] {
            CompiledStep::Request(req) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.uri.source(), "/a/{{ id }}");
                assert!(matches!(req.before.as_slice(), [HookRef::Resolved { name, .. }] if name == "sign"));
                assert_eq!(req.after.len(), 1);
            }
            other => panic!("expected request, got {:?}", other),
        }
        assert!(matches!(
            scenario.steps[2],
            CompiledStep::Loop(CompiledLoop { source: LoopSource::Expression(_), .. })
        ));
    }

    #[test]
    fn test_unknown_literal_hook_fails_load() {
        let err = compile(json!([
            {"loop": [{"get": {"uri": "/", "afterResponse": "missing"}}], "count": 1}
        ]))
        .unwrap_err();

        assert_eq!(
            err,
            CompileError::UnknownHook {
                location: "flow[0].loop[0]".to_string(),
                kind: HookKind::AfterResponse,
                name: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_hook_kind_must_match() {
        // "record" exists, but only as an after-response hook
        let err = compile(json!([{"get": {"uri": "/", "beforeRequest": "record"}}])).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnknownHook { kind: HookKind::BeforeRequest, .. }
        ));
    }

    #[test]
    fn test_unknown_function_fails_load() {
        let err = compile(json!([{"function": "nope"}])).unwrap_err();
        assert!(matches!(err, CompileError::UnknownHook { kind: HookKind::Function, .. }));
    }

    #[test]
    fn test_templated_hook_name_is_deferred() {
        let scenario = compile(json!([
            {"get": {"uri": "/", "beforeRequest": "{{ $loopElement.hook }}"}}
        ]))
        .unwrap();

        match &scenario.steps[0] {
            CompiledStep::Request(req) => {
                assert!(matches!(req.before.as_slice(), [HookRef::Deferred(_)]))
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_template_fails_load() {
        let err = compile(json!([
            {"loop": [{"post": {"uri": "/", "json": {"a": "{{ x + 1 }}"}}}], "over": [1]}
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            CompileError::Template { ref location, source: TemplateError::Syntax { .. } }
                if location == "flow[0].loop[0]"
        ));
    }

    #[test]
    fn test_loop_needs_a_source() {
        let err = compile(json!([{"loop": [{"function": "setup"}]}])).unwrap_err();
        assert!(matches!(err, CompileError::InvalidStep { .. }));
    }

    #[test]
    fn test_over_expression_must_be_single_placeholder() {
        let err = compile(json!([{"loop": [], "over": "ids: {{ ids }}"}])).unwrap_err();
        assert!(matches!(err, CompileError::InvalidStep { .. }));
    }

    #[test]
    fn test_negative_think_is_rejected() {
        let err = compile(json!([{"think": -1.0}])).unwrap_err();
        assert!(matches!(err, CompileError::InvalidStep { .. }));
    }

    #[test]
    fn test_over_wins_over_count() {
        let scenario = compile(json!([{"loop": [], "over": [1, 2], "count": 9}])).unwrap();
        match &scenario.steps[0] {
            CompiledStep::Loop(CompiledLoop { source: LoopSource::Items(items), .. }) => {
                assert_eq!(items.len(), 2)
            }
            other => panic!("expected literal loop, got {:?}", other),
        }
    }
}
