//! Request step execution
//!
//! Order of operations for one request step:
//! 1. resolve templated before-request hook names
//! 2. build the [`PendingRequest`] from the step's templates
//! 3. run before-request hooks, one at a time
//! 4. re-render every templated field no hook overwrote (`uri`, `name`, each
//!    header, `json`, `body`), so variables a hook just set are visible in
//!    the request it precedes
//! 5. apply the configured target and default headers
//! 6. issue the request
//! 7. resolve templated after-response hook names
//! 8. run after-response hooks, one at a time

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{Interpreter, RunError};
use crate::compiler::{CompiledRequest, HookRef};
use crate::context::Context;
use crate::events::EngineEvent;
use crate::executor::{PendingRequest, RequestExecutor};
use crate::hooks::{invoke_after_response, invoke_before_request, HookError, HookKind};
use crate::template::{Template, TemplateError};

impl<E: RequestExecutor> Interpreter<'_, E> {
    pub(super) async fn execute_request(
        &self,
        step: &CompiledRequest,
        context: &mut Context,
    ) -> Result<(), RunError> {
        let before = self.resolve_hooks(&step.before, HookKind::BeforeRequest, context, |name| {
            self.hooks.before_request(name)
        })?;

        let mut request = self.build_request(step, context)?;

        if !before.is_empty() {
            let built = request.clone();

            for (hook_name, hook) in &before {
                invoke_before_request(hook_name, hook.as_ref(), &mut request, context, self.events)
                    .await?;
            }

            let fresh = self.build_request(step, context)?;
            merge_untouched(&mut request, &built, fresh);
        }

        request.uri = self.settings.resolve_uri(request.uri);
        for (header, value) in &self.settings.default_headers {
            request
                .headers
                .entry(header.clone())
                .or_insert_with(|| value.clone());
        }

        let run_id = context.run_id();
        debug!(method = %request.method, uri = %request.uri, name = request.display_name(), "issuing request");
        self.events.emit(EngineEvent::Request {
            run_id,
            method: request.method,
            uri: request.uri.clone(),
            name: request.name.clone(),
        });

        let started = Instant::now();
        let response = self
            .executor
            .issue(&request)
            .await
            .map_err(|source| RunError::Request {
                method: request.method,
                uri: request.uri.clone(),
                source,
            })?;

        debug!(status = response.status, "response received");
        self.events.emit(EngineEvent::Response {
            run_id,
            status: response.status,
            elapsed: started.elapsed(),
        });

        let after = self.resolve_hooks(&step.after, HookKind::AfterResponse, context, |name| {
            self.hooks.after_response(name)
        })?;

        for (hook_name, hook) in &after {
            invoke_after_response(
                hook_name,
                hook.as_ref(),
                &response,
                &request,
                context,
                self.events,
            )
            .await?;
        }

        Ok(())
    }

    fn build_request(
        &self,
        step: &CompiledRequest,
        context: &Context,
    ) -> Result<PendingRequest, TemplateError> {
        let render = |t: &Template| self.interpolator.render(t, context);

        let mut request = PendingRequest::new(step.method, render(&step.uri)?);
        request.name = step.name.as_ref().map(render).transpose()?;
        request.body = step.body.as_ref().map(render).transpose()?;
        request.json = step
            .json
            .as_ref()
            .map(|json| json.resolve(&self.interpolator, context))
            .transpose()?;

        for (header, value) in &step.headers {
            request.headers.insert(header.clone(), render(value)?);
        }

        Ok(request)
    }

    /// Pair every hook reference with its implementation
    fn resolve_hooks<H: ?Sized>(
        &self,
        refs: &[HookRef<H>],
        kind: HookKind,
        context: &Context,
        find: impl Fn(&str) -> Option<Arc<H>>,
    ) -> Result<Vec<(String, Arc<H>)>, RunError> {
        let mut resolved = Vec::with_capacity(refs.len());
        for hook in refs {
            match hook {
                HookRef::Resolved { name, hook } => resolved.push((name.clone(), Arc::clone(hook))),
                HookRef::Deferred(template) => {
                    let name = self.interpolator.render(template, context)?;
                    let hook = find(&name).ok_or_else(|| HookError::Unknown {
                        kind,
                        name: name.clone(),
                    })?;
                    resolved.push((name, hook));
                }
            }
        }
        Ok(resolved)
    }
}

/// Take the re-rendered value of every field a hook left as it was built
fn merge_untouched(request: &mut PendingRequest, built: &PendingRequest, fresh: PendingRequest) {
    if request.uri == built.uri {
        request.uri = fresh.uri;
    }
    if request.name == built.name {
        request.name = fresh.name;
    }
    if request.json == built.json {
        request.json = fresh.json;
    }
    if request.body == built.body {
        request.body = fresh.body;
    }

    // A header the hook removed stays removed
    for (header, value) in fresh.headers {
        if request.headers.get(&header) == built.headers.get(&header) {
            request.headers.insert(header, value);
        }
    }
}
