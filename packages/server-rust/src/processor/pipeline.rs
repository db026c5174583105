//! Compiled pipelines and the per-request step loop.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use relaybus_core::data::keys;
use relaybus_core::{Action, ActionError, Data, Flow, RequestContext, Value};
use tracing::{info_span, Instrument};

/// Terminal state of a successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every step ran; carries the value of the last step that produced one.
    Completed(Option<Value>),
    /// A step asked to stop; carries its value, or the value produced so far.
    Stopped(Option<Value>),
}

impl Outcome {
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(v) | Self::Stopped(v) => v.as_ref(),
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Completed(v) | Self::Stopped(v) => v,
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// One compiled step: the action (already wrapped in its resiliency
/// policies) plus result binding and optional recovery pipeline.
pub struct Step {
    pub name: String,
    pub uses: String,
    pub returns: Option<String>,
    pub action: Arc<dyn Action>,
    pub on_error: Option<Arc<Pipeline>>,
}

impl Step {
    fn bind(&self, data: &mut Data, value: &Value) {
        if let Some(name) = &self.returns {
            data.insert(name.as_str(), value.clone());
        }
        data.insert(keys::DOLLAR, value.clone());
        data.insert(keys::PIPE, value.clone());
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("uses", &self.uses)
            .field("returns", &self.returns)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// A named, ordered sequence of steps, compiled once at load time.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
}

impl Pipeline {
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Runs the steps in order against `data`.
    ///
    /// A failing step with a recovery pipeline hands `data` (with `$error`
    /// set) to that pipeline and the run ends with the recovery's value.
    /// A stop raised inside the recovery ends only the recovery.
    ///
    /// # Errors
    ///
    /// Returns the first step error that has no recovery pipeline, or the
    /// recovery pipeline's own error.
    pub fn run<'a>(
        &'a self,
        ctx: &'a RequestContext,
        data: &'a mut Data,
    ) -> BoxFuture<'a, Result<Outcome, ActionError>> {
        Box::pin(async move {
            let mut last: Option<Value> = None;
            for step in &self.steps {
                let span = info_span!(
                    "step",
                    pipeline = %self.name,
                    step = %step.name,
                    uses = %step.uses,
                );
                match step.action.call(ctx, data).instrument(span).await {
                    Ok(Flow::Stop(value)) => {
                        tracing::debug!(pipeline = %self.name, step = %step.name, "pipeline stopped");
                        return Ok(Outcome::Stopped(value.or(last)));
                    }
                    Ok(Flow::Continue(Some(value))) => {
                        step.bind(data, &value);
                        last = Some(value);
                    }
                    Ok(Flow::Continue(None)) => {}
                    Err(error) => {
                        let Some(recovery) = &step.on_error else {
                            return Err(error);
                        };
                        tracing::warn!(
                            pipeline = %self.name,
                            step = %step.name,
                            %error,
                            "step failed, running recovery pipeline"
                        );
                        data.insert(keys::ERROR, error.to_value(&step.name));
                        let outcome = recovery.run(ctx, data).await?;
                        return Ok(Outcome::Completed(outcome.into_value()));
                    }
                }
            }
            Ok(Outcome::Completed(last))
        })
    }
}
