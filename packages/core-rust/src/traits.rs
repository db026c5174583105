use async_trait::async_trait;

use crate::context::RequestContext;
use crate::data::Data;
use crate::error::ActionError;
use crate::types::Value;

/// Successful outcome of one step call.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Continue with the next step. `Some` carries the step result.
    Continue(Option<Value>),
    /// End the enclosing pipeline successfully without running the
    /// remaining steps.
    Stop(Option<Value>),
}

impl Flow {
    /// Continue with a result.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Continue(Some(value.into()))
    }

    /// Continue without producing a result.
    #[must_use]
    pub fn next() -> Self {
        Self::Continue(None)
    }

    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop(_))
    }

    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Continue(v) | Self::Stop(v) => v,
        }
    }
}

/// A step's callable, built once at load time by a loader.
///
/// Actions are immutable after creation; all per-call state lives in the
/// request [`Data`].
#[async_trait]
pub trait Action: Send + Sync {
    /// Runs the step against the shared request scope.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] when the step fails. Retry classification
    /// on the error decides whether a retry policy may re-invoke the step.
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError>;
}

/// Adapter turning an async closure into an [`Action`].
///
/// The closure receives owned copies because it cannot borrow across the
/// boxed future. Used for small built-ins and tests.
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, Data) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(Data, Flow), ActionError>> + Send,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(RequestContext, Data) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(Data, Flow), ActionError>> + Send,
{
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let (updated, flow) = (self.f)(ctx.clone(), std::mem::take(data)).await?;
        *data = updated;
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_action_writes_back_data() {
        let action = FnAction::new(|_ctx, mut data: Data| async move {
            data.insert("seen", true);
            Ok((data, Flow::value(1)))
        });
        let mut data = Data::new();
        let flow = action.call(&RequestContext::default(), &mut data).await.unwrap();
        assert_eq!(flow, Flow::Continue(Some(Value::Int(1))));
        assert_eq!(data.get("seen"), Some(&Value::Bool(true)));
    }

    #[test]
    fn stop_keeps_value() {
        let flow = Flow::Stop(Some(Value::from("x")));
        assert!(flow.is_stop());
        assert_eq!(flow.into_value(), Some(Value::from("x")));
    }
}
