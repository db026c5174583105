//! Links locally configured operations into the mesh so compute modules can
//! import them.
//!
//! Each local operation is exported under all four interaction kinds.
//! Request/stream runs the pipeline with a sink whose records become the
//! response stream; request/channel also attaches the inbound payloads as
//! the pipeline's source. Callbacks run under the caller's request id and
//! claims.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use relaybus_core::stream::{channel, ChannelSource};
use relaybus_core::{ActionError, Data, Handler, Record, RequestContext, Sink, Source, StreamError, Value};
use tokio::task::JoinHandle;

use super::module::{Direction, Link, Module, Operation, OperationKind, Payload, PayloadStream};
use super::MeshError;
use crate::processor::Processor;

/// Records buffered between a streaming pipeline and its caller.
const STREAM_BUFFER: usize = 16;

const KINDS: [OperationKind; 4] = [
    OperationKind::RequestResponse,
    OperationKind::FireAndForget,
    OperationKind::RequestStream,
    OperationKind::RequestChannel,
];

/// Exports every interface and provider operation of a processor. Input
/// payloads are MessagePack and become the request `Data` input.
pub struct PipelineModule {
    processor: Weak<Processor>,
    handlers: Vec<Handler>,
    env: Value,
}

impl PipelineModule {
    #[must_use]
    pub fn new(processor: &Arc<Processor>, env: Value) -> Self {
        Self {
            processor: Arc::downgrade(processor),
            handlers: processor.operations(),
            env,
        }
    }

    fn prepare(&self, caller: &RequestContext, payload: &Payload) -> Result<Call, MeshError> {
        let index = payload.index();
        let handler = usize::try_from(index)
            .ok()
            .and_then(|i| self.handlers.get(i))
            .ok_or(MeshError::UnknownIndex { index })?;
        let processor = self
            .processor
            .upgrade()
            .ok_or_else(|| MeshError::Module("processor is gone".to_string()))?;

        let mut ctx = caller.without_streams().with_handler(handler.clone());
        if ctx.request_id.is_empty() {
            ctx.request_id = uuid::Uuid::new_v4().to_string();
        }
        let data = Data::for_request(payload.to_value()?, ctx.claims.clone(), self.env.clone());
        Ok(Call {
            processor,
            handler: handler.clone(),
            ctx,
            data,
        })
    }

    /// Runs `call` in the background with a sink attached and streams what
    /// it pushes.
    fn stream(call: Call) -> PayloadStream {
        let (sink, source) = channel(STREAM_BUFFER);
        let sink = Arc::new(sink);
        let call = call.with_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        let task = tokio::spawn(async move {
            let result = call.run().await.map(drop);
            if result.is_ok() {
                sink.complete();
            }
            result
        });
        outbound(source, task)
    }
}

#[async_trait]
impl Module for PipelineModule {
    fn name(&self) -> &str {
        "pipelines"
    }

    fn operations(&self) -> Vec<Operation> {
        (0_u32..)
            .zip(&self.handlers)
            .flat_map(|(index, handler)| {
                KINDS.into_iter().map(move |kind| Operation {
                    index,
                    kind,
                    direction: Direction::Export,
                    namespace: handler.interface.clone(),
                    operation: handler.operation.clone(),
                })
            })
            .collect()
    }

    fn link_import(&self, _index: u32, _link: Link) {}

    async fn request_response(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, MeshError> {
        let value = self.prepare(ctx, &payload)?.run().await?;
        Payload::from_value(&value.unwrap_or_default())
    }

    async fn fire_and_forget(&self, ctx: &RequestContext, payload: Payload) -> Result<(), MeshError> {
        let call = self.prepare(ctx, &payload)?;
        tokio::spawn(async move {
            let handler = call.handler.clone();
            if let Err(e) = call.run().await {
                tracing::error!(%handler, error = %e, "fire-and-forget call failed");
            }
        });
        Ok(())
    }

    fn request_stream(&self, ctx: &RequestContext, payload: Payload) -> PayloadStream {
        match self.prepare(ctx, &payload) {
            Ok(call) => Self::stream(call),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    fn request_channel(&self, ctx: &RequestContext, payload: Payload, input: PayloadStream) -> PayloadStream {
        match self.prepare(ctx, &payload) {
            Ok(call) => Self::stream(call.with_source(inbound(input))),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

/// One prepared invocation of a local operation.
struct Call {
    processor: Arc<Processor>,
    handler: Handler,
    ctx: RequestContext,
    data: Data,
}

impl Call {
    fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.ctx = self.ctx.with_sink(sink);
        self
    }

    fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.ctx = self.ctx.with_source(source);
        self
    }

    async fn run(mut self) -> Result<Option<Value>, MeshError> {
        let outcome = self
            .processor
            .invoke(&self.ctx, &self.handler, &mut self.data)
            .await?
            .ok_or_else(|| MeshError::NotExported {
                address: (&self.handler).into(),
            })?;
        Ok(outcome.into_value())
    }
}

/// Pumps inbound payloads into a source the pipeline can drain.
fn inbound(mut input: PayloadStream) -> Arc<dyn Source> {
    let (sink, source) = channel(STREAM_BUFFER);
    tokio::spawn(async move {
        while let Some(item) = input.next().await {
            let value = match item.and_then(|payload| payload.to_value()) {
                Ok(value) => value,
                Err(e) => {
                    sink.error(StreamError::Failed(e.to_string())).await;
                    return;
                }
            };
            if sink.next(Record::new(value)).await.is_err() {
                // Pipeline stopped reading.
                return;
            }
        }
        sink.complete();
    });
    Arc::new(source)
}

/// Response side of a streaming call. Dropping it cancels the pipeline's
/// sink.
struct Outbound {
    source: ChannelSource,
    task: Option<JoinHandle<Result<(), MeshError>>>,
}

impl Outbound {
    async fn next(&mut self) -> Option<Result<Payload, MeshError>> {
        let ended_with = match self.source.next().await {
            Ok(Some(record)) => return Some(Payload::from_value(&record.value)),
            Ok(None) => None,
            Err(e) => Some(e),
        };
        // The pipeline's own failure outranks the stream error it caused.
        let task = self.task.take()?;
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(MeshError::Module(e.to_string())),
        };
        match (result, ended_with) {
            (Err(e), _) => Some(Err(e)),
            (Ok(()), Some(e)) => Some(Err(ActionError::from(e).into())),
            (Ok(()), None) => None,
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.source.cancel();
    }
}

fn outbound(source: ChannelSource, task: JoinHandle<Result<(), MeshError>>) -> PayloadStream {
    let state = Outbound {
        source,
        task: Some(task),
    };
    stream::unfold(state, |mut state| async move {
        let item = state.next().await?;
        Some((item, state))
    })
    .boxed()
}
