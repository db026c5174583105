//! relaybus core: the data model, action contract, load-time resolver,
//! record streams, codecs, error codes and expression language shared by
//! the runtime and by action implementations.

pub mod codec;
pub mod context;
pub mod data;
pub mod error;
pub mod expr;
pub mod handler;
pub mod resolve;
pub mod schema;
pub mod stream;
pub mod traits;
pub mod types;

pub use codec::{Codec, CodecError, Codecs};
pub use context::{RequestContext, ResponseMeta};
pub use data::Data;
pub use error::{ActionError, BusError, ErrorCode, RetryClass};
pub use expr::{Expr, ExprError, Scope};
pub use handler::{Handler, HandlerFormatError};
pub use resolve::{Capability, CapabilityTable, ResolveError, Resolver};
pub use schema::{Coalesce, FieldDef, FieldType, Interfaces, OperationSchema, ValidationResult};
pub use stream::{Record, Sink, Source, StreamError};
pub use traits::{Action, FnAction, Flow};
pub use types::Value;
