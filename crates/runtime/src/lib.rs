pub mod aggregate;
pub mod dispatch;
pub mod handle;
pub mod handlers;
pub mod metrics;
pub mod mirror;
pub mod request;
pub mod runtime;
pub mod substrate;

pub use dispatch::{Dispatcher, SharedTopology};
pub use handle::{HandleId, HandleTable};
pub use handlers::{DispatchContext, HandlerTable, OpHandler};
pub use metrics::DispatchMetrics;
pub use mirror::MirrorSubstrate;
pub use request::{Completion, Operation, Request, Weights};
pub use runtime::Runtime;
pub use substrate::Substrate;
