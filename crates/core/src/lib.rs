pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod op;
pub mod status;
pub mod topology;

pub use buffer::{
    shared, Buffer, BufferData, DataType, Element, HeapAllocator, OutputAllocator, Shape,
    SharedBuffer,
};
pub use config::{DispatchConfig, HandleConfig, LoggingConfig, RuntimeConfig};
pub use error::*;
pub use logging::init_tracing;
pub use op::OpKind;
pub use status::{Status, StatusKind};
pub use topology::{Rank, TopologySnapshot};
