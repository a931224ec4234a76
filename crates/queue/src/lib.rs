pub mod admission;
pub mod error;

pub use admission::{Admit, AdmissionQueue};
pub use error::QueueError;
