//! Nightlight: an astrophotography post-processing engine — the
//! operator graph, promise runtime, robust statistics kernel, stacking
//! kernel, reference-frame coordinator, and batch scheduler that turn
//! many calibration/light frames into one stacked composite.

pub mod batch;
pub mod context;
pub mod error;
pub mod image;
pub mod operator;
pub mod promise;
pub mod reference;
pub mod stack;
pub mod stats;

pub use context::{ContextParams, ExecutionContext};
pub use error::{NightlightError, Result};
pub use image::Image;
pub use operator::{Operator, Registry};
pub use promise::Promise;
