#![doc = "Cadis: a deterministic, country-scoped administrative-hierarchy lookup runtime."]

mod dataset;
mod error;

pub mod bootstrap;
pub mod ffsf;
pub mod integrity;
pub mod pipeline;
pub mod policy;

#[doc(inline)]
pub use dataset::{CadisRuntime, ENGINE_NAME, ENGINE_VERSION};

#[doc(inline)]
pub use error::{CadisError, Result};

#[doc(inline)]
pub use bootstrap::{BootstrapState, DEFAULT_REQUIRED_FILES};

#[doc(inline)]
pub use ffsf::{FfsfIndex, GeometryHit, Point};

#[doc(inline)]
pub use policy::RuntimePolicy;
