pub mod error;
pub mod traits;

#[cfg(feature = "kube-client")]
pub mod k8s;

#[cfg(feature = "memory")]
pub mod memory;

pub use error::*;
pub use traits::*;
