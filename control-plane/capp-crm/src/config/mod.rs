mod types;

pub use types::{CappConfig, FeaturesConfig, RetryConfig};
