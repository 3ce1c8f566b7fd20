pub mod runtime;
pub mod types;

pub use runtime::ProviderRuntime;
pub use types::{ProviderError, ProviderErrorKind, ProviderRequest};
