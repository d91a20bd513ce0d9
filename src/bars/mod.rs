pub mod builder;
pub mod contract;
pub mod windows;

pub use builder::{BarBuilder, BarVariantKind};
pub use contract::{Bar, OhlcPolicy};
