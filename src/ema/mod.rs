pub mod kernel;
pub mod refresher;
pub mod variants;

pub use refresher::EmaRefresher;
pub use variants::EmaVariantKind;
