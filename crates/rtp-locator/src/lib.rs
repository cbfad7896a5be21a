pub mod cache;
pub mod fits;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod glob;
pub mod locator;
pub mod quality;

pub use cache::*;
pub use fits::*;
pub use glob::*;
pub use locator::*;
pub use quality::*;
