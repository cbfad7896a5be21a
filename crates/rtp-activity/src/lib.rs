pub mod record;
pub mod recorder;
pub mod store;
pub mod version;

pub use record::*;
pub use recorder::*;
pub use store::*;
pub use version::*;
