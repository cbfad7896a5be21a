pub mod error;
pub mod ids;
pub mod model;
pub mod retention;
pub mod template;
pub mod time;
pub mod window;

pub use error::*;
pub use ids::*;
pub use model::*;
pub use retention::*;
pub use template::*;
pub use time::*;
pub use window::*;
