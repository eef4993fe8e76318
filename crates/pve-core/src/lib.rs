pub mod aggregate;
pub mod backoff;
pub mod ids;
pub mod model;
pub mod snapshot;
pub mod time;
pub mod types;

pub use aggregate::*;
pub use backoff::*;
pub use ids::*;
pub use model::*;
pub use snapshot::*;
pub use time::*;
pub use types::*;
