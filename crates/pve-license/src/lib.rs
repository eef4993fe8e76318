pub mod lookup;
pub mod service;

pub use lookup::*;
pub use service::*;
