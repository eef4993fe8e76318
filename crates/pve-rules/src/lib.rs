pub mod parse;
pub mod rule;
pub mod types;

pub use parse::*;
pub use rule::*;
pub use types::*;
