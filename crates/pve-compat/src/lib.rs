pub mod graph;
pub mod service;

pub use graph::RelationshipGraph;
pub use service::*;
