//! Transfer planning: route graph, transformation algebra, and the planner
//! that turns discovered files into tasks.

pub mod graph;
pub mod route;
pub mod templating;
pub mod transform;
pub mod transformers;
pub mod vault;

pub use graph::{O1, ON, ON2, PolynomialCost, RouteError, RouteGraph, RouteHop};
pub use route::{RouteTransformer, TransferRoute, posix_to_irods, posix_to_irods_factory};
pub use transform::{IoStream, IoTransformer, ScriptTransformer};
