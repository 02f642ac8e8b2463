//! Request routing: route definitions, compiled predicates, and the
//! first-match router behind an atomically swappable table.

pub mod route;
pub mod router;

pub use route::{
    FallbackConfig, FilterSpec, PathPredicate, PredicateDef, ResiliencePolicy, RewriteTemplate,
    Route, RouteDefinition,
};
pub use router::{RouteMatch, RouteTable, SharedRouteTable};
