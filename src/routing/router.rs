//! # Router Module
//!
//! Matches an inbound request against the route table in declared order,
//! first match wins. This is deliberately an ordered scan over compiled
//! predicates rather than a radix tree: operators reason about their table
//! top-to-bottom, and two requests with identical paths must always land on
//! the same route.
//!
//! The live table sits behind an atomically swappable reference. A reload
//! builds a complete new table and swaps it in one store; requests already
//! in flight keep the table they resolved at entry.

use axum::http::Method;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::error::GatewayResult;
use crate::observability::{EventBus, GatewayEvent};
use crate::routing::route::{Route, RouteDefinition};

/// Result of matching a request against the table
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The matched route
    pub route: Arc<Route>,

    /// Captures extracted by the predicate
    pub params: HashMap<String, String>,

    /// Path after applying the route's rewrite template
    pub rewritten_path: String,
}

/// Immutable, ordered route table
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile a table from definitions, validating each route and the
    /// uniqueness of route ids
    pub fn compile(definitions: &[RouteDefinition]) -> GatewayResult<Self> {
        let mut routes = Vec::with_capacity(definitions.len());
        let mut seen = std::collections::HashSet::new();

        for def in definitions {
            if !seen.insert(def.id.clone()) {
                return Err(crate::core::error::GatewayError::config(format!(
                    "duplicate route id: {}",
                    def.id
                )));
            }
            routes.push(Arc::new(Route::compile(def)?));
        }

        Ok(Self { routes })
    }

    /// Build a table from already-compiled routes (used by tests)
    pub fn from_routes(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Match a request path in declared order; first match wins
    pub fn match_request(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        for route in &self.routes {
            if !route.accepts_method(method) {
                continue;
            }
            if let Some(params) = route.predicate.capture(path) {
                let rewritten_path = match &route.rewrite {
                    Some(template) => template.apply(&params),
                    None => path.to_string(),
                };
                metrics::counter!("gateway_route_matches", "route" => route.id.clone())
                    .increment(1);
                return Some(RouteMatch {
                    route: Arc::clone(route),
                    params,
                    rewritten_path,
                });
            }
        }
        None
    }

    /// Number of routes in the table
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route ids in declared order
    pub fn route_ids(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.id.clone()).collect()
    }
}

/// Atomically swappable handle to the live route table
///
/// `load` clones the inner `Arc` under a read lock; `swap` replaces it under
/// a write lock. Both critical sections are a pointer copy, so readers never
/// contend meaningfully and never observe a partially updated table.
pub struct SharedRouteTable {
    slot: RwLock<Arc<RouteTable>>,
    events: EventBus,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable, events: EventBus) -> Self {
        Self {
            slot: RwLock::new(Arc::new(table)),
            events,
        }
    }

    /// Snapshot the current table; in-flight requests keep their snapshot
    pub fn load(&self) -> Arc<RouteTable> {
        self.slot.read().clone()
    }

    /// Replace the whole table in one store
    pub fn swap(&self, table: RouteTable) {
        let table = Arc::new(table);
        let routes = table.len();
        *self.slot.write() = table;
        info!(routes, "route table swapped");
        self.events
            .publish(GatewayEvent::RouteTableSwapped { routes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::route::PredicateDef;
    use std::time::Duration;

    fn def(id: &str, predicate: PredicateDef) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            predicate,
            rewrite: None,
            service: format!("{id}-service"),
            methods: Vec::new(),
            filters: Vec::new(),
            timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
            failure_status_min: 500,
            circuit_breaker: None,
            retry: None,
            rate_limit: None,
            fallback: None,
        }
    }

    #[test]
    fn test_first_match_wins_in_declared_order() {
        let table = RouteTable::compile(&[
            def("specific", PredicateDef::Prefix("/accounts/special".into())),
            def("general", PredicateDef::Prefix("/accounts".into())),
        ])
        .unwrap();

        let m = table
            .match_request(&Method::GET, "/accounts/special/1")
            .unwrap();
        assert_eq!(m.route.id, "specific");

        let m = table.match_request(&Method::GET, "/accounts/42").unwrap();
        assert_eq!(m.route.id, "general");
    }

    #[test]
    fn test_declaration_order_beats_specificity() {
        // Declared order is authoritative even when a later route is the
        // tighter match.
        let table = RouteTable::compile(&[
            def("general", PredicateDef::Prefix("/accounts".into())),
            def("specific", PredicateDef::Prefix("/accounts/special".into())),
        ])
        .unwrap();

        let m = table
            .match_request(&Method::GET, "/accounts/special/1")
            .unwrap();
        assert_eq!(m.route.id, "general");
    }

    #[test]
    fn test_identical_paths_always_match_same_route() {
        let table = RouteTable::compile(&[
            def("a", PredicateDef::Regex(r"^/items/(?P<id>\d+)$".into())),
            def("b", PredicateDef::Prefix("/items".into())),
        ])
        .unwrap();

        let first = table.match_request(&Method::GET, "/items/7").unwrap();
        for _ in 0..20 {
            let again = table.match_request(&Method::GET, "/items/7").unwrap();
            assert_eq!(again.route.id, first.route.id);
        }
    }

    #[test]
    fn test_no_match_returns_none() {
        let table =
            RouteTable::compile(&[def("accounts", PredicateDef::Prefix("/accounts".into()))])
                .unwrap();
        assert!(table.match_request(&Method::GET, "/unknown").is_none());
    }

    #[test]
    fn test_rewrite_applied_on_match() {
        let mut d = def("accounts", PredicateDef::Prefix("/accounts".into()));
        d.rewrite = Some("/{rest}".to_string());
        let table = RouteTable::compile(&[d]).unwrap();

        let m = table
            .match_request(&Method::GET, "/accounts/42/loans")
            .unwrap();
        assert_eq!(m.rewritten_path, "/42/loans");
    }

    #[test]
    fn test_method_restriction_skips_route() {
        let mut read_only = def("reads", PredicateDef::Prefix("/data".into()));
        read_only.methods = vec!["GET".into()];
        let writes = def("writes", PredicateDef::Prefix("/data".into()));
        let table = RouteTable::compile(&[read_only, writes]).unwrap();

        assert_eq!(
            table.match_request(&Method::GET, "/data/1").unwrap().route.id,
            "reads"
        );
        assert_eq!(
            table.match_request(&Method::POST, "/data/1").unwrap().route.id,
            "writes"
        );
    }

    #[test]
    fn test_duplicate_route_ids_rejected() {
        let err = RouteTable::compile(&[
            def("dup", PredicateDef::Prefix("/a".into())),
            def("dup", PredicateDef::Prefix("/b".into())),
        ])
        .unwrap_err();
        assert_eq!(err.error_type(), "configuration_error");
    }

    #[test]
    fn test_swap_replaces_table_atomically() {
        let shared = SharedRouteTable::new(
            RouteTable::compile(&[def("old", PredicateDef::Prefix("/old".into()))]).unwrap(),
            EventBus::default(),
        );

        // A reader that resolved before the swap keeps its snapshot.
        let before = shared.load();
        shared.swap(RouteTable::compile(&[def("new", PredicateDef::Prefix("/new".into()))]).unwrap());

        assert!(before.match_request(&Method::GET, "/old/1").is_some());
        let after = shared.load();
        assert!(after.match_request(&Method::GET, "/old/1").is_none());
        assert!(after.match_request(&Method::GET, "/new/1").is_some());
    }
}
