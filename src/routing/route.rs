//! # Route Definitions
//!
//! The serde-level `RouteDefinition` is what operators write in the config
//! file; `Route::compile` turns it into the immutable, validated form the
//! router matches against: a compiled predicate, a parsed rewrite template,
//! the filter chain, and the route's resilience policy with defaults filled
//! in.
//!
//! Filters are an ordered list of tagged variants interpreted by a small
//! dispatch table in the pipeline; adding a filter kind means one new
//! variant and one new match arm.

use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};

/// Path predicate as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateDef {
    /// Prefix match; the residual path is exposed as the `rest` capture
    Prefix(String),
    /// Full-path regex with named capture groups
    Regex(String),
}

/// Filter applied around the upstream dispatch, in declared order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Inject a correlation identifier header when the caller sent none
    CorrelationId {
        #[serde(default = "default_correlation_header")]
        header: String,
    },
    /// Set a static header on the upstream request
    RequestHeader { name: String, value: String },
    /// Set a static header on the client response
    ResponseHeader { name: String, value: String },
    /// Annotate the response with total processing time
    ResponseTiming {
        #[serde(default = "default_timing_header")]
        header: String,
    },
}

fn default_correlation_header() -> String {
    "x-correlation-id".to_string()
}

fn default_timing_header() -> String {
    "x-processing-time-ms".to_string()
}

/// Degraded-but-valid response returned when the primary path fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_status")]
    pub status: u16,

    #[serde(default = "default_fallback_content_type")]
    pub content_type: String,

    pub body: String,
}

fn default_fallback_status() -> u16 {
    200
}

fn default_fallback_content_type() -> String {
    "application/json".to_string()
}

/// One route as written in configuration; immutable once loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Unique route identifier; also names the breaker and limiter
    pub id: String,

    /// Path predicate, tried in declared order across the table
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub predicate: PredicateDef,

    /// Rewrite template with `{name}` placeholders; absent means pass-through
    #[serde(default)]
    pub rewrite: Option<String>,

    /// Logical name of the target service
    pub service: String,

    /// HTTP methods this route accepts; empty means all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Filter chain, applied in declared order
    #[serde(default)]
    pub filters: Vec<FilterSpec>,

    /// Request deadline for this route
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,

    /// Upper bound for one dispatch attempt
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,

    /// Smallest upstream status recorded as a breaker failure
    #[serde(default = "default_failure_status_min")]
    pub failure_status_min: u16,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_failure_status_min() -> u16 {
    500
}

/// Resolved resilience parameters after defaults are applied
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitConfig>,
    pub timeout: Duration,
    pub attempt_timeout: Duration,
    pub failure_status_min: u16,
}

/// Compiled path predicate
#[derive(Debug, Clone)]
pub enum PathPredicate {
    Prefix(String),
    Pattern(Regex),
}

impl PathPredicate {
    /// Match a path, returning its captures on success
    ///
    /// Prefix predicates respect segment boundaries: `/accounts` matches
    /// `/accounts` and `/accounts/42` but never `/accountsx`.
    pub fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        match self {
            PathPredicate::Prefix(prefix) => {
                let rest = path.strip_prefix(prefix.as_str())?;
                if !(prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/')) {
                    return None;
                }
                let mut params = HashMap::new();
                params.insert("rest".to_string(), rest.trim_start_matches('/').to_string());
                Some(params)
            }
            PathPredicate::Pattern(pattern) => {
                let captures = pattern.captures(path)?;
                let full = captures.get(0)?;
                if full.start() != 0 || full.end() != path.len() {
                    return None;
                }
                let mut params = HashMap::new();
                for name in pattern.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        params.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                Some(params)
            }
        }
    }

    /// Capture names this predicate can produce
    fn capture_names(&self) -> HashSet<String> {
        match self {
            PathPredicate::Prefix(_) => std::iter::once("rest".to_string()).collect(),
            PathPredicate::Pattern(pattern) => pattern
                .capture_names()
                .flatten()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Parsed rewrite template
#[derive(Debug, Clone)]
pub struct RewriteTemplate {
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone)]
enum TemplatePart {
    Literal(String),
    Param(String),
}

impl RewriteTemplate {
    /// Parse a `{name}` template, validating placeholders against the
    /// predicate's capture names
    pub fn parse(template: &str, available: &HashSet<String>) -> GatewayResult<Self> {
        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let close = rest[open..].find('}').ok_or_else(|| {
                GatewayError::config(format!("unclosed placeholder in rewrite template: {template}"))
            })? + open;

            if open > 0 {
                parts.push(TemplatePart::Literal(rest[..open].to_string()));
            }
            let name = &rest[open + 1..close];
            if name.is_empty() {
                return Err(GatewayError::config(format!(
                    "empty placeholder in rewrite template: {template}"
                )));
            }
            if !available.contains(name) {
                return Err(GatewayError::config(format!(
                    "rewrite template references unknown capture '{name}': {template}"
                )));
            }
            parts.push(TemplatePart::Param(name.to_string()));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Substitute captured values into the template
    pub fn apply(&self, params: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Param(name) => {
                    if let Some(value) = params.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

/// Compiled, immutable route
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub predicate: PathPredicate,
    pub rewrite: Option<RewriteTemplate>,
    pub service: String,
    pub methods: Vec<Method>,
    pub filters: Vec<FilterSpec>,
    pub policy: ResiliencePolicy,
    pub fallback: Option<FallbackConfig>,
}

impl Route {
    /// Compile and validate one definition
    pub fn compile(def: &RouteDefinition) -> GatewayResult<Self> {
        if def.id.is_empty() {
            return Err(GatewayError::config("route id must not be empty"));
        }
        if def.service.is_empty() {
            return Err(GatewayError::config(format!(
                "route {} has an empty target service",
                def.id
            )));
        }

        let predicate = match &def.predicate {
            PredicateDef::Prefix(prefix) => {
                if !prefix.starts_with('/') {
                    return Err(GatewayError::config(format!(
                        "route {}: prefix must start with '/': {prefix}",
                        def.id
                    )));
                }
                PathPredicate::Prefix(prefix.clone())
            }
            PredicateDef::Regex(pattern) => PathPredicate::Pattern(Regex::new(pattern).map_err(
                |e| GatewayError::config(format!("route {}: invalid regex: {e}", def.id)),
            )?),
        };

        let rewrite = def
            .rewrite
            .as_deref()
            .map(|template| RewriteTemplate::parse(template, &predicate.capture_names()))
            .transpose()
            .map_err(|e| GatewayError::config(format!("route {}: {e}", def.id)))?;

        let methods = def
            .methods
            .iter()
            .map(|m| {
                m.parse::<Method>()
                    .map_err(|_| GatewayError::config(format!("route {}: invalid method {m}", def.id)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            id: def.id.clone(),
            predicate,
            rewrite,
            service: def.service.clone(),
            methods,
            filters: def.filters.clone(),
            policy: ResiliencePolicy {
                circuit_breaker: def.circuit_breaker.clone().unwrap_or_default(),
                retry: def.retry.clone().unwrap_or_default(),
                rate_limit: def.rate_limit.clone(),
                timeout: def.timeout,
                attempt_timeout: def.attempt_timeout,
                failure_status_min: def.failure_status_min,
            },
            fallback: def.fallback.clone(),
        })
    }

    /// Check if this route accepts the method
    pub fn accepts_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}
