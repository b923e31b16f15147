//! Step registry - declarative registration with dependency ordering
//!
//! Steps are declared once at startup as [`StepDefinition`] values and
//! collected into a [`StepRegistry`]. Drivers select steps by name and trust
//! the registry to order them; `depends_on` is used only for ordering within
//! the requested set, never to pull in unrequested steps.
//!
//! The registry is built explicitly by the embedding application (there are
//! no import side effects to rely on) and is read-only afterwards, so shared
//! reads need no locking.

use crate::state::PipelineState;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Future returned by a step handler.
///
/// `Ok(None)` means the step produced no state change; the engine keeps the
/// prior state and logs a warning.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<Option<PipelineState>>> + Send>>;

/// Boxed step handler: `(state, params) -> new state`
pub type StepFn = Arc<dyn Fn(PipelineState, Value) -> StepFuture + Send + Sync>;

/// Coarse grouping of steps for introspection and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    #[default]
    Setup,
    Preprocessing,
    Rendering,
    Creative,
}

/// Rough cost class used for replay time estimates and driver hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    #[default]
    Free,
    Cpu,
    Gpu,
    Llm,
}

/// External tool schema carried by steps that are callable from an agent
/// driver. `input` maps parameter names to JSON-schema property objects.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolSchema {
    pub description: String,
    #[serde(default)]
    pub input: Map<String, Value>,
}

/// Metadata and handler for one registered step
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,
    /// Step body: `(state, params) -> state`
    pub handler: StepFn,
    /// Human description
    pub description: String,
    pub category: StepCategory,
    /// Step names this step is ordered after (never auto-included)
    pub depends_on: Vec<String>,
    /// State fields this step produces (drives async-output merging)
    pub produces: Vec<String>,
    /// Terminal failure marks the step skipped instead of failing the job
    pub optional: bool,
    pub estimated_duration_s: u64,
    pub cost_category: CostCategory,
    /// Whether transient failures are retried
    pub retryable: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Per-attempt timeout
    pub timeout_s: u64,
    /// Schema for external function-calling drivers
    pub tool_schema: Option<ToolSchema>,
    /// Externally-visible name used in event emission
    pub sse_step_name: Option<String>,
    /// Fire in the background; the main sequence continues immediately
    pub async_mode: bool,
    /// Async steps whose results must be merged in before this step runs
    pub await_async: Vec<String>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("depends_on", &self.depends_on)
            .field("produces", &self.produces)
            .field("optional", &self.optional)
            .field("retryable", &self.retryable)
            .field("max_retries", &self.max_retries)
            .field("timeout_s", &self.timeout_s)
            .field("async_mode", &self.async_mode)
            .field("await_async", &self.await_async)
            .finish()
    }
}

impl StepDefinition {
    /// Create a definition with defaults matching a cheap, retryable,
    /// synchronous step (2 retries, 300 s timeout).
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(PipelineState, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<PipelineState>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |state, params| -> StepFuture {
                Box::pin(handler(state, params))
            }),
            description: String::new(),
            category: StepCategory::default(),
            depends_on: Vec::new(),
            produces: Vec::new(),
            optional: false,
            estimated_duration_s: 10,
            cost_category: CostCategory::default(),
            retryable: true,
            max_retries: 2,
            timeout_s: 300,
            tool_schema: None,
            sse_step_name: None,
            async_mode: false,
            await_async: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: StepCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_produces<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_estimated_duration(mut self, seconds: u64) -> Self {
        self.estimated_duration_s = seconds;
        self
    }

    pub fn with_cost_category(mut self, cost: CostCategory) -> Self {
        self.cost_category = cost;
        self
    }

    pub fn with_retries(mut self, retryable: bool, max_retries: u32) -> Self {
        self.retryable = retryable;
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_s = seconds;
        self
    }

    pub fn with_tool_schema(mut self, schema: ToolSchema) -> Self {
        self.tool_schema = Some(schema);
        self
    }

    pub fn with_sse_name(mut self, name: impl Into<String>) -> Self {
        self.sse_step_name = Some(name.into());
        self
    }

    pub fn async_mode(mut self) -> Self {
        self.async_mode = true;
        self
    }

    pub fn with_await_async<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.await_async = steps.into_iter().map(Into::into).collect();
        self
    }

    /// Event name for this step: explicit SSE name or the uppercased step name
    pub fn event_name(&self) -> String {
        self.sse_step_name
            .clone()
            .unwrap_or_else(|| self.name.to_uppercase())
    }
}

/// Registry of step definitions, read-only after initialization.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<StepDefinition>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a definition by name. Duplicate names overwrite with a warning.
    pub fn register(&mut self, definition: StepDefinition) {
        let name = definition.name.clone();
        if self.steps.insert(name.clone(), Arc::new(definition)).is_some() {
            warn!(step = %name, "Step re-registered, overwriting previous definition");
        } else {
            debug!(step = %name, "Step registered");
        }
    }

    /// Look up a step by name
    pub fn get(&self, name: &str) -> Option<Arc<StepDefinition>> {
        self.steps.get(name).cloned()
    }

    /// All registered definitions
    pub fn all(&self) -> Vec<Arc<StepDefinition>> {
        self.steps.values().cloned().collect()
    }

    /// All registered step names
    pub fn names(&self) -> Vec<String> {
        self.steps.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve execution order for the requested steps (Kahn's algorithm).
    ///
    /// Only requested steps are included; `depends_on` orders but never adds.
    /// Ties are broken by position in the requested list, so the result is
    /// deterministic. Unregistered names are dropped with a warning. On a
    /// dependency cycle the requested list (filtered to registered names) is
    /// returned unchanged.
    pub fn resolve_order(&self, requested: &[String]) -> Vec<String> {
        let valid: Vec<String> = requested
            .iter()
            .filter(|name| {
                let known = self.steps.contains_key(*name);
                if !known {
                    warn!(step = %name, "Requested step is not registered, ignoring");
                }
                known
            })
            .cloned()
            .collect();

        let position = |name: &str| {
            requested
                .iter()
                .position(|r| r == name)
                .unwrap_or(usize::MAX)
        };

        let mut in_degree: HashMap<&str, usize> =
            valid.iter().map(|n| (n.as_str(), 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in &valid {
            let def = &self.steps[name];
            for dep in &def.depends_on {
                if in_degree.contains_key(dep.as_str()) {
                    edges.entry(dep.as_str()).or_default().push(name.as_str());
                    *in_degree.get_mut(name.as_str()).unwrap() += 1;
                }
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut result = Vec::with_capacity(valid.len());
        while !queue.is_empty() {
            queue.sort_by_key(|n| position(n));
            let node = queue.remove(0);
            result.push(node.to_string());

            if let Some(next) = edges.get(node) {
                for neighbor in next {
                    let degree = in_degree.get_mut(neighbor).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(neighbor);
                    }
                }
            }
        }

        if result.len() != valid.len() {
            let missing: Vec<&String> =
                valid.iter().filter(|n| !result.contains(*n)).collect();
            error!(
                steps = ?missing,
                "Dependency cycle detected, falling back to requested order"
            );
            return valid;
        }

        result
    }

    /// Project the steps carrying a tool schema into generic
    /// function-calling tool definitions for external agent drivers.
    pub fn export_tools(&self) -> Vec<Value> {
        self.steps
            .values()
            .filter_map(|def| {
                let schema = def.tool_schema.as_ref()?;
                let description = if schema.description.is_empty() {
                    def.description.clone()
                } else {
                    schema.description.clone()
                };
                Some(json!({
                    "type": "function",
                    "function": {
                        "name": def.name,
                        "description": description,
                        "parameters": {
                            "type": "object",
                            "properties": schema.input,
                            "required": [],
                        }
                    }
                }))
            })
            .collect()
    }
}
