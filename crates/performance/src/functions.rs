//! Functions the model can call to drill into a trace.
//!
//! Bad references (unknown event keys, insight ids or URLs, bounds outside
//! the trace) are reported as [`FunctionOutcome::Error`] so the model can
//! correct itself.

use std::sync::Arc;

use async_trait::async_trait;
use devassist_core::error::FunctionError;
use devassist_core::function::{
    DeclaredFunction, DisplayInfo, FunctionOutcome, FunctionRegistry, ParameterSchema,
    canonical_call,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::call_tree::CallTree;
use crate::format;
use crate::resources::ResourceLoader;
use crate::trace::{Bounds, TraceModel};

/// Declare every trace function against `model`.
pub fn declare_all(
    registry: &mut FunctionRegistry,
    model: &Arc<TraceModel>,
    loader: &Arc<dyn ResourceLoader>,
) -> Result<(), FunctionError> {
    registry.declare(Arc::new(MainThreadTrackSummary::new(model.clone())))?;
    registry.declare(Arc::new(NetworkTrackSummary::new(model.clone())))?;
    registry.declare(Arc::new(DetailedCallTree::new(model.clone())))?;
    registry.declare(Arc::new(EventByKey::new(model.clone())))?;
    if !model.insights.is_empty() {
        registry.declare(Arc::new(InsightDetails::new(model.clone())))?;
    }
    registry.declare(Arc::new(ResourceContent::new(loader.clone())))?;
    Ok(())
}

fn str_arg<'a>(args: &'a serde_json::Value, name: &str) -> Result<&'a str, FunctionOutcome> {
    args.get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FunctionOutcome::Error(format!("Missing required argument '{name}'")))
}

/// Read `{min, max}` and check it lies within the trace.
fn bounds_arg(args: &serde_json::Value, model: &TraceModel) -> Result<Bounds, FunctionOutcome> {
    let read = |name: &str| {
        args.get(name)
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)))
            .ok_or_else(|| FunctionOutcome::Error(format!("Missing or invalid argument '{name}'")))
    };
    let bounds = Bounds::new(read("min")?, read("max")?);
    if bounds.min > bounds.max || !model.bounds.contains(&bounds) {
        return Err(FunctionOutcome::Error(format!(
            "Invalid bounds {{min: {}, max: {}}}; they must lie within the trace bounds {{min: {}, max: {}}}",
            bounds.min, bounds.max, model.bounds.min, model.bounds.max
        )));
    }
    Ok(bounds)
}

fn bounds_schema() -> ParameterSchema {
    ParameterSchema::object()
        .property(
            "min",
            ParameterSchema::integer("Start of the range, in microseconds"),
            true,
        )
        .property(
            "max",
            ParameterSchema::integer("End of the range, in microseconds"),
            true,
        )
}

fn outcome<T>(result: Result<T, FunctionOutcome>, render: impl FnOnce(T) -> String) -> FunctionOutcome {
    match result {
        Ok(value) => FunctionOutcome::Result(render(value)),
        Err(error) => error,
    }
}

macro_rules! trace_function {
    ($name:ident) => {
        pub struct $name {
            model: Arc<TraceModel>,
        }

        impl $name {
            pub fn new(model: Arc<TraceModel>) -> Self {
                Self { model }
            }
        }
    };
}

trace_function!(MainThreadTrackSummary);
trace_function!(NetworkTrackSummary);
trace_function!(DetailedCallTree);
trace_function!(EventByKey);
trace_function!(InsightDetails);

#[async_trait]
impl DeclaredFunction for MainThreadTrackSummary {
    fn name(&self) -> &str {
        "getMainThreadTrackSummary"
    }

    fn description(&self) -> &str {
        "Returns a bottom-up summary of main-thread activity (self time grouped by function) within the given bounds."
    }

    fn parameters(&self) -> ParameterSchema {
        bounds_schema()
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: "Looking at main thread activity".into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        Ok(outcome(bounds_arg(&args, &self.model), |bounds| {
            format::main_thread_summary(&self.model, &bounds)
        }))
    }
}

#[async_trait]
impl DeclaredFunction for NetworkTrackSummary {
    fn name(&self) -> &str {
        "getNetworkTrackSummary"
    }

    fn description(&self) -> &str {
        "Returns the network requests that were active within the given bounds."
    }

    fn parameters(&self) -> ParameterSchema {
        bounds_schema()
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: "Looking at network activity".into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        Ok(outcome(bounds_arg(&args, &self.model), |bounds| {
            format::network_summary(&self.model, &bounds)
        }))
    }
}

#[async_trait]
impl DeclaredFunction for DetailedCallTree {
    fn name(&self) -> &str {
        "getDetailedCallTree"
    }

    fn description(&self) -> &str {
        "Returns the detailed call tree below a main-thread event."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::object().property(
            "eventKey",
            ParameterSchema::string("Key of a main-thread event, e.g. e-12"),
            true,
        )
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: "Looking at call tree".into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        let key = match str_arg(&args, "eventKey") {
            Ok(key) => key,
            Err(error) => return Ok(error),
        };
        Ok(match CallTree::build(&self.model, key) {
            Some(tree) => FunctionOutcome::Result(tree.serialize()),
            None if self.model.event(key).is_some() => FunctionOutcome::Error(format!(
                "Event {key} is not main-thread work and has no call tree"
            )),
            None => FunctionOutcome::Error(format!("No event with key {key}")),
        })
    }
}

#[async_trait]
impl DeclaredFunction for EventByKey {
    fn name(&self) -> &str {
        "getEventByKey"
    }

    fn description(&self) -> &str {
        "Returns detailed information about a single trace event or network request."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::object().property(
            "eventKey",
            ParameterSchema::string("Key of the event, e.g. e-12 or r-3"),
            true,
        )
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        let title = match args.get("eventKey").and_then(|v| v.as_str()) {
            Some(key) if key.starts_with("r-") => "Investigating network request",
            _ => "Looking at trace event",
        };
        DisplayInfo {
            title: title.into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        let key = match str_arg(&args, "eventKey") {
            Ok(key) => key,
            Err(error) => return Ok(error),
        };
        Ok(match self.model.event(key) {
            Some(event) => FunctionOutcome::Result(format::event_details(&self.model, event)),
            None => FunctionOutcome::Error(format!("No event with key {key}")),
        })
    }
}

#[async_trait]
impl DeclaredFunction for InsightDetails {
    fn name(&self) -> &str {
        "getInsightDetails"
    }

    fn description(&self) -> &str {
        "Returns the details of a performance insight found in the trace."
    }

    fn parameters(&self) -> ParameterSchema {
        let ids: Vec<&str> = self.model.insights.iter().map(|i| i.id.as_str()).collect();
        ParameterSchema::object().property(
            "insightId",
            ParameterSchema::string(&format!("One of: {}", ids.join(", "))),
            true,
        )
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: "Investigating insight".into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        let id = match str_arg(&args, "insightId") {
            Ok(id) => id,
            Err(error) => return Ok(error),
        };
        Ok(match self.model.insight(id) {
            Some(insight) => FunctionOutcome::Result(format::insight_details(&self.model, insight)),
            None => FunctionOutcome::Error(format!("No insight with id {id}")),
        })
    }
}

/// Fetches the source of a resource through the host's loader.
pub struct ResourceContent {
    loader: Arc<dyn ResourceLoader>,
}

impl ResourceContent {
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl DeclaredFunction for ResourceContent {
    fn name(&self) -> &str {
        "getResourceContent"
    }

    fn description(&self) -> &str {
        "Returns the content of a resource (script, stylesheet, document) loaded by the page."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::object().property(
            "url",
            ParameterSchema::string("The exact URL of the resource"),
            true,
        )
    }

    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: "Looking at resource content".into(),
            action: canonical_call(self.name(), args),
        }
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        let url = match str_arg(&args, "url") {
            Ok(url) => url,
            Err(error) => return Ok(error),
        };
        debug!(url, "Loading resource content");
        Ok(match self.loader.load(url, cancel).await? {
            Some(content) => FunctionOutcome::Result(content),
            None => FunctionOutcome::Error(format!("No resource found for URL {url}")),
        })
    }
}
