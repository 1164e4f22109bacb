use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

pub mod builtins;
pub use builtins::{CalculatorTool, CurrentTimeTool, SearchTool};

/// Argument map passed to every tool invocation.
pub type JsonMap = serde_json::Map<String, Value>;

// ── Tool trait and parameter model ───────────────────────────────────────────

/// JSON-schema type of a single tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParam {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Static metadata about a tool, used by the model to decide what to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// Trait implemented by every invocable tool.
///
/// `run` returns the textual output fed back to the model; errors are
/// converted to textual failures at the registry boundary so the model can
/// see and react to them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &JsonMap) -> Result<String>;
}

/// A tool whose public contract is the flat list of child tools it publishes
/// at registration time.  The expandable object itself is never invocable.
pub trait ExpandableTool: Send + Sync {
    fn expand(&self) -> Vec<Arc<dyn Tool>>;
}

/// A plain function registered as a tool.  Equivalent to a tool with a
/// single required `input: string` parameter.
pub type ToolFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

struct RegisteredFn {
    description: String,
    func: ToolFn,
}

/// Either kind of registry entry.
#[derive(Clone)]
pub enum Registered {
    Tool(Arc<dyn Tool>),
    Function(ToolFn),
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Central registry for tools and function-valued tools.
///
/// Registration with a duplicate name overwrites the previous entry (in
/// either map) and emits a warning.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    functions: HashMap<String, RegisteredFn>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        if self.tools.contains_key(&name) || self.functions.remove(&name).is_some() {
            warn!(tool = %name, "overwriting previously registered tool");
        }
        self.tools.insert(name, tool);
    }

    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        func: ToolFn,
    ) {
        let name = name.into();
        if self.functions.contains_key(&name) || self.tools.remove(&name).is_some() {
            warn!(tool = %name, "overwriting previously registered tool");
        }
        self.functions.insert(
            name,
            RegisteredFn {
                description: description.into(),
                func,
            },
        );
    }

    /// Register every child of an expandable tool.  The parent publishes N
    /// actions as N independent tools and is itself never invocable.
    pub fn register_expandable(&mut self, expandable: &dyn ExpandableTool) {
        for child in expandable.expand() {
            self.register(child);
        }
    }

    pub fn get(&self, name: &str) -> Option<Registered> {
        if let Some(tool) = self.tools.get(name) {
            return Some(Registered::Tool(Arc::clone(tool)));
        }
        self.functions
            .get(name)
            .map(|f| Registered::Function(Arc::clone(&f.func)))
    }

    /// Union of registered names, sorted for stable prompt output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .keys()
            .chain(self.functions.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.functions.is_empty()
    }

    /// Multi-line natural-language summary for text-protocol system prompts.
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        for spec in &specs {
            let params: Vec<String> = spec
                .params
                .iter()
                .map(|p| {
                    format!(
                        "{}: {} ({}, {})",
                        p.name,
                        p.description,
                        p.kind.as_str(),
                        if p.required { "required" } else { "optional" }
                    )
                })
                .collect();
            lines.push(format!(
                "- {}: {}\n  params: {}",
                spec.name,
                spec.description,
                if params.is_empty() {
                    "(none)".to_string()
                } else {
                    params.join(", ")
                }
            ));
        }
        let mut fn_names: Vec<&String> = self.functions.keys().collect();
        fn_names.sort();
        for name in fn_names {
            let entry = &self.functions[name];
            lines.push(format!(
                "- {}: {}\n  params: input: free-form text (string, required)",
                name, entry.description
            ));
        }
        lines.join("\n")
    }

    /// Function-calling schemas in the OpenAI-compatible format.
    pub fn schemas(&self) -> Vec<Value> {
        let mut out = Vec::new();
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        for spec in specs {
            out.push(spec_to_schema(&spec));
        }
        let mut fn_names: Vec<&String> = self.functions.keys().collect();
        fn_names.sort();
        for name in fn_names {
            let entry = &self.functions[name];
            out.push(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": entry.description,
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "input": { "type": "string", "description": "Free-form input text" }
                        },
                        "required": ["input"]
                    }
                }
            }));
        }
        out
    }

    /// Dispatch by name.  Every failure (unknown name included) comes back
    /// as a textual error rather than propagating, so the model can recover.
    pub async fn execute(&self, name: &str, args: &JsonMap) -> String {
        match self.get(name) {
            Some(Registered::Tool(tool)) => match tool.run(args).await {
                Ok(output) => output,
                Err(err) => format!("tool '{name}' failed: {err}"),
            },
            Some(Registered::Function(func)) => {
                let input = args
                    .get("input")
                    .map(value_to_text)
                    .or_else(|| args.values().next().map(value_to_text))
                    .unwrap_or_default();
                func(&input)
            }
            None => format!("unknown tool: {name}"),
        }
    }
}

/// Render one spec as an OpenAI function-calling schema.  Array parameters
/// default `items.type = "string"`; declared defaults are surfaced in the
/// description since the wire format has no default slot.
pub fn spec_to_schema(spec: &ToolSpec) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &spec.params {
        let mut description = param.description.clone();
        if let Some(ref default) = param.default {
            description.push_str(&format!(" (default: {default})"));
        }
        let mut prop = json!({
            "type": param.kind.as_str(),
            "description": description,
        });
        if param.kind == ParamKind::Array {
            prop["items"] = json!({ "type": "string" });
        }
        properties.insert(param.name.clone(), prop);
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }

    let mut parameters = json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        parameters["required"] = Value::Array(required);
    }

    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": parameters,
        }
    })
}

/// Coerce an argument value to the text a tool body expects.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
