//! Declarative scenario descriptors
//!
//! These types mirror the scenario document a user writes:
//!
//! ```json
//! { "flow": [
//!     { "get": { "uri": "/{{ $loopElement.path }}", "beforeRequest": "sign" } },
//!     { "loop": [ { "post": { "url": "/items", "json": { "id": "{{ $loopCount }}" } } } ],
//!       "count": 3 },
//!     { "function": "cleanup" }
//! ] }
//! ```
//!
//! They are plain data. [`crate::compiler`] turns them into executable steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::executor::Method;

/// A scenario: one virtual user's ordered flow of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub flow: Vec<StepSpec>,
}

impl ScenarioSpec {
    pub fn new(flow: Vec<StepSpec>) -> Self {
        Self { name: None, flow }
    }

    pub fn from_json(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// One step of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Loop(LoopSpec),
    Function(FunctionSpec),
    Think(ThinkSpec),
    Log(LogSpec),
    Request(RequestStepSpec),
}

impl StepSpec {
    pub fn request(method: Method, request: RequestSpec) -> Self {
        StepSpec::Request(RequestStepSpec { method, request })
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::request(Method::Get, RequestSpec::new(uri))
    }

    pub fn loop_over(over: OverSpec, body: Vec<StepSpec>) -> Self {
        StepSpec::Loop(LoopSpec {
            body,
            over: Some(over),
            count: None,
        })
    }

    pub fn loop_count(count: u64, body: Vec<StepSpec>) -> Self {
        StepSpec::Loop(LoopSpec {
            body,
            over: None,
            count: Some(count),
        })
    }

    pub fn function(name: impl Into<String>) -> Self {
        StepSpec::Function(FunctionSpec {
            function: name.into(),
        })
    }

    pub fn think(seconds: f64) -> Self {
        StepSpec::Think(ThinkSpec { think: seconds })
    }

    pub fn log(message: impl Into<String>) -> Self {
        StepSpec::Log(LogSpec {
            log: message.into(),
        })
    }
}

/// `{ "loop": [...], "over": [...] | "{{ expr }}", "count": n }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    #[serde(rename = "loop")]
    pub body: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<OverSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// The collection a loop iterates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverSpec {
    /// Literal elements, bound as-is
    Items(Vec<Value>),
    /// A template that must resolve to an array when the loop is entered
    Expression(String),
}

/// `{ "function": "name" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSpec {
    pub function: String,
}

/// `{ "think": seconds }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkSpec {
    pub think: f64,
}

/// `{ "log": "template" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSpec {
    pub log: String,
}

/// `{ "<method>": { ...request } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<Method, RequestSpec>",
    into = "BTreeMap<Method, RequestSpec>"
)]
pub struct RequestStepSpec {
    pub method: Method,
    pub request: RequestSpec,
}

impl TryFrom<BTreeMap<Method, RequestSpec>> for RequestStepSpec {
    type Error = String;

    fn try_from(map: BTreeMap<Method, RequestSpec>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "a request step takes exactly one method, found {}",
                map.len()
            ));
        }
        let (method, request) = map
            .into_iter()
            .next()
            .ok_or_else(|| "empty request step".to_string())?;
        Ok(RequestStepSpec { method, request })
    }
}

impl From<RequestStepSpec> for BTreeMap<Method, RequestSpec> {
    fn from(step: RequestStepSpec) -> Self {
        BTreeMap::from([(step.method, step.request)])
    }
}

/// Request parameters; every string may contain templates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestSpec {
    #[serde(alias = "url")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_request: Option<HookNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_response: Option<HookNames>,
}

impl RequestSpec {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn before_request(mut self, names: impl Into<HookNames>) -> Self {
        self.before_request = Some(names.into());
        self
    }

    pub fn after_response(mut self, names: impl Into<HookNames>) -> Self {
        self.after_response = Some(names.into());
        self
    }
}

/// One hook name or a list, each possibly a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookNames {
    One(String),
    Many(Vec<String>),
}

impl HookNames {
    pub fn as_slice(&self) -> &[String] {
        match self {
            HookNames::One(name) => std::slice::from_ref(name),
            HookNames::Many(names) => names,
        }
    }
}

impl From<&str> for HookNames {
    fn from(name: &str) -> Self {
        HookNames::One(name.to_string())
    }
}

impl From<String> for HookNames {
    fn from(name: String) -> Self {
        HookNames::One(name)
    }
}

impl From<Vec<&str>> for HookNames {
    fn from(names: Vec<&str>) -> Self {
        HookNames::Many(names.into_iter().map(String::from).collect())
    }
}
