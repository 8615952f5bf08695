use http::Method;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment key that selects the active scenario identifier for a worker.
pub const SCENARIO_ENV_KEY: &str = "SCENARIO";

/// Which requests an iteration sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PlanKind {
    /// `GET /health`
    HealthCheck,
    /// List, create and status requests dispatched together.
    Workflow,
    /// `POST /api/items`
    CreateItem,
    /// Seven reads for every three writes.
    Mixed,
}

impl PlanKind {
    /// Plan implied by a well-known scenario identifier.
    pub fn for_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "smoke" => Some(PlanKind::HealthCheck),
            "load" | "stress" => Some(PlanKind::Workflow),
            "spike" => Some(PlanKind::CreateItem),
            "soak" => Some(PlanKind::Mixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sequential,
    /// Requests share no ordering dependency and go out concurrently.
    Batch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Metric name, e.g. `GET /api/items`.
    pub name: String,
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub expected_status: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestPlan {
    pub kind: PlanKind,
    pub dispatch: Dispatch,
    pub requests: Vec<RequestDescriptor>,
}

/// Run-level inputs of the plan builder.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub env: &'a HashMap<String, String>,
    pub default_scenario: &'a str,
    pub default_plan: PlanKind,
    /// Forces a plan regardless of the identifier.
    pub explicit_plan: Option<PlanKind>,
    pub bearer_token: Option<&'a str>,
}

/// Scenario identifier for a worker: its `SCENARIO` binding, or the run default.
pub fn identifier<'a>(env: &'a HashMap<String, String>, default_scenario: &'a str) -> &'a str {
    env.get(SCENARIO_ENV_KEY)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_scenario)
}

impl PlanContext<'_> {
    pub fn identifier(&self) -> &str {
        identifier(self.env, self.default_scenario)
    }

    pub fn resolve_kind(&self) -> PlanKind {
        self.explicit_plan
            .or_else(|| PlanKind::for_identifier(self.identifier()))
            .unwrap_or(self.default_plan)
    }
}

/// Build the request plan for one iteration.
pub fn build(ctx: &PlanContext<'_>, iteration: u64) -> RequestPlan {
    let kind = ctx.resolve_kind();
    let headers = request_headers(ctx.bearer_token);

    let (dispatch, requests) = match kind {
        PlanKind::HealthCheck => (Dispatch::Sequential, vec![get("/health", &headers)]),
        PlanKind::Workflow => (
            Dispatch::Batch,
            vec![
                get("/api/items", &headers),
                create_item(&headers),
                get("/api/status", &headers),
            ],
        ),
        PlanKind::CreateItem => (Dispatch::Sequential, vec![create_item(&headers)]),
        PlanKind::Mixed => {
            let request = if iteration % 10 < 7 {
                get("/api/items", &headers)
            } else {
                create_item(&headers)
            };
            (Dispatch::Sequential, vec![request])
        }
    };

    RequestPlan {
        kind,
        dispatch,
        requests,
    }
}

fn request_headers(bearer_token: Option<&str>) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    if let Some(token) = bearer_token {
        headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }
    headers
}

fn get(path: &str, headers: &[(String, String)]) -> RequestDescriptor {
    RequestDescriptor {
        name: format!("GET {}", path),
        method: Method::GET,
        path: path.to_string(),
        headers: headers.to_vec(),
        body: None,
        expected_status: 200,
    }
}

fn create_item(headers: &[(String, String)]) -> RequestDescriptor {
    let payload = serde_json::json!({
        "test": "data",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    RequestDescriptor {
        name: "POST /api/items".to_string(),
        method: Method::POST,
        path: "/api/items".to_string(),
        headers: headers.to_vec(),
        body: Some(payload.to_string()),
        expected_status: 201,
    }
}

/// Join a base URL and a request path without doubling the slash.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
