use std::time::Duration;

use serde_json::Value;

/// What the worker observed for one request: the input of every check.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDescriptor {
    /// HTTP status, or 0 when the request never produced a response.
    pub status: u16,
    pub latency: Duration,
    pub body: Option<String>,
}

impl ResponseDescriptor {
    /// Descriptor for a request that failed before a response arrived.
    pub fn failed(latency: Duration) -> Self {
        Self {
            status: 0,
            latency,
            body: None,
        }
    }

    fn json(&self) -> Option<Value> {
        self.body.as_deref().and_then(|b| serde_json::from_str(b).ok())
    }
}

/// A single assertion against a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    StatusEquals(u16),
    LatencyBelow(Duration),
    /// `field` is a dotted path into the JSON body (`data.success`).
    BodyFieldEquals { field: String, expected: Value },
}

impl Predicate {
    pub fn holds(&self, response: &ResponseDescriptor) -> bool {
        match self {
            Predicate::StatusEquals(code) => response.status == *code,
            Predicate::LatencyBelow(bound) => response.status != 0 && response.latency < *bound,
            Predicate::BodyFieldEquals { field, expected } => response
                .json()
                .as_ref()
                .and_then(|body| lookup(body, field))
                .is_some_and(|actual| actual == expected),
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub name: String,
    pub predicate: Predicate,
}

impl CheckSpec {
    pub fn new(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

/// Named outcomes for one response, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub outcomes: Vec<(String, bool)>,
}

/// Evaluate every check against a response. Never fails: a predicate that
/// cannot be evaluated counts as not passing.
pub fn evaluate(checks: &[CheckSpec], response: &ResponseDescriptor) -> CheckResult {
    CheckResult {
        outcomes: checks
            .iter()
            .map(|c| (c.name.clone(), c.predicate.holds(response)))
            .collect(),
    }
}

/// The checks every request gets: expected status and the latency budget.
pub fn default_checks(expected_status: u16, latency_budget: Duration) -> Vec<CheckSpec> {
    vec![
        CheckSpec::new(
            format!("status is {}", expected_status),
            Predicate::StatusEquals(expected_status),
        ),
        CheckSpec::new("response time OK", Predicate::LatencyBelow(latency_budget)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_passed(result: CheckResult) -> bool {
        result.outcomes.iter().all(|(_, ok)| *ok)
    }

    fn ok_response(body: &str) -> ResponseDescriptor {
        ResponseDescriptor {
            status: 200,
            latency: Duration::from_millis(40),
            body: Some(body.to_string()),
        }
    }

    #[test]
    fn test_status_and_latency() {
        let checks = default_checks(200, Duration::from_millis(200));
        let result = evaluate(&checks, &ok_response("{}"));
        assert_eq!(
            result.outcomes,
            vec![
                ("status is 200".to_string(), true),
                ("response time OK".to_string(), true)
            ]
        );

        let slow = ResponseDescriptor {
            status: 201,
            latency: Duration::from_millis(250),
            body: None,
        };
        let result = evaluate(&checks, &slow);
        assert!(result.outcomes.iter().all(|(_, ok)| !ok));
    }

    #[test]
    fn test_body_field_equality() {
        let check = CheckSpec::new(
            "response includes success",
            Predicate::BodyFieldEquals {
                field: "success".to_string(),
                expected: json!(true),
            },
        );
        assert!(all_passed(evaluate(&[check.clone()], &ok_response(r#"{"success":true}"#))));
        assert!(!all_passed(evaluate(&[check.clone()], &ok_response(r#"{"success":false}"#))));
        assert!(!all_passed(evaluate(&[check], &ok_response(r#"{"status":"healthy"}"#))));
    }

    #[test]
    fn test_nested_body_field() {
        let check = CheckSpec::new(
            "first item is data",
            Predicate::BodyFieldEquals {
                field: "items.0.test".to_string(),
                expected: json!("data"),
            },
        );
        let body = r#"{"count":1,"items":[{"id":1,"test":"data"}]}"#;
        assert!(all_passed(evaluate(&[check], &ok_response(body))));
    }

    #[test]
    fn test_malformed_body_is_a_failed_predicate() {
        let check = CheckSpec::new(
            "has status",
            Predicate::BodyFieldEquals {
                field: "status".to_string(),
                expected: json!("healthy"),
            },
        );
        assert!(!all_passed(evaluate(&[check.clone()], &ok_response("<html>oops"))));

        let no_body = ResponseDescriptor {
            status: 200,
            latency: Duration::from_millis(1),
            body: None,
        };
        assert!(!all_passed(evaluate(&[check], &no_body)));
    }

    #[test]
    fn test_transport_failure_fails_everything() {
        let checks = default_checks(200, Duration::from_secs(10));
        let result = evaluate(&checks, &ResponseDescriptor::failed(Duration::from_millis(3)));
        assert!(result.outcomes.iter().all(|(_, ok)| !ok));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let mut checks = default_checks(200, Duration::from_millis(100));
        checks.push(CheckSpec::new(
            "healthy",
            Predicate::BodyFieldEquals {
                field: "status".to_string(),
                expected: json!("healthy"),
            },
        ));
        let response = ok_response(r#"{"status":"healthy"}"#);
        assert_eq!(evaluate(&checks, &response), evaluate(&checks, &response));
    }
}
