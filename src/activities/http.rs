use async_trait::async_trait;
use base64::Engine as _;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::debug;

use crate::dsl::{AuthenticationPolicy, Endpoint, HttpArguments, HttpOutputMode};
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::position::NodePosition;
use crate::tree::NodeKind;

use super::{ActivityContext, ActivityOutcome, ActivityRunner};

lazy_static! {
    static ref URI_TEMPLATE: Regex = Regex::new(r"\{(\w+)\}").expect("valid template regex");
}

/// The HTTP call activity, backed by reqwest.
///
/// Two clients are kept: one that follows redirects (for `redirect: true`)
/// and one that refuses them, so the per-task policy does not require
/// rebuilding clients.
#[derive(Debug)]
pub struct HttpRunner {
    strict: reqwest::Client,
    following: reqwest::Client,
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strict: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
            following: reqwest::Client::new(),
        }
    }

    fn resolve_endpoint(
        &self,
        args: &HttpArguments,
        input: &Value,
        scope: &Scope,
        position: &NodePosition,
    ) -> Result<(String, Option<AuthenticationPolicy>), WorkflowError> {
        let (raw, auth) = match &args.endpoint {
            Endpoint::Uri(uri) => (uri.clone(), None),
            Endpoint::Configured(config) => (config.uri.clone(), config.authentication.clone()),
        };

        // Expression, URI template, or literal, in that order.
        let resolved = if raw.trim_start().starts_with("${") {
            let value = expressions::evaluate(input, &raw, scope)
                .map_err(|e| WorkflowError::from(e).at(position))?;
            match value {
                Value::String(uri) => uri,
                other => {
                    return Err(WorkflowError::expression("Endpoint must resolve to a string")
                        .with_detail(format!("got {other}"))
                        .at(position));
                }
            }
        } else {
            let mut missing = None;
            let expanded = URI_TEMPLATE.replace_all(&raw, |caps: &regex::Captures| {
                match input.get(&caps[1]) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        missing = Some(caps[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(WorkflowError::expression("Unresolved URI template placeholder")
                    .with_detail(format!("no input field '{name}'"))
                    .at(position));
            }
            expanded.into_owned()
        };

        Ok((resolved, auth))
    }

    fn apply_auth(
        request: reqwest::RequestBuilder,
        auth: &AuthenticationPolicy,
        input: &Value,
        scope: &Scope,
        position: &NodePosition,
    ) -> Result<reqwest::RequestBuilder, WorkflowError> {
        let resolve = |text: &str| -> Result<String, WorkflowError> {
            // `$secrets` references resolve through the scope; literal values
            // pass through untouched.
            let value = expressions::evaluate(input, text, scope)
                .map_err(|e| WorkflowError::from(e).at(position))?;
            match value {
                Value::String(s) => Ok(s),
                Value::Null => Err(WorkflowError::authentication(
                    "Credential resolved to null",
                )
                .with_detail(text.to_string())
                .at(position)),
                other => Ok(other.to_string()),
            }
        };

        if let Some(basic) = &auth.basic {
            let username = resolve(&basic.username)?;
            let password = resolve(&basic.password)?;
            return Ok(request.basic_auth(username, Some(password)));
        }
        if let Some(bearer) = &auth.bearer {
            let token = resolve(&bearer.token)?;
            return Ok(request.bearer_auth(token));
        }
        Ok(request)
    }
}

#[async_trait]
impl ActivityRunner for HttpRunner {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
        let NodeKind::HttpCall { args } = &ctx.kind else {
            return Err(WorkflowError::configuration("HTTP runner got a non-call task")
                .at(&ctx.position));
        };

        let (uri, auth) = self.resolve_endpoint(args, &ctx.input, &ctx.scope, &ctx.position)?;
        let method = Method::from_bytes(args.method.to_uppercase().as_bytes()).map_err(|_| {
            WorkflowError::configuration("Invalid HTTP method")
                .with_detail(args.method.clone())
                .at(&ctx.position)
        })?;

        debug!(%method, %uri, "dispatching http call");

        let client = if args.redirect {
            &self.following
        } else {
            &self.strict
        };
        let mut request = client.request(method, &uri);

        if let Some(headers) = &args.headers {
            let mut header_map = HeaderMap::new();
            for (name, template) in headers {
                let value = expressions::evaluate(&ctx.input, template, &ctx.scope)
                    .map_err(|e| WorkflowError::from(e).at(&ctx.position))?;
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    WorkflowError::configuration("Invalid header name")
                        .with_detail(name.clone())
                        .at(&ctx.position)
                })?;
                let header_value = HeaderValue::from_str(&text).map_err(|_| {
                    WorkflowError::configuration("Invalid header value")
                        .with_detail(format!("{name}: {text}"))
                        .at(&ctx.position)
                })?;
                header_map.insert(header_name, header_value);
            }
            request = request.headers(header_map);
        }

        if let Some(query) = &args.query {
            let mut pairs = Vec::with_capacity(query.len());
            for (name, template) in query {
                let value = expressions::evaluate(&ctx.input, template, &ctx.scope)
                    .map_err(|e| WorkflowError::from(e).at(&ctx.position))?;
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                pairs.push((name.clone(), text));
            }
            request = request.query(&pairs);
        }

        if let Some(body) = &args.body {
            let evaluated = expressions::evaluate_value(&ctx.input, body, &ctx.scope)
                .map_err(|e| WorkflowError::from(e).at(&ctx.position))?;
            request = request.json(&evaluated);
        }

        if let Some(auth) = &auth {
            request = Self::apply_auth(request, auth, &ctx.input, &ctx.scope, &ctx.position)?;
        }

        let response = request.send().await.map_err(|e| {
            WorkflowError::communication("HTTP request failed")
                .with_detail(e.to_string())
                .at(&ctx.position)
        })?;

        let status = response.status();
        if !status.is_success() && !(args.redirect && status.is_redirection()) {
            return Err(WorkflowError::communication("HTTP request returned an error status")
                .with_status(status.as_u16())
                .with_detail(format!("{} {uri}", status.as_u16()))
                .at(&ctx.position));
        }

        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();

        let bytes = response.bytes().await.map_err(|e| {
            WorkflowError::communication("Failed to read HTTP response body")
                .with_detail(e.to_string())
                .at(&ctx.position)
        })?;

        let content = decode_body(&bytes);

        let output = match args.output {
            HttpOutputMode::Content => content,
            HttpOutputMode::Response => serde_json::json!({
                "status": status.as_u16(),
                "headers": headers,
                "content": content,
            }),
            HttpOutputMode::Raw => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
            }
        };

        Ok(ActivityOutcome::Output(output))
    }
}

/// JSON bodies decode to structured values; anything else becomes a string.
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::dsl::EndpointConfiguration;
    use crate::secrets::SecretStore;

    use super::*;

    fn call_ctx(args: HttpArguments, input: Value) -> ActivityContext {
        ActivityContext {
            kind: NodeKind::HttpCall { args },
            input,
            scope: Scope::new(),
            secrets: SecretStore::default(),
            position: NodePosition::root(),
        }
    }

    fn get_args(uri: String) -> HttpArguments {
        HttpArguments {
            method: "get".to_string(),
            endpoint: Endpoint::Uri(uri),
            headers: None,
            query: None,
            body: None,
            output: HttpOutputMode::Content,
            redirect: false,
        }
    }

    #[tokio::test]
    async fn content_mode_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pets/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1})))
            .mount(&server)
            .await;

        let args = get_args(format!("{}/pets/1", server.uri()));
        let outcome = HttpRunner::new().run(call_ctx(args, Value::Null)).await.unwrap();
        match outcome {
            ActivityOutcome::Output(value) => assert_eq!(value, serde_json::json!({"id": 1})),
            ActivityOutcome::Suspend { .. } => panic!("http must not suspend"),
        }
    }

    #[tokio::test]
    async fn uri_templates_expand_from_input() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pets/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!("ok")))
            .mount(&server)
            .await;

        let args = get_args(format!("{}/pets/{{id}}", server.uri()));
        let input = serde_json::json!({"id": 42});
        let outcome = HttpRunner::new().run(call_ctx(args, input)).await.unwrap();
        match outcome {
            ActivityOutcome::Output(value) => assert_eq!(value, serde_json::json!("ok")),
            ActivityOutcome::Suspend { .. } => panic!("http must not suspend"),
        }
    }

    #[tokio::test]
    async fn non_success_status_raises_communication() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let args = get_args(format!("{}/missing", server.uri()));
        let err = HttpRunner::new()
            .run(call_ctx(args, Value::Null))
            .await
            .unwrap_err();
        assert!(err.error_type.ends_with("/communication"));
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn response_mode_wraps_status_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"a": 1})))
            .mount(&server)
            .await;

        let mut args = get_args(format!("{}/info", server.uri()));
        args.output = HttpOutputMode::Response;
        let outcome = HttpRunner::new().run(call_ctx(args, Value::Null)).await.unwrap();
        match outcome {
            ActivityOutcome::Output(value) => {
                assert_eq!(value["status"], 200);
                assert_eq!(value["content"], serde_json::json!({"a": 1}));
            }
            ActivityOutcome::Suspend { .. } => panic!("http must not suspend"),
        }
    }

    #[tokio::test]
    async fn bearer_auth_resolves_secret_expressions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!("granted")))
            .mount(&server)
            .await;

        let args = HttpArguments {
            method: "get".to_string(),
            endpoint: Endpoint::Configured(EndpointConfiguration {
                uri: format!("{}/private", server.uri()),
                authentication: Some(AuthenticationPolicy {
                    basic: None,
                    bearer: Some(crate::dsl::BearerAuthentication {
                        token: "${ $secrets.api_token }".to_string(),
                    }),
                }),
            }),
            headers: None,
            query: None,
            body: None,
            output: HttpOutputMode::Content,
            redirect: false,
        };

        let secrets = SecretStore::new(std::collections::HashMap::from([(
            "api_token".to_string(),
            Value::String("s3cret".to_string()),
        )]));
        let scope = Scope::new().with_var("secrets", Value::Object(secrets.as_object()));
        let ctx = ActivityContext {
            kind: NodeKind::HttpCall { args },
            input: Value::Null,
            scope,
            secrets,
            position: NodePosition::root(),
        };

        let outcome = HttpRunner::new().run(ctx).await.unwrap();
        match outcome {
            ActivityOutcome::Output(value) => assert_eq!(value, serde_json::json!("granted")),
            ActivityOutcome::Suspend { .. } => panic!("http must not suspend"),
        }
    }

    #[tokio::test]
    async fn query_parameters_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let mut args = get_args(format!("{}/search", server.uri()));
        args.query = Some(indexmap::IndexMap::from([(
            "q".to_string(),
            "${ .term }".to_string(),
        )]));
        let outcome = HttpRunner::new()
            .run(call_ctx(args, serde_json::json!({"term": "rook"})))
            .await
            .unwrap();
        match outcome {
            ActivityOutcome::Output(value) => assert_eq!(value, serde_json::json!([])),
            ActivityOutcome::Suspend { .. } => panic!("http must not suspend"),
        }
    }
}
