//! Activity dispatch: the registry mapping activity kinds to runners.
//!
//! The provider is immutable; `with` and `merge` return new providers, so a
//! configured provider can be shared freely across consumers and instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::definitions::DefinitionRegistry;
use crate::error::WorkflowError;
use crate::expressions::Scope;
use crate::position::NodePosition;
use crate::secrets::SecretStore;
use crate::tree::NodeKind;

mod http;
mod process;
mod subflow;
mod wait;

pub use http::HttpRunner;
pub use process::ProcessRunner;
pub use subflow::SubWorkflowRunner;
pub use wait::WaitRunner;

/// The activity kinds the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    HttpCall,
    Shell,
    Script,
    Wait,
    Subflow,
    Emit,
    Listen,
}

impl ActivityKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ActivityKind::HttpCall => "call.http",
            ActivityKind::Shell => "run.shell",
            ActivityKind::Script => "run.script",
            ActivityKind::Wait => "wait",
            ActivityKind::Subflow => "run.workflow",
            ActivityKind::Emit => "emit",
            ActivityKind::Listen => "listen",
        }
    }
}

/// Everything a runner gets to see: the node's definition slice, the
/// transformed input, the expression scope at the node, and the secrets.
#[derive(Clone)]
pub struct ActivityContext {
    pub kind: NodeKind,
    pub input: Value,
    pub scope: Scope,
    pub secrets: SecretStore,
    pub position: NodePosition,
}

impl ActivityContext {
    pub fn activity_kind(&self) -> Result<ActivityKind, WorkflowError> {
        match &self.kind {
            NodeKind::HttpCall { .. } => Ok(ActivityKind::HttpCall),
            NodeKind::Shell { .. } => Ok(ActivityKind::Shell),
            NodeKind::Script { .. } => Ok(ActivityKind::Script),
            NodeKind::Wait { .. } => Ok(ActivityKind::Wait),
            NodeKind::Subflow { .. } => Ok(ActivityKind::Subflow),
            NodeKind::Emit { .. } => Ok(ActivityKind::Emit),
            NodeKind::Listen { .. } => Ok(ActivityKind::Listen),
            other => Err(WorkflowError::configuration("Not an activity")
                .with_detail(format!("'{}' has no runner", other.name()))
                .at(&self.position)),
        }
    }
}

/// What running an activity produced.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    /// The effect ran; this becomes the node's raw output.
    Output(Value),
    /// The effect asks the engine to park the instance (wait activity). The
    /// output is recorded now so redelivery resumes past the node.
    Suspend { output: Value, delay: Duration },
}

/// A leaf-effect executor. Runners may suspend at will and must tolerate
/// being cancelled by the enclosing engine.
#[async_trait]
pub trait ActivityRunner: Send + Sync + std::fmt::Debug {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError>;
}

/// Immutable registry of runners keyed by activity kind.
#[derive(Clone, Default)]
pub struct RunnerProvider {
    runners: HashMap<ActivityKind, Arc<dyn ActivityRunner>>,
}

impl RunnerProvider {
    /// The built-in runners: HTTP, shell, script, wait, and the
    /// not-implemented emit/listen placeholders. Sub-workflow support needs a
    /// definition registry; see [`standard_provider`].
    #[must_use]
    pub fn builtin() -> Self {
        Self::default()
            .with(ActivityKind::HttpCall, Arc::new(HttpRunner::new()))
            .with(ActivityKind::Shell, Arc::new(ProcessRunner))
            .with(ActivityKind::Script, Arc::new(ProcessRunner))
            .with(ActivityKind::Wait, Arc::new(WaitRunner))
            .with(
                ActivityKind::Emit,
                Arc::new(NotImplementedRunner { kind: "emit" }),
            )
            .with(
                ActivityKind::Listen,
                Arc::new(NotImplementedRunner { kind: "listen" }),
            )
    }

    /// A new provider with `runner` registered for `kind`.
    #[must_use]
    pub fn with(&self, kind: ActivityKind, runner: Arc<dyn ActivityRunner>) -> Self {
        let mut runners = self.runners.clone();
        runners.insert(kind, runner);
        Self { runners }
    }

    /// Compose two providers; on conflict the right-hand side wins.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut runners = self.runners.clone();
        for (kind, runner) in &other.runners {
            runners.insert(*kind, Arc::clone(runner));
        }
        Self { runners }
    }

    pub fn get(&self, kind: &ActivityKind) -> Result<Arc<dyn ActivityRunner>, WorkflowError> {
        self.runners.get(kind).map(Arc::clone).ok_or_else(|| {
            WorkflowError::configuration("No runner registered for activity kind")
                .with_detail(format!("kind '{}'", kind.name()))
        })
    }
}

/// The full provider: built-ins plus sub-workflow dispatch through the given
/// definition registry.
#[must_use]
pub fn standard_provider(definitions: Arc<DefinitionRegistry>) -> RunnerProvider {
    RunnerProvider::builtin().with(
        ActivityKind::Subflow,
        Arc::new(SubWorkflowRunner::new(definitions)),
    )
}

/// Placeholder for activity kinds the core declares but does not implement.
#[derive(Debug)]
struct NotImplementedRunner {
    kind: &'static str,
}

#[async_trait]
impl ActivityRunner for NotImplementedRunner {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
        Err(
            WorkflowError::configuration("Activity kind not implemented")
                .with_detail(format!("'{}' tasks are not supported by this engine", self.kind))
                .at(&ctx.position),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe(&'static str);

    #[async_trait]
    impl ActivityRunner for Probe {
        async fn run(&self, _ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
            Ok(ActivityOutcome::Output(Value::String(self.0.to_string())))
        }
    }

    fn probe_ctx(kind: NodeKind) -> ActivityContext {
        ActivityContext {
            kind,
            input: Value::Null,
            scope: Scope::new(),
            secrets: SecretStore::default(),
            position: NodePosition::root(),
        }
    }

    #[tokio::test]
    async fn with_returns_a_new_provider() {
        let base = RunnerProvider::default();
        let extended = base.with(ActivityKind::Wait, Arc::new(Probe("a")));
        assert!(base.get(&ActivityKind::Wait).is_err());
        assert!(extended.get(&ActivityKind::Wait).is_ok());
    }

    #[tokio::test]
    async fn merge_is_right_biased() {
        let left = RunnerProvider::default().with(ActivityKind::Wait, Arc::new(Probe("left")));
        let right = RunnerProvider::default().with(ActivityKind::Wait, Arc::new(Probe("right")));
        let merged = left.merge(&right);

        let runner = merged.get(&ActivityKind::Wait).unwrap();
        let ctx = probe_ctx(NodeKind::Wait {
            duration: crate::dsl::DurationSpec::Iso8601("PT1S".to_string()),
        });
        match runner.run(ctx).await.unwrap() {
            ActivityOutcome::Output(v) => assert_eq!(v, Value::String("right".to_string())),
            ActivityOutcome::Suspend { .. } => panic!("expected output"),
        }
    }

    #[tokio::test]
    async fn missing_runner_is_a_configuration_error() {
        let err = RunnerProvider::default()
            .get(&ActivityKind::HttpCall)
            .unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }

    #[tokio::test]
    async fn emit_and_listen_are_not_implemented() {
        let provider = RunnerProvider::builtin();
        let runner = provider.get(&ActivityKind::Emit).unwrap();
        let err = runner
            .run(probe_ctx(NodeKind::Emit {
                event: Value::Null,
            }))
            .await
            .unwrap_err();
        assert!(err.detail.unwrap().contains("not supported"));
    }
}
