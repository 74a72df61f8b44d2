use async_trait::async_trait;

use crate::error::WorkflowError;
use crate::tree::NodeKind;

use super::{ActivityContext, ActivityOutcome, ActivityRunner};

/// The wait activity.
///
/// In the distributed pipeline the sleep itself happens in the wait outbox:
/// the runner records the passthrough output and hands the delay to the
/// engine, which parks the snapshot until redelivery.
#[derive(Debug)]
pub struct WaitRunner;

#[async_trait]
impl ActivityRunner for WaitRunner {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
        let NodeKind::Wait { duration } = &ctx.kind else {
            return Err(WorkflowError::configuration("Wait runner got a non-wait task")
                .at(&ctx.position));
        };

        let delay = duration.to_duration().map_err(|e| {
            WorkflowError::configuration("Invalid wait duration")
                .with_detail(e.to_string())
                .at(&ctx.position)
        })?;

        Ok(ActivityOutcome::Suspend {
            output: ctx.input,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::dsl::DurationSpec;
    use crate::expressions::Scope;
    use crate::position::NodePosition;
    use crate::secrets::SecretStore;

    use super::*;

    #[tokio::test]
    async fn wait_suspends_with_passthrough_output() {
        let ctx = ActivityContext {
            kind: NodeKind::Wait {
                duration: DurationSpec::Iso8601("PT30S".to_string()),
            },
            input: json!({"keep": "me"}),
            scope: Scope::new(),
            secrets: SecretStore::default(),
            position: NodePosition::root(),
        };

        match WaitRunner.run(ctx).await.unwrap() {
            ActivityOutcome::Suspend { output, delay } => {
                assert_eq!(output, json!({"keep": "me"}));
                assert_eq!(delay, Duration::from_secs(30));
            }
            ActivityOutcome::Output(_) => panic!("wait must suspend"),
        }
    }

    #[tokio::test]
    async fn invalid_duration_is_a_configuration_error() {
        let ctx = ActivityContext {
            kind: NodeKind::Wait {
                duration: DurationSpec::Iso8601("P1Y".to_string()),
            },
            input: json!(null),
            scope: Scope::new(),
            secrets: SecretStore::default(),
            position: NodePosition::root(),
        };
        let err = WaitRunner.run(ctx).await.unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }
}
