use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::dsl::{ProcessReturnMode, ScriptProcess, ShellProcess};
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::position::NodePosition;
use crate::tree::NodeKind;

use super::{ActivityContext, ActivityOutcome, ActivityRunner};

/// The shell and script run activities.
///
/// With `await: true` the child process is waited on and its stdout, stderr
/// or exit code shaped into the raw output according to the `return` policy;
/// with `await: false` the process is detached and the task passes its input
/// through immediately.
#[derive(Debug)]
pub struct ProcessRunner;

#[async_trait]
impl ActivityRunner for ProcessRunner {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
        match &ctx.kind {
            NodeKind::Shell {
                process,
                await_,
                return_,
            } => {
                let command = shell_command(process, &ctx.input, &ctx.scope, &ctx.position)?;
                execute(command, *await_, *return_, &ctx, None).await
            }
            NodeKind::Script {
                process,
                await_,
                return_,
            } => {
                let (command, script) = script_command(process, &ctx.input, &ctx.scope, &ctx.position)?;
                execute(command, *await_, *return_, &ctx, Some(script)).await
            }
            _ => Err(WorkflowError::configuration("Process runner got a non-run task")
                .at(&ctx.position)),
        }
    }
}

fn shell_command(
    process: &ShellProcess,
    input: &Value,
    scope: &Scope,
    position: &NodePosition,
) -> Result<Command, WorkflowError> {
    let program = resolve_text(&process.command, input, scope, position)?;
    debug!(command = %program, "spawning shell process");

    // Arguments reach the process verbatim; expression-derived values are
    // never re-tokenized by a shell.
    let mut command = Command::new(program);
    if let Some(arguments) = &process.arguments {
        for argument in arguments {
            command.arg(resolve_text(argument, input, scope, position)?);
        }
    }
    apply_environment(&mut command, process.environment.as_ref(), input, scope, position)?;
    Ok(command)
}

fn script_command(
    process: &ScriptProcess,
    input: &Value,
    scope: &Scope,
    position: &NodePosition,
) -> Result<(Command, tempfile::TempPath), WorkflowError> {
    let interpreter = match process.language.to_lowercase().as_str() {
        "python" => "python3",
        "javascript" | "js" | "node" => "node",
        "shell" | "bash" | "sh" => "sh",
        other => {
            return Err(WorkflowError::configuration("Unsupported script language")
                .with_detail(other.to_string())
                .at(position));
        }
    };

    let mut file = tempfile::NamedTempFile::new().map_err(|e| {
        WorkflowError::communication("Failed to stage script")
            .with_detail(e.to_string())
            .at(position)
    })?;
    std::io::Write::write_all(&mut file, process.code.as_bytes()).map_err(|e| {
        WorkflowError::communication("Failed to stage script")
            .with_detail(e.to_string())
            .at(position)
    })?;
    let script = file.into_temp_path();

    debug!(%interpreter, "spawning script process");
    let mut command = Command::new(interpreter);
    command.arg(script.to_path_buf());
    if let Some(arguments) = &process.arguments {
        for argument in arguments {
            command.arg(resolve_text(argument, input, scope, position)?);
        }
    }
    apply_environment(&mut command, process.environment.as_ref(), input, scope, position)?;
    Ok((command, script))
}

fn apply_environment(
    command: &mut Command,
    environment: Option<&indexmap::IndexMap<String, String>>,
    input: &Value,
    scope: &Scope,
    position: &NodePosition,
) -> Result<(), WorkflowError> {
    if let Some(environment) = environment {
        for (name, template) in environment {
            command.env(name, resolve_text(template, input, scope, position)?);
        }
    }
    Ok(())
}

fn resolve_text(
    template: &str,
    input: &Value,
    scope: &Scope,
    position: &NodePosition,
) -> Result<String, WorkflowError> {
    let value = expressions::evaluate(input, template, scope)
        .map_err(|e| WorkflowError::from(e).at(position))?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

async fn execute(
    mut command: Command,
    await_: bool,
    return_: ProcessReturnMode,
    ctx: &ActivityContext,
    script: Option<tempfile::TempPath>,
) -> Result<ActivityOutcome, WorkflowError> {
    if !await_ {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                WorkflowError::communication("Failed to spawn process")
                    .with_detail(e.to_string())
                    .at(&ctx.position)
            })?;
        // The staged script must outlive the detached process.
        if let Some(script) = script {
            let _ = script.keep();
        }
        return Ok(ActivityOutcome::Output(ctx.input.clone()));
    }

    let output = command.output().await.map_err(|e| {
        WorkflowError::communication("Failed to run process")
            .with_detail(e.to_string())
            .at(&ctx.position)
    })?;
    drop(script);

    if !output.status.success() {
        warn!(code = ?output.status.code(), position = %ctx.position, "process exited non-zero");
    }

    let shaped = match return_ {
        ProcessReturnMode::Stdout => text_value(&output.stdout),
        ProcessReturnMode::Stderr => text_value(&output.stderr),
        ProcessReturnMode::Code => Value::from(output.status.code().unwrap_or(-1)),
        ProcessReturnMode::All => serde_json::json!({
            "code": output.status.code().unwrap_or(-1),
            "stdout": text_value(&output.stdout),
            "stderr": text_value(&output.stderr),
        }),
        ProcessReturnMode::None => Value::Null,
    };

    Ok(ActivityOutcome::Output(shaped))
}

/// Trailing newlines are stripped; JSON output decodes to structured values.
fn text_value(bytes: &[u8]) -> Value {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
