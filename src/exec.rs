//! Execution helpers layered on managed terminals.
//!
//! These wrap the create/wait/output/release dance for common shapes:
//! one-shot commands, bounded-time commands, command sequences, polled
//! output streaming, and commands reported through the tool-call
//! lifecycle with a live terminal embedded in the call content.

use std::{path::PathBuf, pin::pin, time::Duration};

use serde_json::json;

use crate::{
    SessionId,
    client::EnvVariable,
    terminal::{CreateTerminalSpec, ManagedTerminalHandle, TerminalError, TerminalManager},
    tool_call::{
        ToolCallContent, ToolCallManager, ToolCallPatch, ToolCallReport, ToolCallStatus, ToolKind,
    },
};

/// Shared knobs for the execution helpers.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<EnvVariable>,
    pub output_byte_limit: Option<i64>,
}

impl ExecOptions {
    fn spec(&self, command: &str, args: &[String]) -> CreateTerminalSpec {
        CreateTerminalSpec {
            command: command.to_string(),
            args: args.to_vec(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            output_byte_limit: self.output_byte_limit,
        }
    }
}

/// What a finished command produced.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
    pub truncated: bool,
}

/// [`ExecResult`] plus whether the timeout fired.
#[derive(Debug, Clone)]
pub struct TimedExecResult {
    pub output: String,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
    pub truncated: bool,
    pub timed_out: bool,
}

/// How long to wait for the exit status after killing a timed-out
/// command.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Runs one command to completion: create, wait, fetch output, release.
pub async fn execute_simple(
    manager: &TerminalManager,
    session_id: &SessionId,
    command: &str,
    args: &[String],
    options: &ExecOptions,
) -> Result<ExecResult, TerminalError> {
    let handle = manager.create(session_id, options.spec(command, args)).await?;
    let exit = handle.wait_for_exit().await;
    let output = handle.current_output().await;
    handle.release().await?;

    let exit = exit?;
    let output = output?;
    Ok(ExecResult {
        output: output.output,
        exit_code: exit.exit_code,
        signal: exit.signal,
        truncated: output.truncated,
    })
}

/// Runs a command racing a timer. On timeout the terminal is killed, the
/// exit status is fetched on a best-effort grace window, and the terminal
/// is always released.
pub async fn execute_with_timeout(
    manager: &TerminalManager,
    session_id: &SessionId,
    command: &str,
    args: &[String],
    options: &ExecOptions,
    timeout: Duration,
) -> Result<TimedExecResult, TerminalError> {
    let handle = manager.create(session_id, options.spec(command, args)).await?;

    let exit = tokio::time::timeout(timeout, handle.wait_for_exit()).await;
    let (exit_status, timed_out) = match exit {
        Ok(exit) => (Some(exit?), false),
        Err(_elapsed) => {
            if let Err(err) = handle.kill().await {
                log::warn!("failed to kill timed-out terminal: {err}");
            }
            let grace = tokio::time::timeout(KILL_GRACE, handle.wait_for_exit()).await;
            (grace.ok().and_then(|exit| exit.ok()), true)
        }
    };

    let output = handle.current_output().await;
    handle.release().await?;

    let output = output?;
    Ok(TimedExecResult {
        output: output.output,
        exit_code: exit_status.as_ref().and_then(|exit| exit.exit_code),
        signal: exit_status.and_then(|exit| exit.signal),
        truncated: output.truncated,
        timed_out,
    })
}

/// Interval at which a running command's terminal is marked active.
const PROGRESS_TICK: Duration = Duration::from_secs(5);

/// Runs a command reported as an `execute` tool call with the terminal
/// embedded in the call content. The client streams output on its own;
/// the ticker only keeps the terminal's activity fresh.
pub async fn execute_with_progress(
    manager: &TerminalManager,
    tool_calls: &ToolCallManager,
    session_id: &SessionId,
    command: &str,
    args: &[String],
    options: &ExecOptions,
) -> Result<ExecResult, TerminalError> {
    let title = command_line(command, args);
    let handle = manager.create(session_id, options.spec(command, args)).await?;

    let call_id = tool_calls.report(
        session_id,
        "run_command",
        ToolCallReport {
            title: format!("$ {title}"),
            kind: ToolKind::Execute,
            status: ToolCallStatus::InProgress,
            raw_input: Some(json!({"command": command, "args": args})),
            locations: Vec::new(),
        },
    );
    tool_calls.update(
        session_id,
        &call_id,
        ToolCallPatch {
            content: Some(vec![ToolCallContent::Terminal {
                terminal_id: handle.id().clone(),
            }]),
            ..Default::default()
        },
    );

    let exit = {
        let mut exit_fut = pin!(handle.wait_for_exit());
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                exit = &mut exit_fut => break exit,
                _ = tick.tick() => manager.touch(handle.id()),
            }
        }
    };

    let output = handle.current_output().await;
    handle.release().await?;

    match (exit, output) {
        (Ok(exit), Ok(output)) => {
            let raw_output = json!({
                "exitCode": exit.exit_code,
                "signal": exit.signal,
                "output": output.output,
                "truncated": output.truncated,
            });
            if exit.exit_code == Some(0) {
                tool_calls.update(
                    session_id,
                    &call_id,
                    ToolCallPatch {
                        status: Some(ToolCallStatus::Completed),
                        title: Some("✓ Command completed successfully".to_string()),
                        raw_output: Some(raw_output),
                        ..Default::default()
                    },
                );
            } else {
                let title = match (exit.exit_code, &exit.signal) {
                    (Some(code), _) => format!("✗ Command failed with exit code {code}"),
                    (None, Some(signal)) => format!("✗ Command terminated by signal {signal}"),
                    (None, None) => "✗ Command failed".to_string(),
                };
                tool_calls.update(
                    session_id,
                    &call_id,
                    ToolCallPatch {
                        status: Some(ToolCallStatus::Failed),
                        title: Some(title),
                        raw_output: Some(raw_output),
                        ..Default::default()
                    },
                );
            }
            Ok(ExecResult {
                output: output.output,
                exit_code: exit.exit_code,
                signal: exit.signal,
                truncated: output.truncated,
            })
        }
        (exit, output) => {
            let err = exit.err().or_else(|| output.err()).expect("one side failed");
            tool_calls.fail(session_id, &call_id, &err.to_string(), None);
            Err(err)
        }
    }
}

/// Runs commands one-by-one in a shared working directory/environment.
/// With `stop_on_error` (the default) the sequence stops at the first
/// non-zero exit.
pub async fn execute_sequential(
    manager: &TerminalManager,
    session_id: &SessionId,
    commands: &[(String, Vec<String>)],
    options: &ExecOptions,
    stop_on_error: bool,
) -> Result<Vec<ExecResult>, TerminalError> {
    let mut results = Vec::with_capacity(commands.len());
    for (command, args) in commands {
        let result = execute_simple(manager, session_id, command, args, options).await?;
        let failed = result.exit_code != Some(0);
        results.push(result);
        if stop_on_error && failed {
            break;
        }
    }
    Ok(results)
}

/// Polls a terminal's output and feeds each new slice to `on_chunk`,
/// until the output response carries an exit status.
pub async fn stream_output(
    handle: &ManagedTerminalHandle,
    mut on_chunk: impl FnMut(&str),
    poll_interval: Duration,
) -> Result<(), TerminalError> {
    let mut seen = 0usize;
    loop {
        let output = handle.current_output().await?;
        if output.output.len() > seen {
            on_chunk(&output.output[seen..]);
            seen = output.output.len();
        }
        if output.exit_status.is_some() {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}
