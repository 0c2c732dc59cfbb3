// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command builder: translates a lifecycle operation into the ordered list of
//! remote actions that realize it.
//!
//! [`build_commands`] is a pure function of (operation, instance, process,
//! update, settings). Each [`AgentCommand`] carries the ledger step name it
//! executes under, an idempotency probe so retries skip work that already
//! happened, and the execution body itself. Commands never touch the
//! database; observed facts (the launched pid, an unconfirmed kill) travel
//! back to the orchestrator in [`CommandOutcome`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::channel::{MachineProfile, RemoteChannel, exec_ok};
use crate::config::FleetSettings;
use crate::error::Error;
use crate::persistence::{InstanceRecord, ProcessRecord};
use crate::state::OperationKind;

// ============================================================================
// Remote path layout
// ============================================================================

/// Configuration directory under a deploy path.
pub fn config_dir(deploy_path: &str) -> String {
    format!("{deploy_path}/config")
}

/// Pipeline configuration file for one instance.
pub fn pipeline_config_file(deploy_path: &str, instance_id: i64) -> String {
    format!("{deploy_path}/config/pipeline-{instance_id}.conf")
}

/// JVM options file.
pub fn jvm_options_file(deploy_path: &str) -> String {
    format!("{deploy_path}/config/jvm.options")
}

/// Agent settings file.
pub fn agent_settings_file(deploy_path: &str) -> String {
    format!("{deploy_path}/config/agent.yml")
}

/// Pid file written by the launch script.
pub fn pid_file(deploy_path: &str, instance_id: i64) -> String {
    format!("{deploy_path}/agent-{instance_id}.pid")
}

/// Log directory under a deploy path.
pub fn log_dir(deploy_path: &str) -> String {
    format!("{deploy_path}/logs")
}

/// Data directory under a deploy path.
pub fn data_dir(deploy_path: &str) -> String {
    format!("{deploy_path}/data")
}

/// Stdout/stderr capture file for the agent process.
pub fn log_file(deploy_path: &str, instance_id: i64) -> String {
    format!("{deploy_path}/logs/agent-{instance_id}.log")
}

/// Launch script path for one instance.
pub fn start_script(deploy_path: &str, instance_id: i64) -> String {
    format!("{deploy_path}/start-agent-{instance_id}.sh")
}

// ============================================================================
// Configuration resolution
// ============================================================================

/// A partial configuration update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// New pipeline configuration document.
    pub pipeline_config: Option<String>,
    /// New JVM options document.
    pub jvm_options: Option<String>,
    /// New agent settings document.
    pub agent_settings: Option<String>,
}

impl ConfigUpdate {
    /// True when no field carries content.
    pub fn is_empty(&self) -> bool {
        self.pipeline_config.is_none() && self.jvm_options.is_none() && self.agent_settings.is_none()
    }
}

/// The pipeline config an instance should run: its override when present,
/// else the process-level document.
pub fn resolved_pipeline_config(instance: &InstanceRecord, process: &ProcessRecord) -> String {
    instance
        .pipeline_config
        .clone()
        .unwrap_or_else(|| process.pipeline_config.clone())
}

/// The JVM options an instance should run, if any are known yet.
pub fn resolved_jvm_options(instance: &InstanceRecord, process: &ProcessRecord) -> Option<String> {
    instance.jvm_options.clone().or_else(|| process.jvm_options.clone())
}

/// The agent settings an instance should run, if any are known yet.
pub fn resolved_agent_settings(
    instance: &InstanceRecord,
    process: &ProcessRecord,
) -> Option<String> {
    instance
        .agent_settings
        .clone()
        .or_else(|| process.agent_settings.clone())
}

// ============================================================================
// Command trait
// ============================================================================

/// Everything a command needs to act on one instance's machine.
pub struct CommandContext<'a> {
    /// Channel to the instance's machine.
    pub channel: &'a dyn RemoteChannel,
    /// Connection profile of the machine.
    pub machine: &'a MachineProfile,
    /// Instance being operated on.
    pub instance_id: i64,
    /// Absolute deploy path of the instance.
    pub deploy_path: &'a str,
    /// Last known OS pid, if the database has one.
    pub recorded_pid: Option<i64>,
    /// Fleet-wide settings (timeouts, polling).
    pub settings: &'a FleetSettings,
}

/// Facts observed while a command ran.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    /// OS pid observed for the agent process.
    pub pid: Option<i64>,
    /// Note recorded on the ledger step even when it completes, e.g. a
    /// force-stop whose kill could not be confirmed.
    pub note: Option<String>,
}

/// One remote action within a lifecycle task.
#[async_trait]
pub trait AgentCommand: Send + Sync {
    /// Ledger step name this command executes under.
    fn step_name(&self) -> &'static str;

    /// Probe whether the command's effect is already in place; steps whose
    /// probe returns true are completed without re-running the body.
    async fn already_done(&self, _ctx: &CommandContext<'_>) -> bool {
        false
    }

    /// Execute the command.
    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error>;
}

// ============================================================================
// Builder
// ============================================================================

/// The ordered remote actions realizing `kind` for one instance.
///
/// `update` is consulted only for [`OperationKind::UpdateConfig`]; refresh
/// always re-derives content from the instance/process records.
pub fn build_commands(
    kind: OperationKind,
    instance: &InstanceRecord,
    process: &ProcessRecord,
    update: Option<&ConfigUpdate>,
    settings: &FleetSettings,
) -> Vec<Box<dyn AgentCommand>> {
    match kind {
        OperationKind::Initialize | OperationKind::ScaleOutInit => {
            let mut commands: Vec<Box<dyn AgentCommand>> = vec![Box::new(CreateDirectories)];
            if let Some(package) = &settings.agent_package {
                commands.push(Box::new(InstallPackage {
                    local_path: package.clone(),
                }));
            }
            commands.extend(config_write_commands(
                instance,
                Some(resolved_pipeline_config(instance, process)),
                resolved_jvm_options(instance, process),
                resolved_agent_settings(instance, process),
            ));
            commands
        }
        OperationKind::Start => start_commands(instance),
        OperationKind::Stop => vec![Box::new(StopProcess)],
        OperationKind::ForceStop => vec![Box::new(ForceTerminate)],
        OperationKind::Restart => {
            let mut commands: Vec<Box<dyn AgentCommand>> = vec![Box::new(StopProcess)];
            commands.extend(start_commands(instance));
            commands
        }
        OperationKind::UpdateConfig => {
            let update = update.cloned().unwrap_or_default();
            config_write_commands(
                instance,
                update.pipeline_config,
                update.jvm_options,
                update.agent_settings,
            )
        }
        OperationKind::RefreshConfig => config_write_commands(
            instance,
            Some(resolved_pipeline_config(instance, process)),
            resolved_jvm_options(instance, process),
            resolved_agent_settings(instance, process),
        ),
    }
}

fn start_commands(instance: &InstanceRecord) -> Vec<Box<dyn AgentCommand>> {
    vec![
        Box::new(VerifyConfigPresent {
            required: vec![pipeline_config_file(&instance.deploy_path, instance.id)],
        }),
        Box::new(LaunchProcess),
        Box::new(VerifyProcess),
    ]
}

fn config_write_commands(
    instance: &InstanceRecord,
    pipeline_config: Option<String>,
    jvm_options: Option<String>,
    agent_settings: Option<String>,
) -> Vec<Box<dyn AgentCommand>> {
    let deploy = &instance.deploy_path;
    let mut commands: Vec<Box<dyn AgentCommand>> = Vec::new();
    if let Some(content) = pipeline_config {
        commands.push(Box::new(WriteConfigFile {
            step: "write pipeline config",
            dir: config_dir(deploy),
            path: pipeline_config_file(deploy, instance.id),
            content,
        }));
    }
    if let Some(content) = jvm_options {
        commands.push(Box::new(WriteConfigFile {
            step: "write jvm options",
            dir: config_dir(deploy),
            path: jvm_options_file(deploy),
            content,
        }));
    }
    if let Some(content) = agent_settings {
        commands.push(Box::new(WriteConfigFile {
            step: "write agent settings",
            dir: config_dir(deploy),
            path: agent_settings_file(deploy),
            content,
        }));
    }
    commands
}

// ============================================================================
// Commands
// ============================================================================

async fn path_exists(ctx: &CommandContext<'_>, flag: &str, path: &str) -> bool {
    matches!(
        ctx.channel
            .exec(ctx.machine, &format!("test {flag} \"{path}\""))
            .await,
        Ok(output) if output.status == 0
    )
}

async fn process_alive(ctx: &CommandContext<'_>, pid: i64) -> Result<bool, Error> {
    let output = ctx
        .channel
        .exec(ctx.machine, &format!("ps -p {pid} > /dev/null 2>&1; echo $?"))
        .await?;
    Ok(output.stdout.trim() == "0")
}

/// Read the instance's pid file, if it exists and holds a number.
async fn read_pid_file(ctx: &CommandContext<'_>) -> Result<Option<i64>, Error> {
    let path = pid_file(ctx.deploy_path, ctx.instance_id);
    if !path_exists(ctx, "-f", &path).await {
        return Ok(None);
    }
    let raw = exec_ok(ctx.channel, ctx.machine, &format!("cat \"{path}\"")).await?;
    Ok(raw.trim().parse::<i64>().ok())
}

/// The pid to act on: the recorded one, else whatever the pid file says.
async fn resolve_pid(ctx: &CommandContext<'_>) -> Result<Option<i64>, Error> {
    if ctx.recorded_pid.is_some() {
        return Ok(ctx.recorded_pid);
    }
    read_pid_file(ctx).await
}

/// Ensure the deploy directory tree exists.
struct CreateDirectories;

#[async_trait]
impl AgentCommand for CreateDirectories {
    fn step_name(&self) -> &'static str {
        "create deploy directory"
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let deploy = ctx.deploy_path;
        exec_ok(
            ctx.channel,
            ctx.machine,
            &format!(
                "mkdir -p \"{deploy}\" \"{}\" \"{}\" \"{}\"",
                config_dir(deploy),
                log_dir(deploy),
                data_dir(deploy)
            ),
        )
        .await?;
        Ok(CommandOutcome::default())
    }
}

/// Upload and extract the agent package tarball into the deploy directory.
struct InstallPackage {
    local_path: String,
}

#[async_trait]
impl AgentCommand for InstallPackage {
    fn step_name(&self) -> &'static str {
        "install agent package"
    }

    async fn already_done(&self, ctx: &CommandContext<'_>) -> bool {
        path_exists(ctx, "-x", &format!("{}/bin/agent", ctx.deploy_path)).await
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let bytes = tokio::fs::read(&self.local_path).await.map_err(|e| {
            Error::Other(format!(
                "failed to read agent package '{}': {e}",
                self.local_path
            ))
        })?;

        let deploy = ctx.deploy_path;
        let tarball = format!("{deploy}/agent-package.tar.gz");
        ctx.channel.write_file(ctx.machine, &tarball, &bytes).await?;
        exec_ok(
            ctx.channel,
            ctx.machine,
            &format!("tar -xzf \"{tarball}\" -C \"{deploy}\" --strip-components=1 && rm -f \"{tarball}\""),
        )
        .await?;

        if !path_exists(ctx, "-x", &format!("{deploy}/bin/agent")).await {
            return Err(Error::Execution(format!(
                "agent binary missing after extracting package into {deploy}"
            )));
        }
        Ok(CommandOutcome::default())
    }
}

/// Write one configuration document and verify the remote content matches.
///
/// The write happens even when the remote file already has the right
/// content; the digest check afterwards is what makes the sync tolerant of
/// out-of-band edits without ever skipping verification.
struct WriteConfigFile {
    step: &'static str,
    dir: String,
    path: String,
    content: String,
}

#[async_trait]
impl AgentCommand for WriteConfigFile {
    fn step_name(&self) -> &'static str {
        self.step
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        exec_ok(ctx.channel, ctx.machine, &format!("mkdir -p \"{}\"", self.dir)).await?;
        ctx.channel
            .write_file(ctx.machine, &self.path, self.content.as_bytes())
            .await?;

        let written = ctx.channel.read_file(ctx.machine, &self.path).await?;
        if Sha256::digest(&written) != Sha256::digest(self.content.as_bytes()) {
            return Err(Error::Execution(format!(
                "remote content of {} does not match after write",
                self.path
            )));
        }
        Ok(CommandOutcome::default())
    }
}

/// Fail fast when required configuration files are missing.
struct VerifyConfigPresent {
    required: Vec<String>,
}

#[async_trait]
impl AgentCommand for VerifyConfigPresent {
    fn step_name(&self) -> &'static str {
        "verify configuration"
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        for path in &self.required {
            if !path_exists(ctx, "-f", path).await {
                return Err(Error::Execution(format!(
                    "configuration file missing on machine '{}': {path}; \
                     initialize or refresh configuration before starting",
                    ctx.machine.name
                )));
            }
        }
        Ok(CommandOutcome::default())
    }
}

/// Launch the agent detached and capture its pid.
struct LaunchProcess;

#[async_trait]
impl AgentCommand for LaunchProcess {
    fn step_name(&self) -> &'static str {
        "launch process"
    }

    async fn already_done(&self, ctx: &CommandContext<'_>) -> bool {
        match read_pid_file(ctx).await {
            Ok(Some(pid)) => process_alive(ctx, pid).await.unwrap_or(false),
            _ => false,
        }
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let deploy = ctx.deploy_path;
        let id = ctx.instance_id;
        let pid_path = pid_file(deploy, id);

        exec_ok(
            ctx.channel,
            ctx.machine,
            &format!(
                "mkdir -p \"{}\" \"{}\" && rm -f \"{pid_path}\"",
                log_dir(deploy),
                data_dir(deploy)
            ),
        )
        .await?;

        let script = format!(
            "#!/bin/sh\n\
             cd \"{deploy}\"\n\
             nohup bin/agent -f \"{conf}\" --path.settings \"{settings}\" \
             --path.logs \"{logs}\" --path.data \"{data}\" \
             > \"{log}\" 2>&1 < /dev/null &\n\
             echo $! > \"{pid_path}\"\n",
            conf = pipeline_config_file(deploy, id),
            settings = config_dir(deploy),
            logs = log_dir(deploy),
            data = data_dir(deploy),
            log = log_file(deploy, id),
        );
        let script_path = start_script(deploy, id);
        ctx.channel
            .write_file(ctx.machine, &script_path, script.as_bytes())
            .await?;
        exec_ok(
            ctx.channel,
            ctx.machine,
            &format!("chmod +x \"{script_path}\" && \"{script_path}\""),
        )
        .await?;

        // Give the shell a moment to fork and write the pid file; full
        // liveness verification is the next step's job.
        tokio::time::sleep(ctx.settings.poll_interval).await;

        match read_pid_file(ctx).await? {
            Some(pid) => Ok(CommandOutcome {
                pid: Some(pid),
                note: None,
            }),
            None => Ok(CommandOutcome {
                pid: None,
                note: Some("pid file not yet written after launch".to_string()),
            }),
        }
    }
}

/// Poll until the launched process is demonstrably alive.
struct VerifyProcess;

#[async_trait]
impl AgentCommand for VerifyProcess {
    fn step_name(&self) -> &'static str {
        "verify process"
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let attempts = ctx.settings.verify_attempts.max(1);
        for attempt in 1..=attempts {
            let last = attempt == attempts;
            match read_pid_file(ctx).await {
                Ok(Some(pid)) => match process_alive(ctx, pid).await {
                    Ok(true) => return Ok(CommandOutcome { pid: Some(pid), note: None }),
                    Ok(false) => {
                        if last {
                            return Err(Error::Execution(format!(
                                "process {pid} is not running after {attempts} checks"
                            )));
                        }
                    }
                    Err(e) => {
                        if last {
                            return Err(e);
                        }
                    }
                },
                Ok(None) => {
                    if last {
                        return Err(Error::Execution(format!(
                            "no pid recorded on machine '{}' after {attempts} checks",
                            ctx.machine.name
                        )));
                    }
                }
                Err(e) => {
                    if last {
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(ctx.settings.poll_interval).await;
        }
        Err(Error::Execution("process verification exhausted".to_string()))
    }
}

/// Signal graceful termination and wait (bounded) for the process to exit.
struct StopProcess;

#[async_trait]
impl AgentCommand for StopProcess {
    fn step_name(&self) -> &'static str {
        "stop process"
    }

    async fn already_done(&self, ctx: &CommandContext<'_>) -> bool {
        match resolve_pid(ctx).await {
            Ok(Some(pid)) => !process_alive(ctx, pid).await.unwrap_or(true),
            Ok(None) => true,
            Err(_) => false,
        }
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let pid_path = pid_file(ctx.deploy_path, ctx.instance_id);
        let Some(pid) = resolve_pid(ctx).await? else {
            exec_ok(ctx.channel, ctx.machine, &format!("rm -f \"{pid_path}\"")).await?;
            return Ok(CommandOutcome {
                pid: None,
                note: Some("no recorded process; already stopped".to_string()),
            });
        };

        exec_ok(ctx.channel, ctx.machine, &format!("kill {pid}")).await?;

        let deadline = tokio::time::Instant::now() + ctx.settings.graceful_stop_timeout;
        loop {
            if !process_alive(ctx, pid).await? {
                exec_ok(ctx.channel, ctx.machine, &format!("rm -f \"{pid_path}\"")).await?;
                return Ok(CommandOutcome::default());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Execution(format!(
                    "process {pid} still alive {}s after termination signal; \
                     force-stop is the recovery path",
                    ctx.settings.graceful_stop_timeout.as_secs()
                )));
            }
            tokio::time::sleep(ctx.settings.poll_interval).await;
        }
    }
}

/// Unconditionally terminate, swallowing every remote failure.
///
/// This command never fails: its contract is to guarantee a way out of any
/// stuck state. When the process's death cannot be confirmed, the completed
/// step carries a note instead of an error.
struct ForceTerminate;

/// Step note recorded when a force-stop could not confirm the process died.
pub const FORCE_STOP_UNCONFIRMED_NOTE: &str =
    "termination signalled; process liveness unconfirmed";

#[async_trait]
impl AgentCommand for ForceTerminate {
    fn step_name(&self) -> &'static str {
        "terminate process"
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let pid_path = pid_file(ctx.deploy_path, ctx.instance_id);
        let pid = match resolve_pid(ctx).await {
            Ok(pid) => pid,
            Err(_) => None,
        };

        let Some(pid) = pid else {
            // Nothing known to be running; clearing the pid file is all
            // that is left to do.
            let _ = ctx
                .channel
                .exec(ctx.machine, &format!("rm -f \"{pid_path}\""))
                .await;
            return Ok(CommandOutcome::default());
        };

        let _ = ctx.channel.exec(ctx.machine, &format!("kill -9 {pid}")).await;

        let deadline = tokio::time::Instant::now() + ctx.settings.force_stop_timeout;
        let mut confirmed = false;
        while tokio::time::Instant::now() < deadline {
            match process_alive(ctx, pid).await {
                Ok(false) => {
                    confirmed = true;
                    break;
                }
                Ok(true) => tokio::time::sleep(ctx.settings.poll_interval).await,
                Err(_) => break,
            }
        }

        let _ = ctx
            .channel
            .exec(ctx.machine, &format!("rm -f \"{pid_path}\""))
            .await;

        Ok(CommandOutcome {
            pid: None,
            note: (!confirmed).then(|| FORCE_STOP_UNCONFIRMED_NOTE.to_string()),
        })
    }
}

/// Best-effort removal of the deploy directory.
pub(crate) struct DeleteDirectory;

#[async_trait]
impl AgentCommand for DeleteDirectory {
    fn step_name(&self) -> &'static str {
        "delete deploy directory"
    }

    async fn already_done(&self, ctx: &CommandContext<'_>) -> bool {
        !path_exists(ctx, "-d", ctx.deploy_path).await
    }

    async fn run(&self, ctx: &CommandContext<'_>) -> Result<CommandOutcome, Error> {
        let deploy = ctx.deploy_path;
        exec_ok(ctx.channel, ctx.machine, &format!("rm -rf \"{deploy}\"")).await?;
        if path_exists(ctx, "-d", deploy).await {
            return Err(Error::Execution(format!(
                "deploy directory {deploy} still present after removal"
            )));
        }
        Ok(CommandOutcome::default())
    }
}
