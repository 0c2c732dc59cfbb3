// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixtures: a scriptable mock remote channel, a static machine
//! directory, and a sqlite-backed context wiring the whole core together.

// Each test binary compiles this module separately and uses its own subset.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use logfleet_core::channel::{
    ChannelError, ExecOutput, MachineDirectory, MachineProfile, RemoteChannel,
};
use logfleet_core::config::FleetSettings;
use logfleet_core::error::Error;
use logfleet_core::persistence::{
    InstanceRecord, Persistence, SqlitePersistence, TaskRecord,
};
use logfleet_core::service::{FleetService, ProcessSpec};
use logfleet_core::state::InstanceState;

/// Install a tracing subscriber once so failing tests print their story.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Fleet settings tuned so remote waits resolve in test time.
pub fn test_settings() -> FleetSettings {
    FleetSettings {
        deploy_base_dir: "/opt/logfleet".to_string(),
        agent_package: None,
        graceful_stop_timeout: Duration::from_millis(300),
        force_stop_timeout: Duration::from_millis(150),
        poll_interval: Duration::from_millis(10),
        verify_attempts: 3,
        directory_delete_timeout: Duration::from_secs(5),
        backfill_timeout: Duration::from_secs(5),
    }
}

#[derive(Default)]
struct MockState {
    dirs: HashSet<(i64, String)>,
    files: HashMap<(i64, String), Vec<u8>>,
    alive: HashMap<i64, bool>,
    next_pid: i64,
    commands: Vec<(i64, String)>,
    refuse_term: bool,
    resist_sigkill: bool,
    launch_dead: HashSet<i64>,
    unreachable: bool,
}

/// In-memory fake of a fleet of remote machines.
///
/// Interprets the small shell vocabulary the command builder emits (mkdir,
/// test, cat, rm, kill, ps, script execution) against per-machine file and
/// process tables, with knobs to simulate stuck or dead processes.
#[derive(Default)]
pub struct MockChannel {
    state: Mutex<MockState>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make plain `kill` a no-op (graceful stop will time out).
    pub fn set_refuse_term(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_term = refuse;
    }

    /// Make `kill -9` a no-op too (force-stop cannot confirm the death).
    pub fn set_resist_sigkill(&self, resist: bool) {
        self.state.lock().unwrap().resist_sigkill = resist;
    }

    /// Processes launched on this machine die immediately (start
    /// verification fails there).
    pub fn set_launch_dead_on(&self, machine_id: i64) {
        self.state.lock().unwrap().launch_dead.insert(machine_id);
    }

    /// Launches on this machine behave normally again.
    pub fn clear_launch_dead(&self, machine_id: i64) {
        self.state.lock().unwrap().launch_dead.remove(&machine_id);
    }

    /// All operations fail with a connect error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Simulate an out-of-band crash of a launched process.
    pub fn kill_process(&self, pid: i64) {
        self.state.lock().unwrap().alive.insert(pid, false);
    }

    /// Pids currently alive on any machine.
    pub fn alive_pids(&self) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        state
            .alive
            .iter()
            .filter(|(_, alive)| **alive)
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Content of a remote file, if present.
    pub fn file(&self, machine_id: i64, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&(machine_id, path.to_string()))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Whether a directory exists on a machine.
    pub fn dir_exists(&self, machine_id: i64, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        dir_exists_locked(&state, machine_id, path)
    }

    /// Number of executed commands containing the given needle.
    pub fn commands_containing(&self, needle: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .commands
            .iter()
            .filter(|(_, c)| c.contains(needle))
            .count()
    }
}

fn quoted_args(part: &str) -> Vec<String> {
    part.split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, s)| s.to_string())
        .collect()
}

fn dir_exists_locked(state: &MockState, machine_id: i64, path: &str) -> bool {
    let prefix = format!("{path}/");
    state.dirs.contains(&(machine_id, path.to_string()))
        || state
            .dirs
            .iter()
            .any(|(m, d)| *m == machine_id && d.starts_with(&prefix))
        || state
            .files
            .keys()
            .any(|(m, f)| *m == machine_id && f.starts_with(&prefix))
}

fn run_part(state: &mut MockState, machine_id: i64, part: &str) -> (String, i32) {
    let part = part.trim();

    if part == "echo connected" {
        return ("connected\n".to_string(), 0);
    }
    if let Some(rest) = part.strip_prefix("ps -p ") {
        let pid: i64 = rest
            .split_whitespace()
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(-1);
        let alive = state.alive.get(&pid).copied().unwrap_or(false);
        // The builder always phrases this as `ps -p N ...; echo $?`.
        return (if alive { "0\n" } else { "1\n" }.to_string(), 0);
    }
    if part.starts_with("mkdir -p") {
        for dir in quoted_args(part) {
            state.dirs.insert((machine_id, dir));
        }
        return (String::new(), 0);
    }
    if part.starts_with("rm -rf") {
        for target in quoted_args(part) {
            let prefix = format!("{target}/");
            state
                .dirs
                .retain(|(m, d)| *m != machine_id || (*d != target && !d.starts_with(&prefix)));
            state
                .files
                .retain(|(m, f), _| *m != machine_id || (*f != target && !f.starts_with(&prefix)));
        }
        return (String::new(), 0);
    }
    if part.starts_with("rm -f") {
        for target in quoted_args(part) {
            state.files.remove(&(machine_id, target));
        }
        return (String::new(), 0);
    }
    if part.starts_with("test -f") || part.starts_with("test -x") {
        let exists = quoted_args(part)
            .first()
            .map(|p| state.files.contains_key(&(machine_id, p.clone())))
            .unwrap_or(false);
        return (String::new(), if exists { 0 } else { 1 });
    }
    if part.starts_with("test -d") {
        let exists = quoted_args(part)
            .first()
            .map(|p| dir_exists_locked(state, machine_id, p))
            .unwrap_or(false);
        return (String::new(), if exists { 0 } else { 1 });
    }
    if let Some(rest) = part.strip_prefix("cat ") {
        let path = quoted_args(rest)
            .first()
            .cloned()
            .unwrap_or_else(|| rest.trim().to_string());
        return match state.files.get(&(machine_id, path.clone())) {
            Some(content) => (String::from_utf8_lossy(content).into_owned(), 0),
            None => (String::new(), 1),
        };
    }
    if part.starts_with("chmod") {
        return (String::new(), 0);
    }
    if part.starts_with("tar -xzf") {
        // Extraction materializes the agent binary under the deploy dir.
        let args = quoted_args(part);
        if let Some(deploy) = args.get(1) {
            state
                .files
                .insert((machine_id, format!("{deploy}/bin/agent")), b"agent".to_vec());
        }
        return (String::new(), 0);
    }
    if part.starts_with("kill -9") {
        if !state.resist_sigkill
            && let Some(pid) = part.split_whitespace().last().and_then(|p| p.parse().ok())
        {
            state.alive.insert(pid, false);
        }
        return (String::new(), 0);
    }
    if part.starts_with("kill ") {
        if !state.refuse_term
            && let Some(pid) = part.split_whitespace().last().and_then(|p| p.parse().ok())
        {
            state.alive.insert(pid, false);
        }
        return (String::new(), 0);
    }
    // A bare quoted path: executing the launch script.
    if part.starts_with('"') && part.ends_with('"') {
        let script_path = part.trim_matches('"').to_string();
        let Some(script) = state.files.get(&(machine_id, script_path)).cloned() else {
            return (String::new(), 127);
        };
        let script = String::from_utf8_lossy(&script).into_owned();
        let pid_path = script
            .lines()
            .find(|l| l.starts_with("echo $!"))
            .and_then(|l| quoted_args(l).first().cloned());
        if let Some(pid_path) = pid_path {
            state.next_pid += 1;
            let pid = state.next_pid + 1000;
            let dead = state.launch_dead.contains(&machine_id);
            state.alive.insert(pid, !dead);
            state
                .files
                .insert((machine_id, pid_path), pid.to_string().into_bytes());
        }
        return (String::new(), 0);
    }
    (String::new(), 0)
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn exec(
        &self,
        machine: &MachineProfile,
        command: &str,
    ) -> Result<ExecOutput, ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(ChannelError::Connect {
                host: machine.host.clone(),
                port: machine.port,
                reason: "connection refused".to_string(),
            });
        }
        state.commands.push((machine.id, command.to_string()));

        let mut stdout = String::new();
        let mut status = 0;
        for part in command.split("&&") {
            let (out, code) = run_part(&mut state, machine.id, part);
            stdout = out;
            status = code;
            if code != 0 {
                break;
            }
        }
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            status,
        })
    }

    async fn write_file(
        &self,
        machine: &MachineProfile,
        path: &str,
        content: &[u8],
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(ChannelError::Connect {
                host: machine.host.clone(),
                port: machine.port,
                reason: "connection refused".to_string(),
            });
        }
        state
            .files
            .insert((machine.id, path.to_string()), content.to_vec());
        Ok(())
    }

    async fn read_file(
        &self,
        machine: &MachineProfile,
        path: &str,
    ) -> Result<Vec<u8>, ChannelError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(ChannelError::Connect {
                host: machine.host.clone(),
                port: machine.port,
                reason: "connection refused".to_string(),
            });
        }
        state
            .files
            .get(&(machine.id, path.to_string()))
            .cloned()
            .ok_or_else(|| ChannelError::Transfer {
                path: path.to_string(),
                reason: "no such file".to_string(),
            })
    }
}

/// Machine directory backed by a fixed map.
pub struct StaticMachines {
    machines: HashMap<i64, MachineProfile>,
}

impl StaticMachines {
    pub fn with_machines(count: i64) -> Self {
        let machines = (1..=count)
            .map(|id| {
                (
                    id,
                    MachineProfile {
                        id,
                        name: format!("node-{id}"),
                        host: format!("10.0.0.{id}"),
                        port: 22,
                        username: "deploy".to_string(),
                        password: Some("secret".to_string()),
                        private_key: None,
                        passphrase: None,
                    },
                )
            })
            .collect();
        Self { machines }
    }
}

#[async_trait]
impl MachineDirectory for StaticMachines {
    async fn machine(&self, machine_id: i64) -> Result<MachineProfile, Error> {
        self.machines
            .get(&machine_id)
            .cloned()
            .ok_or(Error::MachineNotFound(machine_id))
    }
}

/// Everything a test needs, wired over sqlite and the mock channel.
pub struct TestContext {
    pub _tmp: TempDir,
    pub persistence: Arc<dyn Persistence>,
    pub channel: Arc<MockChannel>,
    pub machines: Arc<StaticMachines>,
    pub service: FleetService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: FleetSettings) -> Self {
        init_tracing();
        let tmp = TempDir::new().expect("tempdir");
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::from_path(tmp.path().join("fleet.db"))
                .await
                .expect("sqlite fixture"),
        );
        let channel = Arc::new(MockChannel::new());
        let machines = Arc::new(StaticMachines::with_machines(3));
        let service = FleetService::new(
            Arc::clone(&persistence),
            Arc::clone(&channel) as Arc<dyn RemoteChannel>,
            Arc::clone(&machines) as Arc<dyn MachineDirectory>,
            settings,
        );
        Self {
            _tmp: tmp,
            persistence,
            channel,
            machines,
            service,
        }
    }

    /// Default process spec on machine 1 with a fixed deploy path and full
    /// configuration (no backfill needed).
    pub fn spec(&self, name: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            module_id: 42,
            machine_ids: vec![1],
            deploy_path: Some(format!("/opt/logfleet/{name}")),
            pipeline_config: "input { beats { port => 5044 } }".to_string(),
            jvm_options: Some("-Xms512m\n".to_string()),
            agent_settings: Some("pipeline.workers: 1\n".to_string()),
        }
    }

    pub async fn instance(&self, instance_id: i64) -> InstanceRecord {
        self.persistence
            .get_instance(instance_id)
            .await
            .expect("get_instance")
            .expect("instance exists")
    }

    pub async fn instance_state(&self, instance_id: i64) -> InstanceState {
        self.instance(instance_id)
            .await
            .lifecycle_state()
            .expect("valid state")
    }

    /// Poll until a task of `kind` reaches a terminal status, returning it.
    pub async fn wait_task_settled(&self, instance_id: i64, kind: &str) -> TaskRecord {
        for _ in 0..500 {
            let tasks = self
                .persistence
                .tasks_for_instance(instance_id)
                .await
                .expect("tasks_for_instance");
            if let Some(task) = tasks
                .into_iter()
                .find(|t| t.kind == kind && (t.status == "completed" || t.status == "failed"))
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task '{kind}' for instance {instance_id} never settled");
    }

    /// Poll until the instance reaches the given state.
    pub async fn wait_instance_state(&self, instance_id: i64, state: InstanceState) {
        for _ in 0..500 {
            if self.instance_state(instance_id).await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "instance {instance_id} never reached {state}, is {}",
            self.instance_state(instance_id).await
        );
    }

    /// Create a process through the service and wait until its first
    /// instance finished initializing.
    pub async fn create_settled_process(
        &self,
        name: &str,
    ) -> (logfleet_core::persistence::ProcessRecord, Vec<InstanceRecord>) {
        let (process, instances) = self
            .service
            .create_process(self.spec(name), "ops@example.com")
            .await
            .expect("create_process");
        for instance in &instances {
            self.wait_task_settled(instance.id, "initialize").await;
        }
        (process, instances)
    }

    /// Create, initialize, and start a process; returns it running.
    pub async fn running_process(
        &self,
        name: &str,
    ) -> (logfleet_core::persistence::ProcessRecord, InstanceRecord) {
        let (process, instances) = self.create_settled_process(name).await;
        let batch = self.service.start_process(process.id).await.expect("start");
        assert!(batch.all_succeeded(), "start batch failed: {batch:?}");
        let instance = self.instance(instances[0].id).await;
        assert_eq!(instance.state, "running");
        (process, instance)
    }
}
