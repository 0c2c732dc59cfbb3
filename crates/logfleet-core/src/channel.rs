// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command channel abstraction.
//!
//! The core never talks to a machine directly; it goes through
//! [`RemoteChannel`], an opaque capability that can execute a shell command
//! or move file content. The concrete SSH implementation lives in
//! `logfleet-ssh`; tests script a mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

/// Errors from remote channel operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// TCP connection to the machine failed.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// SSH authentication failed.
    #[error("authentication failed for {username}@{host}: {reason}")]
    Auth {
        /// Login user.
        username: String,
        /// Target host.
        host: String,
        /// Underlying failure.
        reason: String,
    },

    /// A command ran but exited non-zero.
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed {
        /// The command that was executed.
        command: String,
        /// Remote exit status.
        status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// File upload/download failed.
    #[error("file transfer failed for {path}: {reason}")]
    Transfer {
        /// Remote path involved.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// Session-level failure (handshake, channel open, I/O).
    #[error("session error: {0}")]
    Session(String),
}

/// Output of one remote command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Remote exit status.
    pub status: i32,
}

/// Connection parameters for one managed machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Machine id, as referenced by instance rows.
    pub id: i64,
    /// Human-readable machine name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port (default 22).
    pub port: u16,
    /// Login user; also anchors relative deploy base directories.
    pub username: String,
    /// Password for authentication (optional, use if no private key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key for authentication (PEM format, optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Passphrase for the private key (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Authenticated remote shell/file-transfer capability.
///
/// Calls are blocking I/O from the remote machine's perspective and are the
/// only operations in the core expected to suspend for long.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a shell command on the machine, capturing output.
    async fn exec(&self, machine: &MachineProfile, command: &str)
    -> Result<ExecOutput, ChannelError>;

    /// Write `content` to an absolute path on the machine.
    async fn write_file(
        &self,
        machine: &MachineProfile,
        path: &str,
        content: &[u8],
    ) -> Result<(), ChannelError>;

    /// Read the content of an absolute path on the machine.
    async fn read_file(&self, machine: &MachineProfile, path: &str)
    -> Result<Vec<u8>, ChannelError>;
}

/// Execute a command and return trimmed stdout, treating a non-zero exit
/// status as a [`ChannelError::CommandFailed`].
pub async fn exec_ok(
    channel: &dyn RemoteChannel,
    machine: &MachineProfile,
    command: &str,
) -> Result<String, ChannelError> {
    let output = channel.exec(machine, command).await?;
    if output.status != 0 {
        return Err(ChannelError::CommandFailed {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr,
        });
    }
    Ok(output.stdout.trim().to_string())
}

/// Resolves machine connection parameters by id.
///
/// Machine CRUD is an external collaborator; the core only looks profiles up.
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    /// Look up the connection profile for `machine_id`.
    async fn machine(&self, machine_id: i64) -> Result<MachineProfile, Error>;
}

/// Probe a machine's connectivity with a trivial command.
///
/// Used as a pre-flight check before provisioning or starting instances so
/// that an unreachable machine surfaces as a validation-time error instead of
/// a failed task.
pub async fn validate_connection(
    channel: &dyn RemoteChannel,
    machine: &MachineProfile,
) -> Result<(), Error> {
    exec_ok(channel, machine, "echo connected")
        .await
        .map_err(|e| {
            Error::Validation(format!(
                "machine '{}' ({}) is not reachable: {}",
                machine.name, machine.host, e
            ))
        })?;
    Ok(())
}
