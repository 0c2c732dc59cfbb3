// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH implementation of the logfleet remote command channel.
//!
//! Uses the native ssh2 library for exec and SFTP operations. Each call
//! opens its own authenticated session; the blocking ssh2 API is bridged
//! onto the async runtime with `spawn_blocking`. Authentication prefers a
//! private key when one is present and non-empty, falling back to password.

#![deny(missing_docs)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use async_trait::async_trait;
use ssh2::Session;
use tracing::{debug, trace};

use logfleet_core::channel::{ChannelError, ExecOutput, MachineProfile, RemoteChannel};

/// ssh2-backed [`RemoteChannel`].
#[derive(Debug, Clone, Default)]
pub struct SshChannel;

impl SshChannel {
    /// Create a new SSH channel.
    pub fn new() -> Self {
        Self
    }
}

fn open_session(machine: &MachineProfile) -> Result<Session, ChannelError> {
    let tcp = TcpStream::connect(format!("{}:{}", machine.host, machine.port)).map_err(|e| {
        ChannelError::Connect {
            host: machine.host.clone(),
            port: machine.port,
            reason: e.to_string(),
        }
    })?;

    let mut session = Session::new().map_err(|e| ChannelError::Session(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| ChannelError::Session(format!("SSH handshake failed: {e}")))?;

    let has_private_key = machine
        .private_key
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    let has_password = machine
        .password
        .as_ref()
        .map(|p| !p.is_empty())
        .unwrap_or(false);

    if has_private_key {
        let private_key = machine.private_key.as_deref().unwrap_or_default();
        session
            .userauth_pubkey_memory(
                &machine.username,
                None,
                private_key,
                machine.passphrase.as_deref(),
            )
            .map_err(|e| ChannelError::Auth {
                username: machine.username.clone(),
                host: machine.host.clone(),
                reason: format!("private key authentication failed: {e}"),
            })?;
    } else if has_password {
        let password = machine.password.as_deref().unwrap_or_default();
        session
            .userauth_password(&machine.username, password)
            .map_err(|e| ChannelError::Auth {
                username: machine.username.clone(),
                host: machine.host.clone(),
                reason: format!("password authentication failed: {e}"),
            })?;
    } else {
        return Err(ChannelError::Auth {
            username: machine.username.clone(),
            host: machine.host.clone(),
            reason: "no authentication method provided (need password or private_key)".to_string(),
        });
    }

    if !session.authenticated() {
        return Err(ChannelError::Auth {
            username: machine.username.clone(),
            host: machine.host.clone(),
            reason: "SSH authentication failed".to_string(),
        });
    }

    Ok(session)
}

fn exec_blocking(machine: &MachineProfile, command: &str) -> Result<ExecOutput, ChannelError> {
    let session = open_session(machine)?;
    let mut channel = session
        .channel_session()
        .map_err(|e| ChannelError::Session(format!("failed to open channel: {e}")))?;

    channel
        .exec(command)
        .map_err(|e| ChannelError::Session(format!("failed to execute command: {e}")))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| ChannelError::Session(format!("failed to read stdout: {e}")))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| ChannelError::Session(format!("failed to read stderr: {e}")))?;

    channel
        .wait_close()
        .map_err(|e| ChannelError::Session(format!("failed to close channel: {e}")))?;
    let status = channel
        .exit_status()
        .map_err(|e| ChannelError::Session(format!("failed to read exit status: {e}")))?;

    trace!(host = %machine.host, status, "command executed");
    Ok(ExecOutput {
        stdout,
        stderr,
        status,
    })
}

fn write_file_blocking(
    machine: &MachineProfile,
    path: &str,
    content: &[u8],
) -> Result<(), ChannelError> {
    let session = open_session(machine)?;
    let sftp = session
        .sftp()
        .map_err(|e| ChannelError::Session(format!("failed to open SFTP session: {e}")))?;

    let mut file = sftp.create(Path::new(path)).map_err(|e| ChannelError::Transfer {
        path: path.to_string(),
        reason: format!("failed to create file: {e}"),
    })?;
    file.write_all(content).map_err(|e| ChannelError::Transfer {
        path: path.to_string(),
        reason: format!("failed to write file: {e}"),
    })?;

    debug!(host = %machine.host, path, bytes = content.len(), "file written");
    Ok(())
}

fn read_file_blocking(machine: &MachineProfile, path: &str) -> Result<Vec<u8>, ChannelError> {
    let session = open_session(machine)?;
    let sftp = session
        .sftp()
        .map_err(|e| ChannelError::Session(format!("failed to open SFTP session: {e}")))?;

    let mut file = sftp.open(Path::new(path)).map_err(|e| ChannelError::Transfer {
        path: path.to_string(),
        reason: format!("failed to open file: {e}"),
    })?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| ChannelError::Transfer {
            path: path.to_string(),
            reason: format!("failed to read file: {e}"),
        })?;

    debug!(host = %machine.host, path, bytes = content.len(), "file read");
    Ok(content)
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(
        &self,
        machine: &MachineProfile,
        command: &str,
    ) -> Result<ExecOutput, ChannelError> {
        let machine = machine.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec_blocking(&machine, &command))
            .await
            .map_err(|e| ChannelError::Session(format!("exec task failed: {e}")))?
    }

    async fn write_file(
        &self,
        machine: &MachineProfile,
        path: &str,
        content: &[u8],
    ) -> Result<(), ChannelError> {
        let machine = machine.clone();
        let path = path.to_string();
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || write_file_blocking(&machine, &path, &content))
            .await
            .map_err(|e| ChannelError::Session(format!("write task failed: {e}")))?
    }

    async fn read_file(
        &self,
        machine: &MachineProfile,
        path: &str,
    ) -> Result<Vec<u8>, ChannelError> {
        let machine = machine.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || read_file_blocking(&machine, &path))
            .await
            .map_err(|e| ChannelError::Session(format!("read task failed: {e}")))?
    }
}
