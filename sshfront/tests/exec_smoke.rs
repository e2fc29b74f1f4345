// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests that drive a real `sshfront` subprocess with a real
//! `russh` client, covering the exec scenarios from the testable
//! properties: exec success, exec failure, and quoted word-splitting.

use std::{process::Stdio, sync::Arc, time::Duration};

use rand_core::OsRng;
use russh::{client, keys::PrivateKeyWithHashAlg, ChannelMsg};
use ssh_key::PrivateKey;
use tokio::{io::AsyncBufReadExt, process::Command};

mod support;

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // sshfront mints a fresh ephemeral host key on every run when none
        // is configured; these tests have no prior knowledge to pin it to.
        Ok(true)
    }
}

/// Spawns `sshfront` bound to loopback with the given handler template,
/// waits for its log to report it is listening, and returns the child
/// process plus the port it bound.
async fn spawn_sshfront(handler: &str) -> anyhow::Result<(tokio::process::Child, u16)> {
    let port = support::test_port();
    let mut child = Command::new(support::sshfront_bin())
        .arg("-H")
        .arg("127.0.0.1")
        .arg("-p")
        .arg(port.to_string())
        .arg("-vv")
        .arg(handler)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr = child.stderr.take().expect("stderr piped");
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("starting sshfront") {
                return;
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("sshfront never logged that it was starting"))?;

    // Let the TCP listener actually come up after the log line fires.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Ok((child, port))
}

async fn connect(port: u16) -> anyhow::Result<client::Handle<TestClient>> {
    let config = Arc::new(client::Config::default());
    support::retry_connect(|| async {
        client::connect(config.clone(), ("127.0.0.1", port), TestClient)
            .await
            .map_err(anyhow::Error::from)
    })
    .await
}

async fn authenticated(port: u16) -> anyhow::Result<client::Handle<TestClient>> {
    let mut session = connect(port).await?;
    let key_pair = PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519)?;
    let auth_res = session
        .authenticate_publickey(
            "testuser",
            PrivateKeyWithHashAlg::new(Arc::new(key_pair), session.best_supported_rsa_hash().await?.flatten()),
        )
        .await?;
    if !auth_res.success() {
        anyhow::bail!("sshfront rejected a publickey offer even though no auth hook is configured");
    }
    Ok(session)
}

async fn exec(session: &mut client::Handle<TestClient>, command: &str) -> anyhow::Result<(Vec<u8>, u32)> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut out = Vec::new();
    let mut code = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => out.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status),
            _ => {}
        }
    }
    let code = code.ok_or_else(|| anyhow::anyhow!("channel closed without an exit-status"))?;
    Ok((out, code))
}

#[tokio::test]
async fn exec_success_echoes_and_exits_zero() -> anyhow::Result<()> {
    let (child, port) = spawn_sshfront("/bin/echo").await?;
    let mut session = authenticated(port).await?;

    let (out, code) = exec(&mut session, "hello world").await?;
    assert_eq!(String::from_utf8_lossy(&out), "hello world\n");
    assert_eq!(code, 0);
    support::stop(child).await;
    Ok(())
}

#[tokio::test]
async fn exec_propagates_nonzero_exit_status() -> anyhow::Result<()> {
    let (child, port) = spawn_sshfront("/bin/sh").await?;
    let mut session = authenticated(port).await?;

    // The quoted argument exercises shlex word-splitting: it must arrive
    // at /bin/sh as one argument, "exit 7", not two.
    let (_out, code) = exec(&mut session, "-c \"exit 7\"").await?;
    assert_eq!(code, 7);
    support::stop(child).await;
    Ok(())
}

#[tokio::test]
async fn env_request_reaches_the_child_environment() -> anyhow::Result<()> {
    let (child, port) = spawn_sshfront("/usr/bin/env").await?;
    let mut session = authenticated(port).await?;

    let mut channel = session.channel_open_session().await?;
    channel.set_env(true, "GREETING", "hi-there").await?;
    channel.exec(true, "").await?;

    let mut out = Vec::new();
    while let Some(msg) = channel.wait().await {
        if let ChannelMsg::Data { ref data } = msg {
            out.extend_from_slice(data);
        }
    }
    let text = String::from_utf8_lossy(&out);
    assert!(text.lines().any(|l| l == "GREETING=hi-there"));
    assert!(text.lines().any(|l| l == "USER=testuser"));
    support::stop(child).await;
    Ok(())
}
