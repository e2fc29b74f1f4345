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

//! The channel session engine: per-channel state, request dispatch,
//! child-process lifecycle, and stream pumping. This is the core of the
//! whole crate.

use std::{
    collections::HashMap,
    env,
    os::fd::{AsRawFd, RawFd},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use russh::{
    keys::PublicKey,
    server::{Auth, Handle, Msg, Session},
    Channel, ChannelId, CryptoVec, Disconnect,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Child,
    sync::Mutex,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{self, AuthExtensions},
    hook, pty,
};

/// Stream data sent on RFC 4254's extended data channel with type 1
/// ("stderr"), distinct from ordinary channel data.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// How long to wait after SIGHUP before escalating to SIGKILL when a
/// channel tears down mid-execution. Grounded on the teacher's own
/// `Session::kill` grace period for reaping shells (see DESIGN.md).
const CHILD_KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Config {
    pub exec_hook_template: String,
    pub auth_hook_template: Option<String>,
    pub pass_env: bool,
    pub debug: bool,
    pub shell_wrap: bool,
}

struct PtyState {
    raw_fd: RawFd,
    writer: Arc<Mutex<tokio::io::WriteHalf<pty_process::Pty>>>,
}

/// Per-channel state, serialized by `lock`. Mirrors the `SessionHandler`
/// data model: `env` is append-only, `pty` is set at most once, and
/// `child_pid` tracks whatever is currently running so a mid-flight
/// disconnect can reap it. `exited`, set the instant `run_to_exit`'s
/// `child.wait()` resolves, lets a concurrent `reap()` tell a child that
/// has already been waited on (whose pid the kernel may have since
/// recycled) from one that's genuinely still running, so it never
/// signals a pid after we know it no longer refers to our child.
struct ChannelState {
    env: Vec<String>,
    pty: Option<PtyState>,
    child_pid: Option<i32>,
    exited: Option<Arc<AtomicBool>>,
    stdin: Option<Arc<Mutex<tokio::process::ChildStdin>>>,
}

impl ChannelState {
    fn new(env: Vec<String>) -> Self {
        ChannelState { env, pty: None, child_pid: None, exited: None, stdin: None }
    }
}

/// The `russh::server::Handler` for one SSH connection. Channel-level
/// state lives behind `Arc<Mutex<ChannelState>>` so request handlers can
/// detach work onto spawned tasks without holding the handler itself
/// (and therefore the whole connection) hostage.
pub struct SshHandler {
    config: Arc<Config>,
    auth: Arc<Mutex<Option<AuthExtensions>>>,
    channels: HashMap<ChannelId, Arc<Mutex<ChannelState>>>,
}

impl SshHandler {
    pub fn new(config: Arc<Config>) -> Self {
        SshHandler { config, auth: Arc::new(Mutex::new(None)), channels: HashMap::new() }
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    #[instrument(skip(self, key))]
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        match auth::check(self.auth_hook_template(), user, key).await? {
            Some(extensions) => {
                *self.auth.lock().await = Some(extensions);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject { proceed_with_methods: None }),
        }
    }

    #[instrument(skip(self))]
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.auth_hook_template().is_some() {
            return Ok(Auth::Reject { proceed_with_methods: None });
        }
        *self.auth.lock().await = Some(AuthExtensions { user: user.to_string(), environ: Vec::new() });
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject { proceed_with_methods: None })
    }

    #[instrument(skip(self, channel, session))]
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let extensions = self.auth.lock().await.clone().unwrap_or_default();

        let mut env = if self.config.pass_env {
            env::vars().map(|(k, v)| format!("{k}={v}")).collect()
        } else {
            Vec::new()
        };
        for line in &extensions.environ {
            env.push(line.clone());
        }
        env.push(format!("USER={}", extensions.user));

        let id = channel.id();
        self.channels.insert(id, Arc::new(Mutex::new(ChannelState::new(env))));
        let _ = session;
        Ok(true)
    }

    #[instrument(skip(self, data, session))]
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            state.lock().await.env.push(format!("{variable_name}={variable_value}"));
        }
        session.channel_success(channel);
        Ok(())
    }

    #[instrument(skip(self, _modes, session))]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = pix_width;
        let _ = pix_height;
        let Some(state) = self.channels.get(&channel).cloned() else {
            session.channel_failure(channel);
            return Ok(());
        };

        let size = pty::Size { cols: col_width, rows: row_height };
        let config = Arc::clone(&self.config);
        let handle = session.handle();

        tokio::spawn(async move {
            let mut guard = state.lock().await;
            if guard.pty.is_some() || guard.child_pid.is_some() {
                handle.channel_failure(channel).await.ok();
                return;
            }

            let argv = match hook::resolve(&config.exec_hook_template, &[]) {
                Ok(argv) => argv,
                Err(e) => {
                    warn!("resolving pty-req hook: {:?}", e);
                    handle.channel_failure(channel).await.ok();
                    return;
                }
            };
            let env_snapshot = guard.env.clone();

            match spawn_pty_child(&argv, &env_snapshot, size) {
                Ok((child, raw_fd, writer, mut reader)) => {
                    guard.child_pid = child.id().map(|p| p as i32);
                    guard.pty = Some(PtyState { raw_fd, writer });
                    let exited = Arc::new(AtomicBool::new(false));
                    guard.exited = Some(Arc::clone(&exited));
                    drop(guard);

                    handle.channel_success(channel).await.ok();

                    let reader_handle = handle.clone();
                    let debug = config.debug;
                    let pty_pump = tokio::spawn(async move {
                        let mut buf = [0u8; 16 * 1024];
                        loop {
                            let n = match reader.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            if debug {
                                let mut stdout = tokio::io::stdout();
                                let _ = stdout.write_all(&buf[..n]).await;
                            }
                            if reader_handle
                                .data(channel, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });

                    run_to_exit(child, channel, handle, &exited, vec![pty_pump]).await;

                    let mut guard = state.lock().await;
                    guard.child_pid = None;
                    guard.pty = None;
                    guard.exited = None;
                }
                Err(e) => {
                    warn!("spawning pty child failed: {:?}", e);
                    handle
                        .extended_data(
                            channel,
                            SSH_EXTENDED_DATA_STDERR,
                            CryptoVec::from_slice(b"Internal error.\n"),
                        )
                        .await
                        .ok();
                    handle.channel_failure(channel).await.ok();
                }
            }
        });

        Ok(())
    }

    #[instrument(skip(self, session))]
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            let guard = state.lock().await;
            if let Some(pty_state) = &guard.pty {
                pty::apply_size(pty_state.raw_fd, pty::Size { cols: col_width, rows: row_height });
            }
        }
        Ok(())
    }

    #[instrument(skip(self, session))]
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_exec(channel, &[], session).await
    }

    #[instrument(skip(self, data, session))]
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_exec(channel, data, session).await
    }

    #[instrument(skip(self, data, session))]
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get(&channel) else { return Ok(()) };
        let guard = state.lock().await;
        if let Some(pty_state) = &guard.pty {
            let writer = Arc::clone(&pty_state.writer);
            let data = data.to_vec();
            drop(guard);
            let _ = writer.lock().await.write_all(&data).await;
        } else if let Some(stdin) = &guard.stdin {
            let stdin = Arc::clone(stdin);
            let data = data.to_vec();
            drop(guard);
            let _ = stdin.lock().await.write_all(&data).await;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.reap(channel).await;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            state.lock().await.stdin = None;
        }
        Ok(())
    }

    // --- Everything below is a Non-goal: loudly reject rather than
    // silently ignore, per the "whitelist known requests" idiom.

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        _signal_name: russh::Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        session.disconnect(Disconnect::ByApplication, "port forwarding is not supported", "en");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        session.disconnect(Disconnect::ByApplication, "direct-tcpip is not supported", "en");
        Ok(false)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        session.channel_failure(channel);
        Ok(false)
    }
}

impl SshHandler {
    fn auth_hook_template(&self) -> Option<&str> {
        // Populated from the CLI's `-a/--auth-hook` flag through `Config`;
        // see `server::Server::new_client`.
        self.config.auth_hook_template.as_deref()
    }

    async fn reap(&mut self, channel: ChannelId) {
        let Some(state) = self.channels.remove(&channel) else { return };
        let guard = state.lock().await;
        let Some(pid) = guard.child_pid else { return };
        let exited = guard.exited.clone();
        drop(guard);
        reap_child(pid, exited).await;
    }

    async fn start_exec(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let Some(state) = self.channels.get(&channel).cloned() else {
            session.channel_failure(channel);
            return Ok(());
        };
        let config = Arc::clone(&self.config);
        let handle = session.handle();
        let raw_cmdline = String::from_utf8_lossy(data).to_string();

        tokio::spawn(async move {
            let mut guard = state.lock().await;
            // A PTY or a child already occupying this channel makes it
            // busy; mirrors `pty_request`'s own guard against a second
            // occupant, since the lock below is released well before the
            // child exits and so cannot itself serialize against a second
            // `start_exec`/`pty_request` call.
            if guard.pty.is_some() || guard.child_pid.is_some() {
                handle.channel_failure(channel).await.ok();
                return;
            }

            let argv = match build_exec_argv(&config, &raw_cmdline) {
                Ok(argv) => argv,
                Err(e) => {
                    warn!("malformed exec command line: {:?}", e);
                    handle.close(channel).await.ok();
                    return;
                }
            };

            let mut env = guard.env.clone();
            if !raw_cmdline.is_empty() {
                env.push(format!("SSH_ORIGINAL_COMMAND={raw_cmdline}"));
            }

            match hook::spawn(&argv, &env, (Stdio::piped(), Stdio::piped(), Stdio::piped())) {
                Ok(mut child) => {
                    guard.child_pid = child.id().map(|p| p as i32);
                    let stdin = child.stdin.take().map(|s| Arc::new(Mutex::new(s)));
                    guard.stdin = stdin;
                    let exited = Arc::new(AtomicBool::new(false));
                    guard.exited = Some(Arc::clone(&exited));
                    let stdout = child.stdout.take().expect("stdout piped");
                    let stderr = child.stderr.take().expect("stderr piped");
                    // Released before the child's lifetime begins, so
                    // `channel_close` can concurrently acquire this same
                    // lock and signal a child that's still running instead
                    // of blocking behind it until it exits on its own.
                    drop(guard);

                    handle.channel_success(channel).await.ok();

                    let out_done = pump_stream(stdout, channel, handle.clone(), config.debug, false);
                    let err_done = pump_stream(stderr, channel, handle.clone(), config.debug, true);

                    run_to_exit(child, channel, handle, &exited, vec![out_done, err_done]).await;

                    let mut guard = state.lock().await;
                    guard.child_pid = None;
                    guard.stdin = None;
                    guard.exited = None;
                }
                Err(e) => {
                    warn!("spawning exec hook failed: {:?}", e);
                    handle
                        .extended_data(
                            channel,
                            SSH_EXTENDED_DATA_STDERR,
                            CryptoVec::from_slice(b"Internal error.\n"),
                        )
                        .await
                        .ok();
                    handle.close(channel).await.ok();
                }
            }
        });

        Ok(())
    }
}

/// Build the argv for an `exec`/`shell` request, honoring shell-wrap mode.
/// `raw_cmdline` is empty for `shell`.
fn build_exec_argv(config: &Config, raw_cmdline: &str) -> anyhow::Result<Vec<String>> {
    if config.shell_wrap {
        let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        // Tokens are rejoined with single spaces: lossy with respect to the
        // original template's own quoting, documented in DESIGN.md.
        let joined = if raw_cmdline.is_empty() {
            config.exec_hook_template.clone()
        } else {
            format!("{} {}", config.exec_hook_template, raw_cmdline)
        };
        return Ok(vec![shell, "-c".to_string(), joined]);
    }

    let cmd_args = if raw_cmdline.is_empty() {
        Vec::new()
    } else {
        shell_words::split(raw_cmdline).context("splitting exec command line")?
    };
    hook::resolve(&config.exec_hook_template, &cmd_args).map_err(anyhow::Error::from)
}

fn spawn_pty_child(
    argv: &[String],
    env: &[String],
    size: pty::Size,
) -> anyhow::Result<(
    tokio::process::Child,
    RawFd,
    Arc<Mutex<tokio::io::WriteHalf<pty_process::Pty>>>,
    tokio::io::ReadHalf<pty_process::Pty>,
)> {
    let mut master = pty_process::Pty::new().context("opening pty")?;
    let raw_fd = master.as_raw_fd();
    pty::apply_size(raw_fd, size);
    let pts = master.pts().context("opening pty slave")?;

    let mut cmd = pty_process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env_clear();
    for assignment in env {
        if let Some((name, value)) = assignment.split_once('=') {
            cmd.env(name, value);
        }
    }

    let child = cmd.spawn(&pts).context("spawning pty child")?;
    let (reader, writer) = tokio::io::split(master);
    Ok((child, raw_fd, Arc::new(Mutex::new(writer)), reader))
}

fn pump_stream(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    channel: ChannelId,
    handle: Handle,
    debug: bool,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if debug {
                let mut stdout = tokio::io::stdout();
                let _ = stdout.write_all(&buf[..n]).await;
            }
            let sent = if is_stderr {
                handle.extended_data(channel, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(&buf[..n])).await
            } else {
                handle.data(channel, CryptoVec::from_slice(&buf[..n])).await
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

/// Wait for `child` to exit, mark `exited` so a concurrent `reap()` knows
/// this pid is no longer ours to signal, drain `stream_pumps` so buffered
/// output already sitting in the pipe/pty isn't lost, then emit the
/// `exit-status` protocol and close the channel. Output must be fully
/// drained before `exit-status`/close go out, or a client can see the
/// channel close before it has seen the child's last bytes.
async fn run_to_exit(
    mut child: Child,
    channel: ChannelId,
    handle: Handle,
    exited: &AtomicBool,
    stream_pumps: Vec<tokio::task::JoinHandle<()>>,
) {
    let status = child.wait().await;
    exited.store(true, Ordering::SeqCst);
    for pump in stream_pumps {
        let _ = pump.await;
    }
    match status {
        Ok(status) => {
            let code = hook::exit_code_of(&status);
            handle.exit_status_request(channel, code).await.ok();
        }
        Err(e) => {
            warn!("waiting on child failed: {:?}", e);
        }
    }
    handle.close(channel).await.ok();
}

/// SIGHUP, then SIGKILL after a grace period if the child hasn't
/// exited. Mirrors the teacher's own `Session::kill` policy for reaping
/// a shell whose controlling session has gone away.
///
/// `exited` is checked before every signal: once `run_to_exit` has
/// already waited on this pid, the kernel is free to recycle it for an
/// unrelated process, so a `None`/stale `exited` observation must never
/// be treated as "go ahead and signal" once the flag says otherwise.
async fn reap_child(pid: i32, exited: Option<Arc<AtomicBool>>) {
    let already_exited = || exited.as_ref().is_some_and(|e| e.load(Ordering::SeqCst));
    if already_exited() {
        return;
    }

    let nix_pid = Pid::from_raw(pid);
    if let Err(e) = signal::kill(nix_pid, Signal::SIGHUP) {
        warn!("sending SIGHUP to child {}: {:?}", pid, e);
        return;
    }

    tokio::time::sleep(CHILD_KILL_GRACE).await;

    if already_exited() {
        return;
    }

    // A reap race (the child may have exited and been waited on between
    // the check above and here) makes ESRCH an expected outcome here,
    // not an error.
    match signal::kill(nix_pid, None) {
        Ok(()) => {
            info!("child {} failed to exit within kill timeout, sending SIGKILL", pid);
            signal::kill(nix_pid, Signal::SIGKILL).ok();
        }
        Err(_) => { /* already gone */ }
    }
}
