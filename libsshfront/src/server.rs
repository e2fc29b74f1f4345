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

//! The connection driver: binds a TCP listener and, for every accepted
//! connection, runs the SSH handshake and hands it off to a fresh
//! [`SshHandler`].

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing::{error, info, instrument};

use crate::{hostkey, session};

pub struct Args {
    pub host: String,
    pub port: u16,
    pub host_key: Option<std::path::PathBuf>,
    pub exec_hook_template: String,
    pub auth_hook_template: Option<String>,
    pub debug: bool,
    pub pass_env: bool,
    pub shell_wrap: bool,
}

#[derive(Clone)]
struct Server {
    config: Arc<session::Config>,
}

impl russh::server::Server for Server {
    type Handler = session::SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(?peer_addr, "accepted connection");
        session::SshHandler::new(Arc::clone(&self.config))
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!("session error: {:?}", error);
    }
}

/// Resolve `host:port`, honoring the `SSHFRONT_LISTEN` override (replaces
/// the whole address) and the `PORT` override (replaces the port only,
/// and only when the caller left it at its default).
fn resolve_listen_addr(host: &str, port: u16, port_is_default: bool) -> String {
    if let Ok(listen) = env::var("SSHFRONT_LISTEN") {
        return listen;
    }
    if port_is_default {
        if let Ok(port_override) = env::var("PORT") {
            return format!("{host}:{port_override}");
        }
    }
    format!("{host}:{port}")
}

pub const DEFAULT_PORT: u16 = 22;

#[instrument(skip(args))]
pub async fn run(args: Args) -> anyhow::Result<()> {
    let keys = hostkey::resolve(args.host_key.as_deref())?;

    let mut russh_config = russh::server::Config::default();
    russh_config.keys = keys;
    russh_config.inactivity_timeout = None;
    let russh_config = Arc::new(russh_config);

    let config = Arc::new(session::Config {
        exec_hook_template: args.exec_hook_template,
        auth_hook_template: args.auth_hook_template,
        pass_env: args.pass_env,
        debug: args.debug,
        shell_wrap: args.shell_wrap,
    });

    let listen_addr = resolve_listen_addr(&args.host, args.port, args.port == DEFAULT_PORT);
    info!(addr = %listen_addr, "starting sshfront");

    let mut server = Server { config };
    russh::server::Server::run_on_address(&mut server, russh_config, listen_addr)
        .await
        .context("running ssh server")
}
