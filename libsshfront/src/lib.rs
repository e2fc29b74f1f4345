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

use std::{fs, io, sync::Mutex};

use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

mod auth;
mod hook;
mod hostkey;
mod pty;
mod server;
mod session;

/// sshfront terminates SSH connections and delegates authentication and
/// command execution to external hook programs.
///
/// These can be directly parsed with clap or manually constructed in
/// order to present some other user interface.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(help = "A command template run for both auth and exec, unless -a is given")]
    pub handler: String,

    #[clap(short = 'H', long, default_value = "0.0.0.0", help = "The host to bind to")]
    pub host: String,

    #[clap(
        short,
        long,
        default_value_t = server::DEFAULT_PORT,
        help = "The port to bind to, overridden by the PORT env var when left at its default"
    )]
    pub port: u16,

    #[clap(
        short = 'k',
        long,
        long_help = "The host key file to load

Defaults to ~/.ssh/id_rsa. PEM blocks of type OPENSSH PRIVATE KEY, RSA
PRIVATE KEY, and EC PRIVATE KEY (P-256) are recognized and installed;
legacy DSA PRIVATE KEY blocks are recognized but rejected with a message
to re-encode them with ssh-keygen. SSH_PRIVATE_KEYS, if set, is used
instead of this flag's file and should contain the PEM-encoded key
material directly. If neither is available, an ephemeral Ed25519 key is
generated."
    )]
    pub host_key: Option<std::path::PathBuf>,

    #[clap(
        short,
        long,
        long_help = "A separate command template used for authentication decisions

Invoked as `<auth-hook> <username> <authorized-keys-line>`. If omitted,
every connection is allowed and the authenticated user's name is simply
echoed back as the USER environment variable."
    )]
    pub auth_hook: Option<String>,

    #[clap(short, long, help = "Tee child stdout/stderr to this process's own stdout")]
    pub debug: bool,

    #[clap(short = 'e', long, help = "Pass this process's environment into hook children")]
    pub pass_env: bool,

    #[clap(
        short,
        long,
        long_help = "Wrap exec commands as `$SHELL -c \"<handler> <command>\"`

A deployment convenience: the handler template and the client's raw
command line are rejoined with a single space before being handed to
the shell, so quoting in the original handler template is not preserved
byte-for-byte."
    )]
    pub shell_wrap: bool,

    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

Logs go to stderr by default, since this is always a foreground server."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,
}

/// Run sshfront with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    init_logging(&args);

    let server_args = server::Args {
        host: args.host,
        port: args.port,
        host_key: args.host_key,
        exec_hook_template: args.handler,
        auth_hook_template: args.auth_hook,
        debug: args.debug,
        pass_env: args.pass_env,
        shell_wrap: args.shell_wrap,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building tokio runtime");

    rt.block_on(server::run(server_args))
}

fn init_logging(args: &Args) {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        if let Ok(file) = fs::File::create(log_file) {
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .init();
}
