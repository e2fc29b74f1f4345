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

//! The auth gate: given a username and an offered public key, decides
//! whether to accept the connection and what extra environment the
//! accepted session should carry.

use russh::keys::PublicKey;
use tracing::{info, instrument, warn};

use crate::hook;

/// Produced by a successful auth decision, threaded into session
/// construction. `russh` has no literal "permissions extensions" map the
/// way the historical SSH library did, so this is carried explicitly
/// through a per-connection `Arc<Mutex<Option<AuthExtensions>>>` rather
/// than a side channel on the transport.
#[derive(Debug, Clone, Default)]
pub struct AuthExtensions {
    pub user: String,
    /// Non-empty lines from the auth hook's stdout, each a
    /// `NAME=VALUE` environment assignment to append to every child
    /// started on the session.
    pub environ: Vec<String>,
}

/// Decide whether to accept `user` offering `key`. Returns the
/// extensions to carry forward on acceptance, or `None` on denial.
#[instrument(skip(auth_hook_template, key))]
pub async fn check(
    auth_hook_template: Option<&str>,
    user: &str,
    key: &PublicKey,
) -> anyhow::Result<Option<AuthExtensions>> {
    let Some(template) = auth_hook_template else {
        return Ok(Some(AuthExtensions { user: user.to_string(), environ: Vec::new() }));
    };

    let marshaled = key.to_openssh().map_err(|e| anyhow::anyhow!("marshaling public key: {e}"))?;
    let marshaled = marshaled.trim().to_string();

    let argv = hook::resolve(template, &[user.to_string(), marshaled])
        .map_err(|e| anyhow::anyhow!("resolving auth hook: {e}"))?;

    // Inherited, intentionally: the auth hook needs to be able to read
    // operator-provided config (e.g. an API token) from the environment.
    let inherited_env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let result = hook::run_collect(&argv, &inherited_env).await?;
    if result.exit_code != 0 {
        info!(user, exit_code = result.exit_code, "auth hook denied connection");
        return Ok(None);
    }

    let environ = parse_environ(&result.merged_output);
    Ok(Some(AuthExtensions { user: user.to_string(), environ }))
}

/// Split the hook's captured stdout into environment assignments: one
/// trailing newline is stripped, then every non-empty line becomes a
/// `NAME=VALUE` entry.
fn parse_environ(output: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(output);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    text.lines().filter(|l| !l.is_empty()).map(|l| l.to_string()).collect()
}
