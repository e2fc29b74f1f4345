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
/// sshfront is an SSH protocol front door that terminates client
/// connections and delegates authentication and command execution to
/// external hook programs.
use clap::Parser;

/// Historical usage-error exit code (`EX_USAGE`), preserved from the
/// original implementation's CLI behavior.
const EX_USAGE: i32 = 64;

fn main() {
    let args = match libsshfront::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;
            e.print().ok();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                _ => std::process::exit(EX_USAGE),
            }
        }
    };

    if let Err(err) = libsshfront::run(args) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
