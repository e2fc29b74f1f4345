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

//! Wire sizing for `pty-req`/`window-change`: the kernel IOCTL half of the
//! PTY wire codec. `russh`'s `pty_request`/`window_change_request`
//! callbacks already hand us parsed `col_width`/`row_height` fields, so
//! there is no RFC 4254 payload decoding left to do here.

use std::os::unix::io::RawFd;

use anyhow::Context;
use tracing::warn;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

/// A terminal size as carried on the wire: character columns and rows.
/// Zero in either field means "unknown" and callers should skip sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Size {
    pub cols: u32,
    pub rows: u32,
}

impl Size {
    pub fn is_known(&self) -> bool {
        self.cols != 0 && self.rows != 0
    }

    /// Apply this size to the pty identified by `fd` via `TIOCSWINSZ`.
    /// Note the field order swap: the wire carries width/height, the
    /// kernel struct wants rows/cols first.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let winsz = libc::winsize {
            ws_row: self.rows as u16,
            ws_col: self.cols as u16,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // Safety: winsz is stack allocated and lives for the whole call.
        unsafe {
            tiocswinsz(fd, &winsz).context("setting pty size")?;
        }

        Ok(())
    }
}

/// Apply `size` to `fd`, logging and swallowing any failure rather than
/// propagating it: a failed resize must never tear down the session.
pub fn apply_size(fd: RawFd, size: Size) {
    if !size.is_known() {
        return;
    }
    if let Err(e) = size.set_fd(fd) {
        warn!("failed to apply pty size {:?}: {:?}", size, e);
    }
}
