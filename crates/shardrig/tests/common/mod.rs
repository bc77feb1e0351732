//! Shared helpers: fake server executables for orchestration tests.
//!
//! Real server binaries are not needed to exercise the orchestrator; a
//! shell script that holds its process slot is enough, since readiness is
//! observed through the driver seam.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable script into `dir` and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// A server that ignores its arguments and runs until signalled.
pub fn fake_server(dir: &Path) -> PathBuf {
    write_script(dir, "fake-server", "#!/bin/sh\nexec sleep 600\n")
}

/// A server that crashes shortly after starting.
pub fn crashing_server(dir: &Path) -> PathBuf {
    write_script(dir, "crashing-server", "#!/bin/sh\nsleep 0.2\nexit 3\n")
}

/// A server that refuses the ordinary stop signal and exits nonzero.
pub fn stubborn_server(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "stubborn-server",
        "#!/bin/sh\ntrap 'exit 7' TERM\nwhile :; do sleep 0.2; done\n",
    )
}
