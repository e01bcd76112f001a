use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tempfile::TempDir;

// Turn a client-declared bind address of the form "/<host>/<port>" into its
// rendezvous (host, port) pair. The port segment is returned verbatim so that
// the registration and lookup paths derive identical socket names.
pub(crate) fn parse_bind_address(bind_address: &str) -> Option<(&str, &str)> {
    let (host, port) = bind_address
        .strip_prefix('/')
        .unwrap_or(bind_address)
        .split_once('/')?;
    match port.parse::<u32>() {
        Ok(number) if number > 0 => Some((host, port)),
        _ => None,
    }
}

// Split a proxy-side "host:port" target. Unlike bind addresses, the port is
// not validated numerically; an unknown port simply never matches a socket.
pub(crate) fn parse_target(target: &str) -> Option<(&str, &str)> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() => Some((host, port)),
        _ => None,
    }
}

// Scratch directory under which every registered endpoint materializes as a
// Unix socket named `<host>_<port>.sock`.
pub(crate) struct RendezvousDirectory {
    root: PathBuf,
    // Keeps an auto-created temporary directory alive as long as the server.
    _temp: Option<TempDir>,
}

impl RendezvousDirectory {
    pub(crate) fn new(directory: Option<PathBuf>) -> anyhow::Result<Self> {
        match directory {
            Some(root) => {
                // An existing directory keeps its permissions; the mode only
                // applies to directories created here.
                if !root.is_dir() {
                    fs::create_dir_all(&root)
                        .with_context(|| "Error creating rendezvous directory")?;
                    fs::set_permissions(&root, fs::Permissions::from_mode(0o777))
                        .with_context(|| "Error setting rendezvous directory permissions")?;
                }
                Ok(RendezvousDirectory { root, _temp: None })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("srp")
                    .tempdir()
                    .with_context(|| "Error creating temporary rendezvous directory")?;
                Ok(RendezvousDirectory {
                    root: temp.path().to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }

    // Socket path acting as the rendezvous key for a (host, port) pair.
    // The host cannot contain a path separator, so the result is always a
    // direct child of the scratch directory.
    pub(crate) fn socket_path(&self, host: &str, port: &str) -> PathBuf {
        self.root.join(format!("{host}_{port}.sock"))
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }
}
