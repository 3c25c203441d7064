use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vmlink_wire::WireConfig;

use crate::error::{Result, TransportError};
use crate::stream::UnixChannel;

/// Unix domain socket endpoint that hands out [`UnixChannel`]s.
///
/// Stands in for the hypervisor link when both domains are ordinary processes. The socket file
/// is removed on drop unless something else has replaced it in the meantime.
pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    created: (u64, u64),
    config: WireConfig,
}

impl UnixSocketListener {
    /// Permission mode applied to the socket file.
    pub const SOCKET_MODE: u32 = 0o600;

    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen at `path`, replacing a stale socket file if one exists.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_config(path, WireConfig::default())
    }

    /// Bind with the wire configuration applied to every accepted channel.
    pub fn bind_with_config(path: impl AsRef<Path>, config: WireConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path, Self::MAX_PATH_LEN)?;
        remove_stale_socket(&path)?;

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "physical channel socket listening");
        Ok(Self {
            listener,
            created: (metadata.dev(), metadata.ino()),
            path,
            config,
        })
    }

    /// Accept the next connection as a named physical channel (blocking).
    pub fn accept(&self, name: impl Into<String>) -> Result<UnixChannel> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        let name = name.into();
        debug!(pchan = %name, "physical channel accepted");
        UnixChannel::from_unix(name, stream, self.config.clone())
    }

    /// Connect to a listening socket as a named physical channel.
    pub fn connect(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        config: WireConfig,
    ) -> Result<UnixChannel> {
        let stream = connect_stream(path)?;
        UnixChannel::from_unix(name, stream, config)
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Connect a raw stream, for callers that need a second handle (e.g. to shut it down).
pub fn connect_stream(path: impl AsRef<Path>) -> Result<UnixStream> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(?path, "connected to physical channel socket");
    Ok(stream)
}

fn check_path_len(path: &Path, max: usize) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= max {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max,
        });
    }
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(TransportError::Bind {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            ),
        });
    }

    debug!(?path, "removing stale socket");
    std::fs::remove_file(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.created {
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path replaced; leaving it in place");
        }
    }
}
