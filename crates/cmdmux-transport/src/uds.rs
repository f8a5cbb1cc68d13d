use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// A connected stream over a Unix domain socket.
///
/// `try_clone` yields a second handle onto the same socket, which is how the
/// protocol layer obtains independent reader and writer halves.
pub struct SocketStream {
    inner: UnixStream,
}

impl SocketStream {
    fn new(inner: UnixStream) -> Self {
        Self { inner }
    }

    /// Clone the stream (duplicates the file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::new(self.inner.try_clone()?))
    }

    /// Set a read timeout on the socket.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream").finish_non_exhaustive()
    }
}

/// Unix domain socket listener with stale-socket cleanup.
///
/// The socket file is removed on drop only if it is still the inode this
/// listener created, so a path that was rebound by another process is left
/// alone.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Permission mode applied to created socket paths.
    pub const SOCKET_MODE: u32 = 0o600;

    // sockaddr_un.sun_path is 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem path.
    ///
    /// A pre-existing socket file at `path` is treated as stale and removed;
    /// any other kind of file there is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;

        let created_inode = std::fs::symlink_metadata(&path)
            .ok()
            .map(|m| (m.dev(), m.ino()));

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            listener,
            path,
            created_inode,
        })
    }

    /// Accept the next incoming connection (blocking).
    pub fn accept(&self) -> Result<SocketStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(SocketStream::new(stream))
    }

    /// Connect to a listening socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<SocketStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(SocketStream::new(stream))
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let metadata = std::fs::symlink_metadata(path).map_err(|e| TransportError::Bind {
        path: path.to_path_buf(),
        source: e,
    })?;
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
    std::fs::remove_file(path).map_err(|e| TransportError::Bind {
        path: path.to_path_buf(),
        source: e,
    })
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some((dev, ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
                debug!(path = ?self.path, "removing socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path was replaced; leaving it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use super::*;

    fn temp_sock(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cmdmux-uds-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("cmdmux.sock")
    }

    #[test]
    fn bind_connect_roundtrip() {
        let path = temp_sock("roundtrip");
        let listener = UnixDomainSocket::bind(&path).expect("bind should succeed");

        let client_path = path.clone();
        let client = std::thread::spawn(move || {
            let mut stream =
                UnixDomainSocket::connect(&client_path).expect("connect should succeed");
            stream.write_all(b"ping").expect("write should succeed");
        });

        let mut accepted = listener.accept().expect("accept should succeed");
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).expect("read should succeed");
        assert_eq!(&buf, b"ping");

        client.join().expect("client thread should finish");
        drop(listener);
        assert!(!path.exists(), "socket file removed on drop");
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn rejects_overlong_path() {
        let path = format!("/tmp/{}.sock", "x".repeat(200));
        assert!(matches!(
            UnixDomainSocket::bind(&path),
            Err(TransportError::PathTooLong { .. })
        ));
    }

    #[test]
    fn refuses_to_clobber_regular_file() {
        let path = temp_sock("clobber");
        std::fs::write(&path, b"not a socket").expect("file should be writable");

        assert!(matches!(
            UnixDomainSocket::bind(&path),
            Err(TransportError::Bind { .. })
        ));

        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn bound_socket_has_restricted_mode() {
        let path = temp_sock("mode");
        let listener = UnixDomainSocket::bind(&path).expect("bind should succeed");
        let mode = std::fs::metadata(&path)
            .expect("socket metadata should be readable")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn drop_leaves_replaced_path_alone() {
        let path = temp_sock("replaced");
        let listener = UnixDomainSocket::bind(&path).expect("bind should succeed");

        std::fs::remove_file(&path).expect("socket file should be removable");
        std::fs::write(&path, b"replacement").expect("replacement should be writable");

        drop(listener);
        assert!(path.exists(), "replaced path must survive drop");
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn stale_socket_is_replaced_on_rebind() {
        let path = temp_sock("stale");
        let first = UnixDomainSocket::bind(&path).expect("first bind should succeed");
        // Simulate a crashed process: forget the listener so drop cleanup never runs.
        std::mem::forget(first);

        let second = UnixDomainSocket::bind(&path).expect("rebind over stale socket should work");
        assert_eq!(second.path(), path.as_path());

        drop(second);
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}
