//! # Native Library Registry
//!
//! Kernels sometimes live in shared libraries that have to be mapped into the
//! process before they can be resolved. [`LibraryRegistry`] owns every handle
//! opened this way and closes them together.
//!
//! Unloading is best-effort: every handle is closed in registration order even
//! if an earlier one fails, the registry ends up empty either way, and all
//! failures are reported together.

use std::ffi::{c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{info, warn};

use crate::error::{LaunchError, Result};

/// Opens and closes native library handles.
pub trait LibraryLoader {
    type Handle;

    fn open(&mut self, path: &Path) -> Result<Self::Handle>;

    /// Closes `handle`, returning a description of the failure if any.
    fn close(&mut self, handle: Self::Handle) -> std::result::Result<(), String>;
}

/// Handle returned by `dlopen`.
#[derive(Debug)]
pub struct DlHandle(NonNull<c_void>);

// Safety: a dlopen handle is a process-wide token, not tied to a thread.
unsafe impl Send for DlHandle {}

/// Loader backed by `dlopen`/`dlclose`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlLoader;

impl DlLoader {
    fn last_error() -> String {
        // Safety: dlerror returns a thread-local C string or null.
        unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "unknown dynamic loader error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }
}

impl LibraryLoader for DlLoader {
    type Handle = DlHandle;

    fn open(&mut self, path: &Path) -> Result<DlHandle> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            LaunchError::LibraryOpen {
                path: path.to_path_buf(),
                message: "path contains an interior NUL byte".to_string(),
            }
        })?;

        let raw = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_GLOBAL) };
        NonNull::new(raw)
            .map(DlHandle)
            .ok_or_else(|| LaunchError::LibraryOpen {
                path: path.to_path_buf(),
                message: Self::last_error(),
            })
    }

    fn close(&mut self, handle: DlHandle) -> std::result::Result<(), String> {
        let rc = unsafe { libc::dlclose(handle.0.as_ptr()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Self::last_error())
        }
    }
}

/// Owned, ordered set of opened libraries.
pub struct LibraryRegistry<L: LibraryLoader = DlLoader> {
    loader: L,
    handles: Vec<(PathBuf, L::Handle)>,
}

impl LibraryRegistry<DlLoader> {
    pub fn new() -> Self {
        Self::with_loader(DlLoader)
    }
}

impl Default for LibraryRegistry<DlLoader> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LibraryLoader> LibraryRegistry<L> {
    pub fn with_loader(loader: L) -> Self {
        Self {
            loader,
            handles: Vec::new(),
        }
    }

    /// Opens the shared library at `path` and keeps its handle.
    pub fn load_lib_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let handle = self.loader.open(path)?;
        info!("Loaded library {}", path.display());
        self.handles.push((path.to_path_buf(), handle));
        Ok(self)
    }

    /// Loading a library by name has no backing facility.
    pub fn load_lib(&mut self, _name: &str) -> Result<&mut Self> {
        Err(LaunchError::NotImplemented("loading a library by name"))
    }

    /// Closes every handle in registration order and empties the registry.
    pub fn unload_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for (path, handle) in self.handles.drain(..) {
            if let Err(message) = self.loader.close(handle) {
                warn!("Failed to close library {}: {}", path.display(), message);
                failures.push((path, message));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LaunchError::LibraryClose { failures })
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Paths of the loaded libraries, in registration order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.handles.iter().map(|(p, _)| p.as_path())
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

impl<L: LibraryLoader> Drop for LibraryRegistry<L> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            // Failures are already logged by unload_all.
            let _ = self.unload_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Loader that hands out numbered handles and can refuse to close some.
    #[derive(Default)]
    struct FakeLoader {
        next: u32,
        closed: Vec<u32>,
        refuse_close: Vec<u32>,
        missing: Vec<PathBuf>,
    }

    impl LibraryLoader for FakeLoader {
        type Handle = u32;

        fn open(&mut self, path: &Path) -> Result<u32> {
            if self.missing.iter().any(|m| m == path) {
                return Err(LaunchError::LibraryOpen {
                    path: path.to_path_buf(),
                    message: "no such file".into(),
                });
            }
            self.next += 1;
            Ok(self.next)
        }

        fn close(&mut self, handle: u32) -> std::result::Result<(), String> {
            self.closed.push(handle);
            if self.refuse_close.contains(&handle) {
                Err(format!("handle {} busy", handle))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_unload_all_on_empty_registry() {
        let mut reg = LibraryRegistry::with_loader(FakeLoader::default());
        reg.unload_all().unwrap();
        assert!(reg.is_empty());
        assert!(reg.loader().closed.is_empty());
    }

    #[test]
    fn test_unload_all_closes_in_order() {
        let mut reg = LibraryRegistry::with_loader(FakeLoader::default());
        reg.load_lib_file("/opt/a.so")
            .unwrap()
            .load_lib_file("/opt/b.so")
            .unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(
            reg.paths().collect::<Vec<_>>(),
            vec![Path::new("/opt/a.so"), Path::new("/opt/b.so")]
        );

        reg.unload_all().unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.loader().closed, vec![1, 2]);
    }

    #[test]
    fn test_unload_all_continues_after_failure() {
        let loader = FakeLoader {
            refuse_close: vec![1],
            ..Default::default()
        };
        let mut reg = LibraryRegistry::with_loader(loader);
        reg.load_lib_file("/opt/a.so").unwrap();
        reg.load_lib_file("/opt/b.so").unwrap();

        let err = reg.unload_all().unwrap_err();
        assert_eq!(
            err,
            LaunchError::LibraryClose {
                failures: vec![(PathBuf::from("/opt/a.so"), "handle 1 busy".into())]
            }
        );
        // The second handle was still closed and nothing is left behind.
        assert_eq!(reg.loader().closed, vec![1, 2]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_failed_open_is_not_registered() {
        let loader = FakeLoader {
            missing: vec![PathBuf::from("/nope.so")],
            ..Default::default()
        };
        let mut reg = LibraryRegistry::with_loader(loader);
        assert!(matches!(
            reg.load_lib_file("/nope.so"),
            Err(LaunchError::LibraryOpen { .. })
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_load_lib_by_name_not_implemented() {
        let mut reg = LibraryRegistry::with_loader(FakeLoader::default());
        assert!(matches!(
            reg.load_lib("cudart"),
            Err(LaunchError::NotImplemented(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_dlopen_missing_file() {
        let mut reg = LibraryRegistry::new();
        let err = reg
            .load_lib_file("/definitely/not/here/libnothing.so")
            .err()
            .unwrap();
        match err {
            LaunchError::LibraryOpen { path, message } => {
                assert_eq!(path, PathBuf::from("/definitely/not/here/libnothing.so"));
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dlopen_system_library() {
        let mut reg = LibraryRegistry::new();
        reg.load_lib_file("libm.so.6").unwrap();
        assert_eq!(reg.len(), 1);
        reg.unload_all().unwrap();
        assert!(reg.is_empty());
    }
}
