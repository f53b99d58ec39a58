use std::path::{Path, PathBuf};

/// Platform-specific filesystem operations behind a common interface so call
/// sites stay free of `#[cfg]` blocks.
pub trait Platform {
    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Conventional root data directory when neither the environment nor the
    /// caller picks one.
    fn default_data_dir() -> PathBuf;

    /// Root data directory. `CONDUCTOR_DATA_DIR` wins over the platform default.
    fn data_dir() -> PathBuf {
        resolve_data_dir(Self::default_data_dir())
    }
}

pub(crate) fn resolve_data_dir(fallback: PathBuf) -> PathBuf {
    match std::env::var_os("CONDUCTOR_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => fallback,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
