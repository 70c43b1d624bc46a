/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Temporary-file bookkeeping.
//!
//! Pipelines create large intermediate files; every such path is registered
//! here so that a signal arriving mid-run removes them before the process
//! dies. Cleanup is also invoked on orderly error paths by the drivers, so
//! the registry is best-effort belt over explicit removal.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};

static REGISTRY: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
static INSTALL: Once = Once::new();
static COUNTER: AtomicU64 = AtomicU64::new(0);

const SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGKILL,
    libc::SIGSEGV,
    libc::SIGTERM,
    libc::SIGBUS,
];

extern "C" fn cleanup_handler(sig: libc::c_int) {
    // Remove whatever was registered, then die with the original signal.
    if let Ok(mut registry) = REGISTRY.try_lock() {
        for path in std::mem::take(&mut *registry) {
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn install_handler() {
    INSTALL.call_once(|| unsafe {
        for &sig in SIGNALS {
            let mut act: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = cleanup_handler;
            act.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut act.sa_mask);
            // SIGKILL cannot be caught; the call failing is fine.
            libc::sigaction(sig, &act, std::ptr::null_mut());
        }
    });
}

/// Registers a path for removal on abnormal termination.
pub fn register(path: impl Into<PathBuf>) {
    install_handler();
    REGISTRY.lock().unwrap().insert(path.into());
}

/// Drops a path from the registry, typically after it has been published
/// into its final location or already removed.
pub fn unregister(path: impl AsRef<Path>) {
    REGISTRY.lock().unwrap().remove(path.as_ref());
}

/// The root under which a pipeline run creates its temporary files.
///
/// An explicit value passed down to the drivers; there is no ambient
/// global beyond the signal-cleanup registry above.
#[derive(Debug, Clone)]
pub struct TempRoot {
    dir: PathBuf,
}

impl TempRoot {
    /// Uses `dir` if given, the system temporary directory otherwise.
    pub fn new(dir: Option<PathBuf>) -> Self {
        install_handler();
        TempRoot {
            dir: dir.unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a fresh, registered path under the root. Nothing is created.
    pub fn file_name(&self, prefix: &str) -> PathBuf {
        let path = self.dir.join(format!(
            "{}.{}.{:06}",
            prefix,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        register(&path);
        path
    }

    /// Creates and registers a fresh scratch directory under the root.
    pub fn directory(&self, prefix: &str) -> Result<PathBuf> {
        let path = self.file_name(prefix);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Cannot create temporary directory {}", path.display()))?;
        Ok(path)
    }

    /// Removes a registered path and forgets it.
    pub fn remove(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("Cannot remove {}", path.display()))?;
        } else if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Cannot remove {}", path.display()))?;
        }
        unregister(path);
        Ok(())
    }
}
