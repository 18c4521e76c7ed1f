//! Process-wide library lifecycle: idempotent init/teardown and version
//! reporting, grounded on `vtx_init`/`vtx_fini`/`vtx_version*`. No other
//! process-global state exists — every other object in this crate is
//! created and owned explicitly by the caller.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes process-wide library state. Calling this a second time
/// without an intervening [`fini`] returns `Error::AlreadyInit`.
pub fn init() -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInit);
    }
    log::info!("vtransport {} initialized", version());
    Ok(())
}

/// Tears down process-wide library state, allowing a subsequent [`init`].
pub fn fini() {
    INITIALIZED.store(false, Ordering::SeqCst);
}

/// Whether [`init`] has been called without a matching [`fini`].
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// The crate's semantic version, as declared in `Cargo.toml`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test_shim::serial;

    // Tests that mutate process-wide init state must not interleave; this
    // crate has no dev-dependency on `serial_test`, so a tiny local mutex
    // shim serializes them instead of pulling in another crate.
    mod serial_test_shim {
        use std::sync::Mutex;
        static LOCK: Mutex<()> = Mutex::new(());

        pub fn serial() -> std::sync::MutexGuard<'static, ()> {
            LOCK.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[test]
    fn init_is_idempotent_guard() {
        let _guard = serial();
        fini();
        assert!(init().is_ok());
        assert_eq!(init().unwrap_err(), Error::AlreadyInit);
        fini();
        assert!(!is_initialized());
    }
}
