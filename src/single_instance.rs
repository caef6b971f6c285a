use windows::{
    Win32::{
        Foundation::{CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE},
        System::Threading::CreateMutexW,
    },
    core::{PCWSTR, w},
};

use crate::error::{Error, Result};

const BATCH_MUTEX: PCWSTR = w!("Global\\Arcanum_ProvisioningBatch");

/// Cross-process guard for one `arcanum start` run.
///
/// Two processes provisioning at once would fight over the same `Proxy_N`
/// names, so the second one is refused instead of interleaving.
pub struct BatchLock {
    handle: Option<HANDLE>,
}

// The mutex handle is only closed, never used concurrently.
unsafe impl Send for BatchLock {}
unsafe impl Sync for BatchLock {}

impl BatchLock {
    /// Fails with [`Error::InstanceBusy`] while another process holds the lock.
    ///
    /// When the mutex cannot be created at all the batch runs unguarded.
    pub fn acquire() -> Result<Self> {
        let handle = match unsafe { CreateMutexW(None, true, BATCH_MUTEX) } {
            Ok(handle) => handle,
            Err(error) => {
                log::warn!("[provision] batch lock unavailable ({error}), continuing unguarded");
                return Ok(Self { handle: None });
            }
        };

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            close(handle);
            log::warn!("[provision] another arcanum process is provisioning, refusing to start");
            return Err(Error::InstanceBusy);
        }

        log::debug!("[provision] batch lock acquired");
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn is_guarded(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            close(handle);
            log::debug!("[provision] batch lock released");
        }
    }
}

fn close(handle: HANDLE) {
    unsafe {
        let _ = CloseHandle(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let first = BatchLock::acquire().unwrap();
        if !first.is_guarded() {
            return;
        }

        assert!(matches!(BatchLock::acquire(), Err(Error::InstanceBusy)));

        drop(first);
        assert!(BatchLock::acquire().unwrap().is_guarded());
    }
}
