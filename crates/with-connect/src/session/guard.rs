//! Scoped ownership of the session container.

use log::{debug, info, warn};

use crate::container::{ContainerHandle, ContainerRef, ContainerResult};

/// Owns the container from the moment it exists until it is torn down.
///
/// [`ContainerGuard::release`] stops and removes the container and may be
/// called any number of times; only the first call does work. A guard dropped
/// without being released (for example while unwinding a panic) falls back
/// to a synchronous force removal.
pub struct ContainerGuard {
    handle: ContainerHandle,
    container: ContainerRef,
    released: bool,
}

impl ContainerGuard {
    pub fn new(handle: ContainerHandle, container: ContainerRef) -> Self {
        debug!("guarding container {}", container.short());
        Self {
            handle,
            container,
            released: false,
        }
    }

    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop and remove the container.
    ///
    /// Returns `Ok(true)` when this call performed the teardown, `Ok(false)`
    /// when an earlier call already did.
    pub async fn release(&mut self) -> ContainerResult<bool> {
        if self.released {
            return Ok(false);
        }

        info!("Stopping container {}...", self.container.short());
        // Marked first so a failed teardown is not retried from Drop.
        self.released = true;
        self.handle.teardown(&self.container).await?;
        info!("Removed container {}", self.container.short());
        Ok(true)
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            "Container {} was not released, force removing",
            self.container.short()
        );
        if let Err(e) = self
            .handle
            .runtime()
            .force_remove_blocking(self.container.as_str())
        {
            warn!(
                "Force removal of container {} failed: {}",
                self.container.short(),
                e
            );
        }
    }
}
