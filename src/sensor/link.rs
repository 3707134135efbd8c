//! Connected centrals on the peripheral side.

use heapless::Vec;

/// Up to `N` simultaneously connected centrals, by connection handle.
#[derive(Debug, Default)]
pub struct Centrals<const N: usize> {
    handles: Vec<u16, N>,
}

impl<const N: usize> Centrals<N> {
    pub const fn new() -> Self {
        Self { handles: Vec::new() }
    }

    /// Register a new link. Returns `false` when full or already known.
    pub fn on_connect(&mut self, handle: u16) -> bool {
        if self.handles.contains(&handle) {
            return false;
        }
        match self.handles.push(handle) {
            Ok(()) => {
                info!("Central connected: {} ({}/{})", handle, self.handles.len(), N);
                true
            }
            Err(_) => {
                warn!("Central {} rejected, {} already connected", handle, N);
                false
            }
        }
    }

    /// Forget a link. Returns `false` for an unknown handle.
    pub fn on_disconnect(&mut self, handle: u16) -> bool {
        let Some(i) = self.handles.iter().position(|h| *h == handle) else {
            return false;
        };
        self.handles.swap_remove(i);
        info!("Central disconnected: {}", handle);
        true
    }

    /// Advertising continues while there is room for another central.
    pub fn should_advertise(&self) -> bool {
        !self.handles.is_full()
    }

    pub fn is_connected(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Handles to fan notifications out to.
    pub fn handles(&self) -> &[u16] {
        &self.handles
    }
}
