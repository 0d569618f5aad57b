//! The process-wide mutex serializing the four mutating Node RPCs
//! Mount-table and `/dev/mapper`
//! state is host-global, so this is deliberately one coarse lock rather
//! than a per-volume map.

use tokio::sync::Mutex;

/// Held only by NodeStageVolume, NodeUnstageVolume, NodePublishVolume, and
/// NodeUnpublishVolume. `NodeGetVolumeStats`, `NodeGetInfo`,
/// `NodeGetCapabilities`, and `NodeExpandVolume` never touch it.
#[derive(Debug, Default)]
pub struct NodeLock {
    inner: Mutex<()>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate for the duration of one mutating RPC. The guard is
    /// released on every exit path, including early `?` returns, because
    /// it's dropped along with the caller's stack frame.
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn serializes_concurrent_acquires() {
        let lock = Arc::new(NodeLock::new());
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                order.lock().await.push(i);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(order.lock().await.len(), 4);
    }
}
