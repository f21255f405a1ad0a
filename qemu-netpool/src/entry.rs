//! Internal per-network record owned by the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::handler::MetadataHandler;

/// Largest pool size [`crate::Pool::new`] accepts. Keeps every subnet
/// inside `192.168.150.0/24 .. 192.168.249.0/24`.
pub(crate) const MAX_ENTRIES: usize = 100;

const TAP_PREFIX: &str = "tctap";
const IP_BASE_OCTET: u32 = 150;

pub(crate) fn tap_name(index: usize) -> String {
    format!("{TAP_PREFIX}{index}")
}

pub(crate) fn ip_prefix(index: usize) -> String {
    format!("192.168.{}", IP_BASE_OCTET + index as u32)
}

/// One TAP device, one `/24` prefix, one handler slot, one busy flag.
///
/// `in_use` is only ever flipped while the pool's entries mutex is held
/// (see `pool.rs`); it's an atomic purely so it can be read through a
/// shared `Arc<Entry>` without its own lock.
pub(crate) struct Entry {
    pub tap_name: String,
    pub ip_prefix: String,
    handler: RwLock<Option<Arc<dyn MetadataHandler>>>,
    in_use: AtomicBool,
}

impl Entry {
    pub fn new(tap_name: String, ip_prefix: String) -> Self {
        Self {
            tap_name,
            ip_prefix,
            handler: RwLock::new(None),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Caller must already hold the pool's entries mutex.
    pub fn mark_in_use(&self) {
        self.in_use.store(true, Ordering::SeqCst);
    }

    /// Caller must already hold the pool's entries mutex.
    pub fn mark_idle(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }

    pub async fn handler(&self) -> Option<Arc<dyn MetadataHandler>> {
        self.handler.read().await.clone()
    }

    pub async fn set_handler(&self, handler: Option<Arc<dyn MetadataHandler>>) {
        *self.handler.write().await = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tap_name_format() {
        assert_eq!(tap_name(0), "tctap0");
        assert_eq!(tap_name(41), "tctap41");
    }

    #[test]
    fn ip_prefix_format() {
        assert_eq!(ip_prefix(0), "192.168.150");
        assert_eq!(ip_prefix(1), "192.168.151");
        assert_eq!(ip_prefix(99), "192.168.249");
    }

    #[test]
    fn names_and_prefixes_are_unique_up_to_the_cap() {
        let mut taps = HashSet::new();
        let mut prefixes = HashSet::new();
        for i in 0..MAX_ENTRIES {
            assert!(taps.insert(tap_name(i)), "duplicate tap at index {i}");
            assert!(prefixes.insert(ip_prefix(i)), "duplicate prefix at index {i}");
        }
    }

    #[tokio::test]
    async fn new_entry_starts_idle_with_no_handler() {
        let entry = Entry::new(tap_name(0), ip_prefix(0));
        assert!(!entry.is_in_use());
        assert!(entry.handler().await.is_none());
    }

    #[tokio::test]
    async fn in_use_flag_round_trips() {
        let entry = Entry::new(tap_name(0), ip_prefix(0));
        entry.mark_in_use();
        assert!(entry.is_in_use());
        entry.mark_idle();
        assert!(!entry.is_in_use());
    }

    #[tokio::test]
    async fn handler_round_trips() {
        use hyper::{Request, Response};

        struct Echo;

        #[async_trait::async_trait]
        impl MetadataHandler for Echo {
            async fn handle(&self, _req: Request<crate::handler::Body>) -> Response<crate::handler::Body> {
                Response::new(crate::handler::Body::new(bytes::Bytes::new()))
            }
        }

        let entry = Entry::new(tap_name(0), ip_prefix(0));
        entry.set_handler(Some(Arc::new(Echo))).await;
        assert!(entry.handler().await.is_some());
        entry.set_handler(None).await;
        assert!(entry.handler().await.is_none());
    }
}
