//! Named weighted semaphores bounding concurrent step executions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Process-wide registry of resource tags, built once from configuration and
/// read-only afterwards. A step declaring `socket` holds one of the `socket`
/// permits for the duration of its runner invocation.
pub struct ResourceRegistry {
    semaphores: HashMap<String, Arc<Semaphore>>,
}

/// Permits held for one step execution; released on drop.
pub struct ResourceGuard {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl ResourceRegistry {
    pub fn new(limits: &HashMap<String, usize>) -> Self {
        let semaphores = limits
            .iter()
            .map(|(tag, capacity)| {
                (
                    tag.clone(),
                    Arc::new(Semaphore::new((*capacity).max(1))),
                )
            })
            .collect();
        Self { semaphores }
    }

    /// Acquire one permit for every known tag in the list. Tags are acquired
    /// in lexical order so two steps claiming overlapping sets cannot
    /// deadlock. Unknown tags are no-ops.
    pub async fn acquire(&self, tags: &[String]) -> ResourceGuard {
        let mut wanted: Vec<&String> = tags.iter().collect();
        wanted.sort();
        wanted.dedup();

        let mut permits = Vec::new();
        for tag in wanted {
            let Some(semaphore) = self.semaphores.get(tag) else {
                debug!(tag = %tag, "unknown resource tag, skipping");
                continue;
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("resource semaphore closed");
            permits.push(permit);
        }
        ResourceGuard { _permits: permits }
    }

    /// Remaining permits for a tag, if it is registered.
    pub fn available(&self, tag: &str) -> Option<usize> {
        self.semaphores
            .get(tag)
            .map(|semaphore| semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(&HashMap::from([
            ("socket".to_string(), 2),
            ("fork".to_string(), 1),
        ]))
    }

    #[tokio::test]
    async fn acquire_and_release_permits() {
        let registry = registry();
        let guard = registry
            .acquire(&["socket".to_string(), "fork".to_string()])
            .await;
        assert_eq!(registry.available("socket"), Some(1));
        assert_eq!(registry.available("fork"), Some(0));
        drop(guard);
        assert_eq!(registry.available("socket"), Some(2));
        assert_eq!(registry.available("fork"), Some(1));
    }

    #[tokio::test]
    async fn unknown_tags_are_noops() {
        let registry = registry();
        let _guard = registry.acquire(&["mystery".to_string()]).await;
        assert_eq!(registry.available("mystery"), None);
    }

    #[tokio::test]
    async fn duplicate_tags_take_a_single_permit() {
        let registry = registry();
        let _guard = registry
            .acquire(&["fork".to_string(), "fork".to_string()])
            .await;
        assert_eq!(registry.available("fork"), Some(0));
    }

    #[tokio::test]
    async fn exhausted_tag_blocks_until_released() {
        let registry = Arc::new(registry());
        let held = registry.acquire(&["fork".to_string()]).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(&["fork".to_string()]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("waiter join");
    }
}
