//! Scroll contexts: stateful cursors over a pinned searcher snapshot.
//!
//! A scroll holds the `Searcher` it was opened on, which keeps its segments
//! referenced; deletes and merges after the scroll opened do not change what
//! it returns. Contexts expire after their keep-alive elapses without
//! activity, or immediately on an explicit clear.

use crate::error::{Error, Result};
use crate::search::query::SearchQuery;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tantivy::Searcher;
use uuid::Uuid;

pub struct ScrollContext {
    pub searcher: Searcher,
    pub query: SearchQuery,
    pub size: usize,
    /// Documents already handed out.
    pub offset: usize,
    keep_alive: Duration,
    last_access: Instant,
}

pub struct ScrollRegistry {
    contexts: Mutex<HashMap<String, ScrollContext>>,
}

impl Default for ScrollRegistry {
    fn default() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }
}

impl ScrollRegistry {
    /// Register a new scroll and return its cursor token.
    pub fn create(
        &self,
        searcher: Searcher,
        query: SearchQuery,
        size: usize,
        keep_alive: Duration,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        self.contexts.lock().insert(
            token.clone(),
            ScrollContext {
                searcher,
                query,
                size,
                offset: 0,
                keep_alive,
                last_access: Instant::now(),
            },
        );
        token
    }

    /// Run `f` against a live context, refreshing its keep-alive.
    pub fn with_context<T>(
        &self,
        token: &str,
        f: impl FnOnce(&mut ScrollContext) -> Result<T>,
    ) -> Result<T> {
        let mut contexts = self.contexts.lock();
        let context = contexts
            .get_mut(token)
            .ok_or_else(|| Error::ScrollMissing(token.to_string()))?;
        if context.last_access.elapsed() > context.keep_alive {
            contexts.remove(token);
            return Err(Error::ScrollMissing(token.to_string()));
        }
        context.last_access = Instant::now();
        f(context)
    }

    /// Explicit clear; returns whether the context existed.
    pub fn clear(&self, token: &str) -> bool {
        self.contexts.lock().remove(token).is_some()
    }

    /// Drop every context whose keep-alive elapsed. Called periodically.
    pub fn expire_idle(&self) -> usize {
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, c| c.last_access.elapsed() <= c.keep_alive);
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, FieldRegistry, IndexMapping};
    use tantivy::Index;

    fn searcher() -> Searcher {
        let registry = FieldRegistry::compile(
            &IndexMapping::builder()
                .field("body", FieldMapping::text())
                .build(),
        )
        .unwrap();
        let index = Index::create_in_ram(registry.schema.clone());
        index.reader().unwrap().searcher()
    }

    #[test]
    fn test_create_use_clear() {
        let registry = ScrollRegistry::default();
        let token = registry.create(
            searcher(),
            SearchQuery::match_all(),
            10,
            Duration::from_secs(60),
        );
        registry
            .with_context(&token, |context| {
                assert_eq!(context.offset, 0);
                context.offset += 10;
                Ok(())
            })
            .unwrap();
        registry
            .with_context(&token, |context| {
                assert_eq!(context.offset, 10);
                Ok(())
            })
            .unwrap();

        assert!(registry.clear(&token));
        assert!(!registry.clear(&token));
        assert!(matches!(
            registry.with_context(&token, |_| Ok(())),
            Err(Error::ScrollMissing(_))
        ));
    }

    #[test]
    fn test_expiry() {
        let registry = ScrollRegistry::default();
        let token = registry.create(
            searcher(),
            SearchQuery::match_all(),
            10,
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.expire_idle(), 1);
        assert!(registry.with_context(&token, |_| Ok(())).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_token() {
        let registry = ScrollRegistry::default();
        assert!(matches!(
            registry.with_context("nope", |_| Ok(())),
            Err(Error::ScrollMissing(_))
        ));
    }
}
