use crate::tags::structures::{Tag, TagSnapshot};
use dashmap::DashMap; // Using DashMap for concurrent R/W access
use std::sync::Arc;

#[derive(Debug, Clone)]
struct TagEntry {
    tag: Tag,
    snapshot: TagSnapshot,
}

/// Manages the state of all tags in the system.
/// Uses DashMap for thread-safe access: many readers, one writing channel per tag.
#[derive(Debug, Clone)] // Clone provides cheap Arc clones
pub struct TagEngine {
    tags: Arc<DashMap<String, TagEntry>>,
}

impl TagEngine {
    pub fn new() -> Self {
        TagEngine {
            tags: Arc::new(DashMap::new()),
        }
    }

    /// Add or replace a tag definition. Last registration wins and resets
    /// the snapshot to Bad until the owning channel reads it.
    pub fn register_tag(&self, tag: Tag) {
        self.tags.insert(
            tag.name.clone(),
            TagEntry {
                tag,
                snapshot: TagSnapshot::default(),
            },
        );
    }

    /// Current snapshot, or a Bad/null snapshot for unknown identifiers.
    pub fn get(&self, name: &str) -> TagSnapshot {
        self.read_tag(name).unwrap_or_default()
    }

    /// Snapshot of a registered tag.
    pub fn read_tag(&self, name: &str) -> Option<TagSnapshot> {
        self.tags.get(name).map(|entry| entry.snapshot.clone())
    }

    /// Replace the snapshot of an existing tag. Returns the previous one,
    /// or `None` if the tag is not registered.
    pub fn update_snapshot(&self, name: &str, snapshot: TagSnapshot) -> Option<TagSnapshot> {
        self.tags
            .get_mut(name)
            .map(|mut entry| std::mem::replace(&mut entry.snapshot, snapshot))
    }

    pub fn get_tag_details(&self, name: &str) -> Option<Tag> {
        self.tags.get(name).map(|entry| entry.tag.clone())
    }

    /// All tags whose owning channel is `driver_code`, sorted by name.
    pub fn tags_for_driver(&self, driver_code: &str) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self
            .tags
            .iter()
            .filter(|entry| entry.tag.driver_code == driver_code)
            .map(|entry| entry.tag.clone())
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    /// Get a list of all registered tag names.
    pub fn get_all_tag_paths(&self) -> Vec<String> {
        self.tags.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_all_tags(&self) -> Vec<(Tag, TagSnapshot)> {
        self.tags
            .iter()
            .map(|entry| (entry.tag.clone(), entry.snapshot.clone()))
            .collect()
    }

    /// Drop every tag. Only called by the orchestrator while holding its reload lock.
    pub fn clear(&self) {
        self.tags.clear();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Default for TagEngine {
    fn default() -> Self {
        Self::new()
    }
}
