// State Store
// Persists the desired egress state: the destination list and the config template

use std::path::PathBuf;
use std::sync::RwLock;

use crate::models::Destination;

/// Template written on first run so a fresh install renders a working
/// nginx-rtmp configuration out of the box
const DEFAULT_EGRESS_TEMPLATE: &str = r#"worker_processes auto;
error_log stderr info;
pid /tmp/nginx.pid;

events {
    worker_connections 1024;
}

rtmp {
    server {
        listen 1935;
        chunk_size 4096;

        application {{INGEST_KEY}} {
            live on;

{{PUSH_DESTINATIONS}}
        }
    }
}

http {
    access_log /dev/stdout;

    server {
        listen 8080;

        location /stat {
            rtmp_stat all;
        }

        location / {
            return 200 'nginx-rtmp ok';
            add_header Content-Type text/plain;
        }
    }
}
"#;

/// Manages desired-state storage: an ordered destination list and the
/// singleton "current template" slot. The supervisor only reads through
/// this; writes come from the admin-facing routes.
pub struct StateStore {
    destinations_path: PathBuf,
    template_path: PathBuf,
    cache: RwLock<Option<Vec<Destination>>>,
}

impl StateStore {
    /// Create a new StateStore rooted at the given app data directory
    pub fn new(app_data_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&app_data_dir).ok();
        Self {
            destinations_path: app_data_dir.join("destinations.json"),
            template_path: app_data_dir.join("template.conf"),
            cache: RwLock::new(None),
        }
    }

    /// Seed the default template and an empty destination list on first run
    pub fn ensure_defaults(&self) -> Result<(), String> {
        if !self.template_path.exists() {
            self.save_template(DEFAULT_EGRESS_TEMPLATE)?;
            log::info!("Seeded default egress template");
        }
        if !self.destinations_path.exists() {
            self.save_destinations(&[])?;
            log::info!("Initialized empty destination list");
        }
        Ok(())
    }

    /// Current template text, or None if the slot was never written
    pub fn load_template(&self) -> Result<Option<String>, String> {
        if !self.template_path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&self.template_path)
            .map(Some)
            .map_err(|e| format!("Failed to read template: {e}"))
    }

    /// Replace the current template
    pub fn save_template(&self, template: &str) -> Result<(), String> {
        self.replace_file(&self.template_path, template)
    }

    /// All destinations in insertion order; that order is the render order
    pub fn list_destinations(&self) -> Result<Vec<Destination>, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref destinations) = *cache {
                return Ok(destinations.clone());
            }
        }

        let destinations = if self.destinations_path.exists() {
            let content = std::fs::read_to_string(&self.destinations_path)
                .map_err(|e| format!("Failed to read destinations: {e}"))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse destinations: {e}"))?
        } else {
            Vec::new()
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(destinations.clone());
        }

        Ok(destinations)
    }

    /// Append a destination and return it with its assigned id
    pub fn add_destination(&self, destination: Destination) -> Result<Destination, String> {
        let mut destinations = self.list_destinations()?;
        destinations.push(destination.clone());
        self.save_destinations(&destinations)?;
        log::info!("Added destination '{}' ({})", destination.name, destination.id);
        Ok(destination)
    }

    /// Replace the destination with the same id
    pub fn update_destination(&self, updated: &Destination) -> Result<(), String> {
        let mut destinations = self.list_destinations()?;
        let slot = destinations
            .iter_mut()
            .find(|dest| dest.id == updated.id)
            .ok_or_else(|| format!("Destination not found: {}", updated.id))?;
        *slot = updated.clone();
        self.save_destinations(&destinations)?;
        Ok(())
    }

    /// Remove a destination by id
    pub fn remove_destination(&self, id: &str) -> Result<(), String> {
        let mut destinations = self.list_destinations()?;
        let before = destinations.len();
        destinations.retain(|dest| dest.id != id);
        if destinations.len() == before {
            return Err(format!("Destination not found: {id}"));
        }
        self.save_destinations(&destinations)?;
        log::info!("Removed destination {id}");
        Ok(())
    }

    /// Look up a single destination by id
    pub fn get_destination(&self, id: &str) -> Result<Destination, String> {
        self.list_destinations()?
            .into_iter()
            .find(|dest| dest.id == id)
            .ok_or_else(|| format!("Destination not found: {id}"))
    }

    fn save_destinations(&self, destinations: &[Destination]) -> Result<(), String> {
        let content = serde_json::to_string_pretty(destinations)
            .map_err(|e| format!("Failed to serialize destinations: {e}"))?;
        self.replace_file(&self.destinations_path, &content)?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(destinations.to_vec());
        }
        Ok(())
    }

    /// Write-to-temp then rename, so readers never observe a partial file
    fn replace_file(&self, path: &PathBuf, content: &str) -> Result<(), String> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| format!("Failed to write {}: {e}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| format!("Failed to replace {}: {e}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[test]
    fn test_template_slot_starts_empty_then_seeds_default() {
        let (_dir, store) = store();
        assert!(store.load_template().unwrap().is_none());

        store.ensure_defaults().unwrap();
        let template = store.load_template().unwrap().unwrap();
        assert!(template.contains("{{INGEST_KEY}}"));
        assert!(template.contains("{{PUSH_DESTINATIONS}}"));
    }

    #[test]
    fn test_save_template_replaces_slot() {
        let (_dir, store) = store();
        store.save_template("app {{INGEST_KEY}} { {{PUSH_DESTINATIONS}} }").unwrap();
        assert_eq!(
            store.load_template().unwrap().unwrap(),
            "app {{INGEST_KEY}} { {{PUSH_DESTINATIONS}} }"
        );
    }

    #[test]
    fn test_destinations_round_trip_preserves_order() {
        let (_dir, store) = store();
        store.add_destination(Destination::new("one", "rtmp://one/app", "k1")).unwrap();
        store.add_destination(Destination::new("two", "rtmp://two/app", "k2")).unwrap();
        store.add_destination(Destination::new("three", "rtmp://three/app", "k3")).unwrap();

        let names: Vec<String> = store
            .list_destinations()
            .unwrap()
            .into_iter()
            .map(|dest| dest.name)
            .collect();
        assert_eq!(names, ["one", "two", "three"]);
    }

    #[test]
    fn test_update_destination_replaces_matching_id() {
        let (_dir, store) = store();
        let mut dest = store
            .add_destination(Destination::new("old", "rtmp://a/app", "k"))
            .unwrap();
        dest.name = "new".to_string();
        dest.enabled = false;
        store.update_destination(&dest).unwrap();

        let loaded = store.get_destination(&dest.id).unwrap();
        assert_eq!(loaded.name, "new");
        assert!(!loaded.enabled);
    }

    #[test]
    fn test_remove_unknown_destination_errors() {
        let (_dir, store) = store();
        assert!(store.remove_destination("no-such-id").is_err());
    }

    #[test]
    fn test_remove_destination_drops_it_from_the_list() {
        let (_dir, store) = store();
        let dest = store
            .add_destination(Destination::new("gone", "rtmp://a/app", "k"))
            .unwrap();
        store.remove_destination(&dest.id).unwrap();
        assert!(store.list_destinations().unwrap().is_empty());
    }
}
