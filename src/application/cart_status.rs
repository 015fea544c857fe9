// Cross-cart directory of open carts and their download progress.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::cart::Cart;
use crate::domain::CartStatusEntry;
use crate::storage::{SharedStorage, StorageChange, StorageError};
use crate::utils::get_timestamp;

pub struct CartStatusRegistry {
    name: String,
    global_cart_id: String,
    entries: BTreeMap<String, CartStatusEntry>,
    storage: SharedStorage,
}

fn parse_entries(raw: &str) -> BTreeMap<String, CartStatusEntry> {
    match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("discarding malformed cart status payload: {}", e);
            BTreeMap::new()
        }
    }
}

impl CartStatusRegistry {
    /// Load the registry stored under `name` (conventionally `cartstatus`).
    pub fn open(
        name: &str,
        global_cart_id: &str,
        storage: SharedStorage,
    ) -> Result<Self, StorageError> {
        let mut registry = Self {
            name: name.to_string(),
            global_cart_id: global_cart_id.to_string(),
            entries: BTreeMap::new(),
            storage,
        };
        registry.restore()?;
        Ok(registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn global_cart_id(&self) -> &str {
        &self.global_cart_id
    }

    pub fn is_global(&self, cart_id: &str) -> bool {
        cart_id == self.global_cart_id
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let json = serde_json::to_string(&self.entries).map_err(|source| StorageError::Encode {
            key: self.name.clone(),
            source,
        })?;
        self.storage.set(&self.name, &json)
    }

    pub fn restore(&mut self) -> Result<(), StorageError> {
        self.entries = match self.storage.get(&self.name)? {
            Some(raw) => parse_entries(&raw),
            None => BTreeMap::new(),
        };
        Ok(())
    }

    pub fn on_storage_change(&mut self, change: &StorageChange) -> Result<bool, StorageError> {
        if !change.affects(&self.name) {
            return Ok(false);
        }
        debug!("registry {} changed elsewhere, restoring", self.name);
        self.restore()?;
        Ok(true)
    }

    pub fn get(&self, cart_id: &str) -> Option<&CartStatusEntry> {
        self.entries.get(cart_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CartStatusEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop one entry and persist. The cart itself is left alone.
    pub fn remove(&mut self, cart_id: &str) -> Result<Option<CartStatusEntry>, StorageError> {
        let removed = self.entries.remove(cart_id);
        self.save()?;
        Ok(removed)
    }

    fn entry_mut(&mut self, cart_id: &str, display_name: Option<&str>) -> &mut CartStatusEntry {
        let entry = self
            .entries
            .entry(cart_id.to_string())
            .or_insert_with(|| CartStatusEntry::new(cart_id, display_name.unwrap_or(cart_id)));
        if let Some(name) = display_name {
            entry.display_name = name.to_string();
        }
        entry
    }

    pub fn update_in_use(
        &mut self,
        cart_id: &str,
        in_use: bool,
        display_name: Option<&str>,
    ) -> Result<(), StorageError> {
        self.entry_mut(cart_id, display_name).is_in_use = in_use;
        self.save()
    }

    /// Restores first to narrow the window in which another tab's write is lost.
    pub fn update_download_percentage(
        &mut self,
        cart_id: &str,
        percentage: f64,
        display_name: Option<&str>,
    ) -> Result<(), StorageError> {
        self.restore()?;
        let entry = self.entry_mut(cart_id, display_name);
        entry.download_percentage = percentage.clamp(0.0, 100.0);
        entry.last_updated = Some(get_timestamp());
        self.save()
    }

    /// Remove every non-global entry that is not in use, together with its
    /// persisted cart. Returns the removed cart ids.
    pub fn cleanup(&mut self) -> Result<Vec<String>, StorageError> {
        self.restore()?;
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !entry.is_in_use && !self.is_global(&entry.item_id))
            .map(|entry| entry.item_id.clone())
            .collect();

        for cart_id in &stale {
            self.entries.remove(cart_id);
            Cart::forget_named(&self.storage, cart_id)?;
            info!("cleaned up abandoned cart {}", cart_id);
        }

        if !stale.is_empty() {
            self.save()?;
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FileData;

    fn registry(storage: &SharedStorage) -> CartStatusRegistry {
        CartStatusRegistry::open("cartstatus", "global", storage.clone()).unwrap()
    }

    #[test]
    fn test_update_in_use_creates_then_updates() {
        let storage = SharedStorage::in_memory();
        let mut reg = registry(&storage);

        reg.update_in_use("hs-1", true, Some("Dataset 1")).unwrap();
        let entry = reg.get("hs-1").unwrap();
        assert!(entry.is_in_use);
        assert_eq!(entry.display_name, "Dataset 1");

        reg.update_in_use("hs-1", false, None).unwrap();
        let entry = reg.get("hs-1").unwrap();
        assert!(!entry.is_in_use);
        assert_eq!(entry.display_name, "Dataset 1");

        assert_eq!(registry(&storage).len(), 1);
    }

    #[test]
    fn test_update_percentage_merges_other_tab_writes() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        let mut reg_a = registry(&tab_a);
        let mut reg_b = registry(&tab_b);

        reg_b.update_in_use("other", true, None).unwrap();
        reg_a.update_download_percentage("mine", 42.0, Some("Mine")).unwrap();

        let reloaded = registry(&tab_a);
        assert!(reloaded.get("other").is_some());
        let mine = reloaded.get("mine").unwrap();
        assert_eq!(mine.download_percentage, 42.0);
        assert!(mine.last_updated.is_some());
    }

    #[test]
    fn test_percentage_is_clamped() {
        let storage = SharedStorage::in_memory();
        let mut reg = registry(&storage);
        reg.update_download_percentage("c", 250.0, None).unwrap();
        assert_eq!(reg.get("c").unwrap().download_percentage, 100.0);
    }

    #[test]
    fn test_cleanup_removes_unused_carts_but_not_global() {
        let storage = SharedStorage::in_memory();
        let mut cart = Cart::open("abandoned", storage.clone()).unwrap();
        cart.add_file("r", FileData::new("a", "u"), false, true).unwrap();
        Cart::open("busy", storage.clone()).unwrap();
        Cart::open("global", storage.clone()).unwrap();

        let mut reg = registry(&storage);
        reg.update_in_use("abandoned", false, None).unwrap();
        reg.update_in_use("busy", true, None).unwrap();
        reg.update_in_use("global", false, None).unwrap();

        let removed = reg.cleanup().unwrap();
        assert_eq!(removed, vec!["abandoned".to_string()]);

        assert!(reg.get("abandoned").is_none());
        assert!(reg.get("busy").is_some());
        assert!(reg.get("global").is_some());
        assert_eq!(storage.get("cart:abandoned").unwrap(), None);
        assert!(storage.get("cart:busy").unwrap().is_some());
        assert!(storage.get("cart:global").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_registry_reads_empty() {
        let storage = SharedStorage::in_memory();
        storage.set("cartstatus", "[1,2").unwrap();
        assert!(registry(&storage).is_empty());
    }

    #[test]
    fn test_on_storage_change_restores() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        let mut reg_a = registry(&tab_a);
        let mut sub = tab_a.subscribe();

        registry(&tab_b).update_in_use("x", true, None).unwrap();
        let change = sub.try_recv().unwrap();
        assert!(reg_a.on_storage_change(&change).unwrap());
        assert!(reg_a.get("x").unwrap().is_in_use);
    }
}
