// Persisted, named collection of files queued for download.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::domain::{item_key, CartCommand, CartItem, DownloadStatus, FileData};
use crate::storage::{SharedStorage, StorageChange, StorageError};

pub const CART_KEY_PREFIX: &str = "cart:";

pub type SubscriptionId = u64;

type SaveCallback = Box<dyn Fn(&Cart) + Send + Sync>;

pub fn cart_storage_key(name: &str) -> String {
    format!("{}{}", CART_KEY_PREFIX, name)
}

/// Parse a persisted item map. A malformed payload is treated as a lost cart.
pub fn parse_items(raw: &str) -> BTreeMap<String, CartItem> {
    match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(e) => {
            warn!("discarding malformed cart payload: {}", e);
            BTreeMap::new()
        }
    }
}

pub struct Cart {
    name: String,
    items: BTreeMap<String, CartItem>,
    storage: SharedStorage,
    subscribers: Vec<(SubscriptionId, SaveCallback)>,
    next_subscription: SubscriptionId,
}

impl fmt::Debug for Cart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cart")
            .field("name", &self.name)
            .field("items", &self.items)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Cart {
    fn empty(name: &str, storage: SharedStorage) -> Self {
        Self {
            name: name.to_string(),
            items: BTreeMap::new(),
            storage,
            subscribers: Vec::new(),
            next_subscription: 1,
        }
    }

    /// Load the cart persisted under `cart:<name>`, creating it when absent.
    pub fn open(name: &str, storage: SharedStorage) -> Result<Self, StorageError> {
        match storage.get(&cart_storage_key(name))? {
            Some(raw) => {
                let mut cart = Self::empty(name, storage);
                cart.items = parse_items(&raw);
                debug!("opened cart {} with {} items", name, cart.items.len());
                Ok(cart)
            }
            None => Self::create(name, storage),
        }
    }

    /// Start an empty cart and persist it immediately, replacing any previous copy.
    pub fn create(name: &str, storage: SharedStorage) -> Result<Self, StorageError> {
        let cart = Self::empty(name, storage);
        cart.storage.set(&cart.storage_key(), &cart.to_json()?)?;
        debug!("created cart {}", name);
        Ok(cart)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_key(&self) -> String {
        cart_storage_key(&self.name)
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string(&self.items).map_err(|source| StorageError::Encode {
            key: self.storage_key(),
            source,
        })
    }

    /// Overwrite the persisted copy with the whole item map, then notify subscribers.
    pub fn save(&self) -> Result<(), StorageError> {
        self.storage.set(&self.storage_key(), &self.to_json()?)?;
        for (_, callback) in &self.subscribers {
            callback(self);
        }
        Ok(())
    }

    /// Replace the in-memory items with the persisted copy.
    pub fn restore(&mut self) -> Result<(), StorageError> {
        self.items = match self.storage.get(&self.storage_key())? {
            Some(raw) => parse_items(&raw),
            None => BTreeMap::new(),
        };
        Ok(())
    }

    /// Delete the persisted copy. The in-memory cart stays usable.
    pub fn forget(&self) -> Result<(), StorageError> {
        Self::forget_named(&self.storage, &self.name)
    }

    pub fn forget_named(storage: &SharedStorage, name: &str) -> Result<(), StorageError> {
        debug!("forgetting cart {}", name);
        storage.remove(&cart_storage_key(name))
    }

    /// Restore when another tab changed this cart's key.
    pub fn on_storage_change(&mut self, change: &StorageChange) -> Result<bool, StorageError> {
        if !change.affects(&self.storage_key()) {
            return Ok(false);
        }
        debug!("cart {} changed elsewhere, restoring", self.name);
        self.restore()?;
        Ok(true)
    }

    /// Callbacks run synchronously after every successful `save`.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&Cart) + Send + Sync + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Insert or merge a file. Fields set in `data` win over the existing entry;
    /// an unset `download_status` keeps the previous one (or `""` for a new entry).
    pub fn add_file(
        &mut self,
        res_id: &str,
        data: FileData,
        selected: bool,
        autosave: bool,
    ) -> Result<String, StorageError> {
        let key = item_key(res_id, &data.file_path);
        let file_path = data.file_path.trim_start_matches('/').to_string();

        let item = self.items.entry(key.clone()).or_insert_with(|| CartItem {
            res_id: res_id.to_string(),
            file_path: file_path.clone(),
            download_url: String::new(),
            download_status: DownloadStatus::None,
            is_selected: false,
            size: None,
            media_type: None,
            description: None,
            res_title: None,
            message: None,
            extra: Default::default(),
        });

        item.res_id = res_id.to_string();
        item.file_path = file_path;
        item.download_url = data.download_url;
        item.is_selected = selected;
        if let Some(status) = data.download_status {
            item.download_status = status;
        }
        if data.size.is_some() {
            item.size = data.size;
        }
        if data.media_type.is_some() {
            item.media_type = data.media_type;
        }
        if data.description.is_some() {
            item.description = data.description;
        }
        if data.res_title.is_some() {
            item.res_title = data.res_title;
        }
        if data.message.is_some() {
            item.message = data.message;
        }

        if autosave {
            self.save()?;
        }
        Ok(key)
    }

    pub fn remove_file_by_id(&mut self, key: &str) -> Option<CartItem> {
        self.items.remove(key)
    }

    pub fn remove_files<S: AsRef<str>>(&mut self, keys: &[S]) -> usize {
        let mut removed = 0;
        for key in keys {
            let key: &str = key.as_ref();
            if self.items.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn remove_selected_files(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| !item.is_selected);
        before - self.items.len()
    }

    pub fn remove_downloaded_files(&mut self) -> usize {
        let before = self.items.len();
        self.items
            .retain(|_, item| item.download_status != DownloadStatus::Downloaded);
        before - self.items.len()
    }

    pub fn get(&self, key: &str) -> Option<&CartItem> {
        self.items.get(key)
    }

    pub fn find_file(&self, res_id: &str, file_path: &str) -> Option<&CartItem> {
        self.items.get(&item_key(res_id, file_path))
    }

    /// Exact match on `res_id/file_path` first; otherwise every item under the
    /// `res_id/file_path/` folder. An empty path matches the whole resource.
    pub fn match_files(&self, res_id: &str, file_path: &str) -> Vec<&CartItem> {
        let file_path = file_path.trim_matches('/');
        if !file_path.is_empty() {
            if let Some(item) = self.find_file(res_id, file_path) {
                return vec![item];
            }
        }

        let prefix = if file_path.is_empty() {
            format!("{}/", res_id)
        } else {
            format!("{}/", item_key(res_id, file_path))
        };
        self.items
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, item)| item)
            .collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &CartItem> {
        self.items.values()
    }

    pub fn get_selected_files(&self) -> Vec<&CartItem> {
        self.items().filter(|item| item.is_selected).collect()
    }

    pub fn get_downloaded_files(&self) -> Vec<&CartItem> {
        self.items()
            .filter(|item| item.download_status == DownloadStatus::Downloaded)
            .collect()
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_files_downloaded(&self) -> usize {
        self.get_downloaded_files().len()
    }

    pub fn set_selected(&mut self, key: &str, selected: bool) -> bool {
        match self.items.get_mut(key) {
            Some(item) => {
                item.is_selected = selected;
                true
            }
            None => false,
        }
    }

    /// Select every file matching `match_files(res_id, file_path)`.
    pub fn select_matching(&mut self, res_id: &str, file_path: &str) -> usize {
        let keys: Vec<String> = self
            .match_files(res_id, file_path)
            .into_iter()
            .map(CartItem::key)
            .collect();
        for key in &keys {
            self.set_selected(key, true);
        }
        keys.len()
    }

    pub fn select_all(&mut self) {
        self.items.values_mut().for_each(|item| item.is_selected = true);
    }

    pub fn deselect_all(&mut self) {
        self.items.values_mut().for_each(|item| item.is_selected = false);
    }

    /// Set the download status of each listed key that exists.
    pub fn set_download_status<S: AsRef<str>>(
        &mut self,
        keys: &[S],
        status: DownloadStatus,
    ) -> usize {
        let mut updated = 0;
        for key in keys {
            let key: &str = key.as_ref();
            if let Some(item) = self.items.get_mut(key) {
                item.download_status = status;
                updated += 1;
            }
        }
        updated
    }

    /// Resolve a planner file reference to a cart key: either the composite key
    /// itself or the download URL of an item.
    pub fn resolve_key(&self, reference: &str) -> Option<String> {
        if self.items.contains_key(reference) {
            return Some(reference.to_string());
        }
        self.items
            .iter()
            .find(|(_, item)| item.download_url == reference)
            .map(|(key, _)| key.clone())
    }

    /// Apply a bulk command and persist the result. Returns the number of items touched.
    pub fn apply(&mut self, command: CartCommand) -> Result<usize, StorageError> {
        let touched = match command {
            CartCommand::RemoveSelected => self.remove_selected_files(),
            CartCommand::RemoveDownloaded => self.remove_downloaded_files(),
            CartCommand::SelectAll => {
                self.select_all();
                self.size()
            }
            CartCommand::DeselectAll => {
                self.deselect_all();
                self.size()
            }
        };
        self.save()?;
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn new_cart(name: &str) -> Cart {
        Cart::open(name, SharedStorage::in_memory()).unwrap()
    }

    #[test]
    fn test_add_file_to_empty_cart() {
        let mut cart = new_cart("c1");
        cart.add_file("foo", FileData::new("bar/goo", "http://x"), false, false)
            .unwrap();

        assert_eq!(cart.size(), 1);
        let item = cart.find_file("foo", "bar/goo").unwrap();
        assert_eq!(item.download_status, DownloadStatus::None);
        assert_eq!(item.download_url, "http://x");
        assert!(cart.find_file("foo", "/bar/goo").is_some());
    }

    #[test]
    fn test_add_file_twice_merges() {
        let mut cart = new_cart("c1");
        cart.add_file(
            "foo",
            FileData::new("a.txt", "http://x/1")
                .with_size(10)
                .with_status(DownloadStatus::Downloaded),
            true,
            false,
        )
        .unwrap();
        cart.add_file("foo", FileData::new("/a.txt", "http://x/2"), false, false)
            .unwrap();

        assert_eq!(cart.size(), 1);
        let item = cart.find_file("foo", "a.txt").unwrap();
        assert_eq!(item.download_url, "http://x/2");
        assert!(!item.is_selected);
        assert_eq!(item.size, Some(10));
        assert_eq!(item.download_status, DownloadStatus::Downloaded);

        cart.add_file(
            "foo",
            FileData::new("a.txt", "http://x/2").with_status(DownloadStatus::None),
            false,
            false,
        )
        .unwrap();
        assert_eq!(
            cart.find_file("foo", "a.txt").unwrap().download_status,
            DownloadStatus::None
        );
    }

    #[test]
    fn test_match_files() {
        let mut cart = new_cart("c1");
        for path in ["bar", "bar/a", "bar/b", "barn/c", "other"] {
            cart.add_file("foo", FileData::new(path, "u"), false, false)
                .unwrap();
        }
        cart.add_file("zzz", FileData::new("bar/a", "u"), false, false)
            .unwrap();

        assert_eq!(cart.match_files("foo", "").len(), 5);

        let exact = cart.match_files("foo", "bar");
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].key(), "foo/bar");

        cart.remove_file_by_id("foo/bar");
        let keys: Vec<String> = cart
            .match_files("foo", "bar")
            .into_iter()
            .map(CartItem::key)
            .collect();
        assert_eq!(keys, vec!["foo/bar/a", "foo/bar/b"]);
        assert!(cart.match_files("foo", "missing").is_empty());
    }

    #[test]
    fn test_roundtrip_empty_and_populated() {
        let cart = new_cart("c1");
        let json = cart.to_json().unwrap();
        assert_eq!(json, "{}");
        assert!(parse_items(&json).is_empty());

        let mut cart = new_cart("c2");
        cart.add_file(
            "foo",
            FileData::new("a.txt", "http://x/a")
                .with_size(3)
                .with_media_type("text/plain"),
            true,
            false,
        )
        .unwrap();
        cart.add_file("bar", FileData::new("b.csv", "http://x/b"), false, false)
            .unwrap();
        let parsed = parse_items(&cart.to_json().unwrap());
        assert_eq!(parsed, cart.items);
    }

    #[test]
    fn test_corrupt_payload_opens_empty() {
        let storage = SharedStorage::in_memory();
        storage.set("cart:broken", "{not json").unwrap();
        let cart = Cart::open("broken", storage).unwrap();
        assert!(cart.is_empty());
    }

    #[test]
    fn test_open_loads_persisted_items() {
        let storage = SharedStorage::in_memory();
        let mut cart = Cart::open("c1", storage.clone()).unwrap();
        cart.add_file("foo", FileData::new("a", "u"), true, true).unwrap();

        let reopened = Cart::open("c1", storage.clone()).unwrap();
        assert_eq!(reopened.size(), 1);
        assert_eq!(reopened.get_selected_files().len(), 1);

        let recreated = Cart::create("c1", storage).unwrap();
        assert!(recreated.is_empty());
    }

    #[test]
    fn test_remove_operations_are_in_memory_until_save() {
        let storage = SharedStorage::in_memory();
        let mut cart = Cart::open("c1", storage.clone()).unwrap();
        cart.add_file("r", FileData::new("a", "u"), true, false).unwrap();
        cart.add_file(
            "r",
            FileData::new("b", "u").with_status(DownloadStatus::Downloaded),
            false,
            false,
        )
        .unwrap();
        cart.add_file("r", FileData::new("c", "u"), false, false).unwrap();
        cart.save().unwrap();

        assert_eq!(cart.count_files_downloaded(), 1);
        assert_eq!(cart.remove_selected_files(), 1);
        assert_eq!(cart.remove_downloaded_files(), 1);
        assert_eq!(cart.size(), 1);

        assert_eq!(Cart::open("c1", storage.clone()).unwrap().size(), 3);
        cart.save().unwrap();
        assert_eq!(Cart::open("c1", storage).unwrap().size(), 1);
    }

    #[test]
    fn test_remove_files_counts_existing_only() {
        let mut cart = new_cart("c1");
        cart.add_file("r", FileData::new("a", "u"), false, false).unwrap();
        cart.add_file("r", FileData::new("b", "u"), false, false).unwrap();
        assert_eq!(cart.remove_files(&["r/a", "r/missing"]), 1);
        assert_eq!(cart.size(), 1);
    }

    #[test]
    fn test_subscribers_fire_only_on_save() {
        let mut cart = new_cart("c1");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = cart.subscribe(move |cart| {
            counter.fetch_add(cart.size(), Ordering::SeqCst);
        });

        cart.add_file("r", FileData::new("a", "u"), false, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cart.save().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cart.add_file("r", FileData::new("b", "u"), false, true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(cart.unsubscribe(id));
        cart.save().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!cart.unsubscribe(id));
    }

    #[test]
    fn test_forget_keeps_in_memory_copy() {
        let storage = SharedStorage::in_memory();
        let mut cart = Cart::open("c1", storage.clone()).unwrap();
        cart.add_file("r", FileData::new("a", "u"), false, true).unwrap();

        cart.forget().unwrap();
        assert_eq!(storage.get("cart:c1").unwrap(), None);
        assert_eq!(cart.size(), 1);
    }

    #[test]
    fn test_other_tab_change_triggers_restore() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        let mut cart_a = Cart::open("shared", tab_a.clone()).unwrap();
        let mut cart_b = Cart::open("shared", tab_b).unwrap();
        let mut sub_a = tab_a.subscribe();

        cart_b.add_file("r", FileData::new("a", "u"), false, true).unwrap();
        assert_eq!(cart_a.size(), 0);

        let change = sub_a.try_recv().unwrap();
        assert!(cart_a.on_storage_change(&change).unwrap());
        assert_eq!(cart_a.size(), 1);

        let unrelated = StorageChange {
            key: Some("cart:other".to_string()),
            origin: 0,
        };
        assert!(!cart_a.on_storage_change(&unrelated).unwrap());
    }

    #[test]
    fn test_apply_commands_persist() {
        let storage = SharedStorage::in_memory();
        let mut cart = Cart::open("c1", storage.clone()).unwrap();
        cart.add_file("r", FileData::new("a", "u"), false, false).unwrap();
        cart.add_file("r", FileData::new("b", "u"), false, false).unwrap();

        cart.apply(CartCommand::SelectAll).unwrap();
        assert_eq!(cart.get_selected_files().len(), 2);

        cart.apply(CartCommand::DeselectAll).unwrap();
        cart.set_selected("r/a", true);
        assert_eq!(cart.apply(CartCommand::RemoveSelected).unwrap(), 1);
        assert_eq!(Cart::open("c1", storage).unwrap().size(), 1);
    }

    #[test]
    fn test_resolve_key_by_url() {
        let mut cart = new_cart("c1");
        cart.add_file("r", FileData::new("a", "http://x/a"), false, false)
            .unwrap();
        assert_eq!(cart.resolve_key("r/a").as_deref(), Some("r/a"));
        assert_eq!(cart.resolve_key("http://x/a").as_deref(), Some("r/a"));
        assert_eq!(cart.resolve_key("nope"), None);
    }
}
