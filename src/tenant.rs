use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::compactor;
use crate::engine::{SlotEngine, DEFAULT_STORE_TIMEOUT};
use crate::limits::*;
use crate::model::ShopSettings;
use crate::notify::NotifyHub;
use crate::store::{RecordStore, WalStore};

/// One shop: its durable store and the engine in front of it.
pub struct Shop {
    pub store: Arc<WalStore>,
    pub engine: Arc<SlotEngine>,
}

impl Shop {
    pub fn notify(&self) -> &Arc<NotifyHub> {
        self.store.notify()
    }
}

/// Manages per-shop engines. Shop = database name from the pgwire connection;
/// each gets its own WAL and compactor.
pub struct ShopManager {
    shops: DashMap<String, Arc<Shop>>,
    /// Serializes first-time opens so two connections can't both replay a WAL.
    opening: Mutex<()>,
    data_dir: PathBuf,
    compact_threshold: u64,
    store_timeout: Duration,
}

/// The shop name doubles as the WAL file stem, so it must already be one.
fn safe_file_stem(shop: &str) -> io::Result<&str> {
    if shop.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "shop name too long"));
    }
    if shop.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty shop name"));
    }
    if !shop
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "shop name may only use ASCII letters, digits, '_' and '-'",
        ));
    }
    Ok(shop)
}

impl ShopManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            shops: DashMap::new(),
            opening: Mutex::new(()),
            data_dir,
            compact_threshold,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Get or lazily open a shop. Names are case-insensitive. A shop without
    /// settings is seeded with the default week and hours.
    pub async fn get_or_create(&self, name: &str) -> io::Result<Arc<Shop>> {
        let stem = safe_file_stem(name)?.to_ascii_lowercase();
        if let Some(shop) = self.shops.get(&stem) {
            return Ok(shop.value().clone());
        }

        let _opening = self.opening.lock().await;
        if let Some(shop) = self.shops.get(&stem) {
            return Ok(shop.value().clone());
        }
        if self.shops.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many shops"));
        }

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let store = Arc::new(WalStore::open(wal_path, Arc::new(NotifyHub::new()))?);
        if store.shop_settings().await.map_err(io::Error::other)?.is_none() {
            store
                .save_settings(ShopSettings::seed(Utc::now()))
                .await
                .map_err(io::Error::other)?;
            tracing::info!(shop = %stem, "seeded default shop settings");
        }

        let compactor_store = store.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_store, threshold).await;
        });

        let engine = Arc::new(SlotEngine::new(store.clone()).with_timeout(self.store_timeout));
        let shop = Arc::new(Shop { store, engine });
        self.shops.insert(stem, shop.clone());
        metrics::gauge!(crate::observability::SHOPS_ACTIVE).set(self.shops.len() as f64);
        Ok(shop)
    }
}
