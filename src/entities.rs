//! Entity registry: known program IDs and the read-through entity cache.
//!
//! The seed table below is configuration, not behavior; ops append new
//! entries as programs ship. At startup the table is inserted-if-absent
//! into the store and the process-wide cache is warmed from it. Writes go
//! through the registry so the cache entry is invalidated.

use anyhow::Result;
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::storage::models::{Entity, EntityKind, RiskLevel};
use crate::storage::Store;

/// Known program table: address, kind, display name.
const KNOWN_PROGRAMS: &[(&str, EntityKind, &str)] = &[
    // DEXes
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", EntityKind::Dex, "Raydium AMM v4"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", EntityKind::Dex, "Raydium CLMM"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", EntityKind::Dex, "Orca Whirlpool"),
    ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", EntityKind::Dex, "Jupiter v6"),
    ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", EntityKind::Dex, "Meteora DLMM"),
    ("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P", EntityKind::Dex, "Pump.fun"),
    ("PhoeNiXZ8ByJGLkxNfZRnkUfjvmuYqLR89jjFHGqdXY", EntityKind::Dex, "Phoenix"),
    ("opnb2LAfJYbRMAHHvqjCwQxanZn7ReEHp1k81EohpZb", EntityKind::Dex, "OpenBook v2"),
    // Bridges
    ("wormDTUJ6AWPNvk59vGQbDvGJmqbDTdgWgAqcLBCgUb", EntityKind::Bridge, "Wormhole Token Bridge"),
    ("worm2ZoG2kUd4vFXhvjh93UUH596ayRfgQ2MgjNMTth", EntityKind::Bridge, "Wormhole Core"),
    ("DEbrdGj3HsRsAzx6uH4MKyREKxVAfBydijLUF3ygsFfh", EntityKind::Bridge, "deBridge"),
    // Lending
    ("So1endDq2YkqhipRh3WViPa8hdiSpxWy6z3Z6tMCpAo", EntityKind::Lending, "Solend"),
    ("MFv2hWf31Z9kbCa1snEPYctwafyhdvnV7FZnsebVacA", EntityKind::Lending, "marginfi v2"),
    ("KLend2g3cP87fffoy8q1mQqGKjrxjC8boSyAYavgmjD", EntityKind::Lending, "Kamino Lend"),
];

/// DEX display name for a program address, if known.
pub fn dex_name(address: &str) -> Option<&'static str> {
    KNOWN_PROGRAMS
        .iter()
        .find(|(addr, kind, _)| *addr == address && *kind == EntityKind::Dex)
        .map(|(_, _, name)| *name)
}

/// Cache capacity for resolved entities.
const ENTITY_CACHE_CAPACITY: u64 = 10_000;
/// Entity cache entry lifetime.
const ENTITY_CACHE_TTL: Duration = Duration::from_secs(600);

/// Process-wide entity lookup with a read-through cache over the store.
pub struct EntityRegistry {
    store: Arc<dyn Store>,
    cache: Cache<String, Option<Entity>>,
}

impl EntityRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(ENTITY_CACHE_CAPACITY)
                .time_to_live(ENTITY_CACHE_TTL)
                .build(),
        }
    }

    /// Insert the known-program table (absent rows only) and warm the
    /// cache. Called once at startup.
    pub async fn seed(&self) -> Result<()> {
        let mut seeded = 0usize;
        for (address, kind, name) in KNOWN_PROGRAMS {
            if self.store.get_entity(address).await?.is_none() {
                let entity = Entity {
                    address: address.to_string(),
                    entity_kind: *kind,
                    name: Some(name.to_string()),
                    risk_level: RiskLevel::Low,
                    risk_score: 0,
                    metadata: serde_json::json!({"seeded": true}),
                };
                self.store.upsert_entity(entity.clone()).await?;
                seeded += 1;
            }
            // Warm the cache either way.
            let entity = self.store.get_entity(address).await?;
            self.cache.insert(address.to_string(), entity).await;
        }
        info!(total = KNOWN_PROGRAMS.len(), seeded, "entity registry seeded");
        Ok(())
    }

    /// Resolve an address through the cache, falling back to the store.
    pub async fn resolve(&self, address: &str) -> Result<Option<Entity>> {
        if let Some(cached) = self.cache.get(address).await {
            return Ok(cached);
        }
        let entity = self.store.get_entity(address).await?;
        self.cache.insert(address.to_string(), entity.clone()).await;
        Ok(entity)
    }

    /// Persist a newly observed entity and invalidate its cache slot.
    pub async fn record(&self, entity: Entity) -> Result<()> {
        debug!(address = %entity.address, kind = entity.entity_kind.as_str(), "recording entity");
        self.store.upsert_entity(entity.clone()).await?;
        self.cache.invalidate(&entity.address).await;
        Ok(())
    }

    /// All addresses of a kind, for the risk proximity sets.
    pub async fn addresses_of_kind(&self, kind: EntityKind) -> Result<HashSet<String>> {
        Ok(self
            .store
            .entities_by_kind(kind)
            .await?
            .into_iter()
            .map(|e| e.address)
            .collect())
    }
}
