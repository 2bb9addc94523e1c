use anyhow::Context;
use aya::maps::{HashMap, MapData, MapError};
use dashmap::DashMap;
use sentinel_common::{Denylist, DENYLIST_BLOCKED, DENYLIST_MAX_ENTRIES};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Control-plane side of the source denylist.
///
/// Keys are stored as `u32::from(addr)`, which is the host-order value the
/// classifier looks up.
pub trait DenylistStore: Send + Sync {
    /// Returns `false` if the address was already present.
    fn insert(&self, addr: Ipv4Addr) -> anyhow::Result<bool>;
    /// Returns `false` if the address was not present.
    fn remove(&self, addr: Ipv4Addr) -> anyhow::Result<bool>;
    fn contains(&self, addr: Ipv4Addr) -> anyhow::Result<bool>;
    fn entries(&self) -> anyhow::Result<Vec<Ipv4Addr>>;

    fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries()?.len())
    }
}

/// The `DENYLIST` map of the loaded program.
pub struct KernelDenylist {
    map: Mutex<HashMap<MapData, u32, u8>>,
}

impl KernelDenylist {
    pub fn new(map: HashMap<MapData, u32, u8>) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<MapData, u32, u8>>> {
        self.map
            .lock()
            .map_err(|_| anyhow::anyhow!("denylist map lock poisoned"))
    }
}

fn lookup(map: &HashMap<MapData, u32, u8>, key: u32) -> anyhow::Result<bool> {
    match map.get(&key, 0) {
        Ok(_) => Ok(true),
        Err(MapError::KeyNotFound) => Ok(false),
        Err(e) => Err(e).context("denylist lookup failed"),
    }
}

impl DenylistStore for KernelDenylist {
    fn insert(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        let key = u32::from(addr);
        let mut map = self.lock()?;
        if lookup(&map, key)? {
            return Ok(false);
        }
        map.insert(key, DENYLIST_BLOCKED, 0)
            .with_context(|| format!("failed to denylist {addr}"))?;
        Ok(true)
    }

    fn remove(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        let key = u32::from(addr);
        let mut map = self.lock()?;
        if !lookup(&map, key)? {
            return Ok(false);
        }
        map.remove(&key)
            .with_context(|| format!("failed to remove {addr} from denylist"))?;
        Ok(true)
    }

    fn contains(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        let map = self.lock()?;
        lookup(&map, u32::from(addr))
    }

    fn entries(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        let map = self.lock()?;
        let mut addrs = map
            .keys()
            .map(|key| key.map(Ipv4Addr::from))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to iterate denylist")?;
        addrs.sort();
        Ok(addrs)
    }
}

/// In-process denylist with the same capacity as the kernel map.
///
/// Also usable directly by the classifier, which runs the host pipeline
/// against it.
pub struct MemoryDenylist {
    entries: DashMap<u32, u8>,
    max_entries: usize,
}

impl MemoryDenylist {
    pub fn new() -> Self {
        Self::with_max_entries(DENYLIST_MAX_ENTRIES as usize)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }
}

impl Default for MemoryDenylist {
    fn default() -> Self {
        Self::new()
    }
}

impl Denylist for MemoryDenylist {
    fn contains(&self, addr: u32) -> bool {
        self.entries.contains_key(&addr)
    }
}

impl DenylistStore for MemoryDenylist {
    fn insert(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        let key = u32::from(addr);
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        // Same failure the kernel reports (E2BIG) for a full hash map.
        anyhow::ensure!(
            self.entries.len() < self.max_entries,
            "denylist is full ({} entries)",
            self.max_entries
        );
        Ok(self.entries.insert(key, DENYLIST_BLOCKED).is_none())
    }

    fn remove(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        Ok(self.entries.remove(&u32::from(addr)).is_some())
    }

    fn contains(&self, addr: Ipv4Addr) -> anyhow::Result<bool> {
        Ok(self.entries.contains_key(&u32::from(addr)))
    }

    fn entries(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        let mut addrs: Vec<_> = self.entries.iter().map(|e| Ipv4Addr::from(*e.key())).collect();
        addrs.sort();
        Ok(addrs)
    }

    fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.len())
    }
}

/// Loads the configured startup entries, logging each one.
pub fn seed(store: &dyn DenylistStore, addrs: &[Ipv4Addr]) -> anyhow::Result<()> {
    for addr in addrs {
        if store.insert(*addr)? {
            tracing::info!("Denylisted {} (startup)", addr);
        }
    }
    Ok(())
}
