use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use uuid::Uuid;

use super::Swap;
use super::store::{CursorStore, SwapRepository};
use crate::chain::Chain;

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    swaps: Mutex<BTreeMap<Uuid, Swap>>,
    cursors: Mutex<HashMap<Chain, u64>>,
    key_index: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Swap> {
        self.swaps
            .lock()
            .expect("store mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl SwapRepository for MemoryStore {
    fn find_by_id(&self, id: Uuid) -> Result<Option<Swap>> {
        Ok(self
            .swaps
            .lock()
            .expect("store mutex poisoned")
            .get(&id)
            .cloned())
    }

    fn find_unfinished(&self) -> Result<Vec<Swap>> {
        let mut out: Vec<Swap> = self
            .swaps
            .lock()
            .expect("store mutex poisoned")
            .values()
            .filter(|s| !s.is_done())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.common().created_at);
        Ok(out)
    }

    fn save(&self, swap: &Swap) -> Result<()> {
        self.swaps
            .lock()
            .expect("store mutex poisoned")
            .insert(swap.id(), swap.clone());
        Ok(())
    }
}

impl CursorStore for MemoryStore {
    fn cursor(&self, chain: Chain) -> Result<Option<u64>> {
        Ok(self
            .cursors
            .lock()
            .expect("store mutex poisoned")
            .get(&chain)
            .copied())
    }

    fn set_cursor(&self, chain: Chain, cursor: u64) -> Result<()> {
        self.cursors
            .lock()
            .expect("store mutex poisoned")
            .insert(chain, cursor);
        Ok(())
    }

    fn next_key_index(&self) -> Result<u32> {
        let mut index = self.key_index.lock().expect("store mutex poisoned");
        let current = *index;
        *index += 1;
        Ok(current)
    }
}
