//! Short-lived cache of the NGO last resolved for each listing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedNgo {
    pub ngo_id: i64,
    pub food_preferences: Vec<String>,
}

impl CachedNgo {
    pub fn accepts_food_type(&self, food_type: &str) -> bool {
        !self.food_preferences.iter().any(|t| t == food_type)
    }
}

pub struct NgoCache {
    ttl: Duration,
    entries: Mutex<HashMap<i64, (Instant, CachedNgo)>>,
}

impl NgoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, listing_id: i64) -> Option<CachedNgo> {
        self.get_at(listing_id, Instant::now())
    }

    pub fn insert(&self, listing_id: i64, ngo: CachedNgo) {
        self.insert_at(listing_id, ngo, Instant::now());
    }

    pub fn invalidate(&self, listing_id: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&listing_id);
        }
    }

    fn get_at(&self, listing_id: i64, now: Instant) -> Option<CachedNgo> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&listing_id) {
            Some((expires_at, ngo)) if *expires_at > now => Some(ngo.clone()),
            Some(_) => {
                entries.remove(&listing_id);
                None
            }
            None => None,
        }
    }

    fn insert_at(&self, listing_id: i64, ngo: CachedNgo, now: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, (expires_at, _)| *expires_at > now);
            entries.insert(listing_id, (now + self.ttl, ngo));
        }
    }
}
