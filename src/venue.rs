use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::clock::Clock;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Venue for clients that connect without a database name.
pub const DEFAULT_VENUE: &str = "default";

/// One engine per venue. A venue is the database name on the pgwire
/// connection; each has its own WAL and compactor.
pub struct VenueManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Held while a venue's WAL is replayed. Lookups of open venues never take it.
    opening: Mutex<()>,
    data_dir: PathBuf,
    compact_threshold: u64,
    clock: Arc<dyn Clock>,
}

impl VenueManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            opening: Mutex::new(()),
            data_dir,
            compact_threshold,
            clock,
        }
    }

    /// Get or lazily open the engine for `venue`. Names are reduced to
    /// `[A-Za-z0-9_-]`, so `../north` and `north` are the same venue.
    pub fn get_or_create(&self, venue: &str) -> io::Result<Arc<Engine>> {
        let key = venue_key(venue)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }

        // Two engines on one file would each truncate and append to it, so
        // opens are serialized and the map is re-checked under the lock.
        let _opening = self.opening.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_VENUES {
            return Err(io::Error::other("too many venues"));
        }

        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let engine = Arc::new(Engine::with_clock(wal_path, self.clock.clone())?);
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });
        self.engines.insert(key, engine.clone());

        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("venue {venue:?} opened");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// File-name-safe key for a venue name; only `[A-Za-z0-9_-]` reaches the data directory.
pub fn venue_key(venue: &str) -> io::Result<String> {
    if venue.len() > MAX_VENUE_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "venue name too long"));
    }
    let key: String = venue
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if key.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty venue name"));
    }
    Ok(key)
}
