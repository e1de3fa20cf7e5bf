//! Shared side-channel state for one import run.
//!
//! Workers append map coordinates and guard include-page creation through
//! these handles; both are mutex-protected because page imports run on a
//! pool with no inter-worker ordering.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    pub page_name: String,
    pub lat: String,
    pub lon: String,
}

#[derive(Clone, Default)]
pub struct SideChannels {
    mapdata: Arc<Mutex<Vec<MapData>>>,
    includes_in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SideChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_mapdata(&self, record: MapData) {
        let mut mapdata = self.mapdata.lock().expect("mapdata lock poisoned");
        mapdata.push(record);
    }

    /// Drains the accumulated records, leaving the channel empty.
    pub fn take_mapdata(&self) -> Vec<MapData> {
        let mut mapdata = self.mapdata.lock().expect("mapdata lock poisoned");
        std::mem::take(&mut *mapdata)
    }

    /// Claims an include page for creation. Returns false when another
    /// worker already holds the claim, making check-then-create atomic.
    pub fn claim_include_page(&self, name: &str) -> bool {
        let mut in_flight = self
            .includes_in_flight
            .lock()
            .expect("include guard lock poisoned");
        in_flight.insert(name.to_string())
    }
}
