// Routes a proxy router keeps for its clients

use super::ProxyError;
use crate::identity::{Contact, IdUrl, Identity};
use crate::store::settings::KEY_CURRENT_ROUTES;
use crate::store::SettingsStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

/// Minimum gap between saves caused by relay traffic alone.
const SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Packets and bytes relayed on behalf of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTraffic {
    /// Relays the client handed over for the outside world.
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Outside packets wrapped and passed on to the client.
    pub packets_in: u64,
    pub bytes_in: u64,
}

/// One client the router stands in for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub idurl: IdUrl,
    /// The client's own document, with its real contacts.
    pub identity: Identity,
    pub public_key: String,
    /// Where the client was last heard from, most recent first.
    pub address: Vec<Contact>,
    /// Unix seconds of the last request or relay from the client.
    pub updated: u64,
    #[serde(default)]
    pub traffic: RouteTraffic,
}

impl Route {
    pub fn new(identity: Identity, seen_at: Option<Contact>) -> Self {
        Self {
            idurl: identity.idurl().clone(),
            public_key: identity.public_key_hex().to_string(),
            address: seen_at.into_iter().collect(),
            identity,
            updated: unix_now(),
            traffic: RouteTraffic::default(),
        }
    }

    /// Address to deliver relays to: the last one heard from, else the
    /// contacts of the client's identity.
    pub fn delivery_contact(&self) -> Option<&Contact> {
        self.address.first().or_else(|| self.identity.contacts().first())
    }

    /// Returns true when the client showed up at a new address.
    pub fn touch(&mut self, seen_at: Option<Contact>) -> bool {
        let mut moved = false;
        if let Some(contact) = seen_at {
            moved = self.address.first() != Some(&contact);
            self.address.retain(|c| c != &contact);
            self.address.insert(0, contact);
            self.address.truncate(3);
        }
        self.updated = unix_now();
        moved
    }
}

/// Bounded set of routes kept in settings. Membership and address changes
/// are saved at once; activity and traffic counters at most every
/// [`SAVE_INTERVAL`].
pub struct RouteTable {
    routes: BTreeMap<IdUrl, Route>,
    max_routes: usize,
    settings: Option<SettingsStore>,
    last_saved: Option<Instant>,
    dirty: bool,
}

impl RouteTable {
    pub fn new(max_routes: usize, settings: Option<SettingsStore>) -> Self {
        Self {
            routes: BTreeMap::new(),
            max_routes,
            settings,
            last_saved: None,
            dirty: false,
        }
    }

    /// Replace the table with what was saved. Returns the number of routes.
    pub fn load(&mut self) -> Result<usize, ProxyError> {
        let Some(settings) = &self.settings else {
            return Ok(self.routes.len());
        };
        let saved: BTreeMap<IdUrl, Route> = settings.get_json(KEY_CURRENT_ROUTES)?.unwrap_or_default();
        self.routes = saved
            .into_iter()
            .filter(|(idurl, route)| &route.idurl == idurl && route.identity.validate().is_ok())
            .take(self.max_routes)
            .collect();
        debug!("Loaded {} saved route(s)", self.routes.len());
        Ok(self.routes.len())
    }

    pub fn get(&self, idurl: &IdUrl) -> Option<&Route> {
        self.routes.get(idurl)
    }

    pub fn contains(&self, idurl: &IdUrl) -> bool {
        self.routes.contains_key(idurl)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn ids(&self) -> Vec<IdUrl> {
        self.routes.keys().cloned().collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Add or refresh a route. A new client is refused once the table is full.
    pub fn upsert(&mut self, mut route: Route) -> Result<(), ProxyError> {
        match self.routes.get(&route.idurl) {
            Some(existing) => route.traffic = existing.traffic,
            None if self.routes.len() >= self.max_routes => {
                return Err(ProxyError::TooManyRoutes)
            }
            None => {}
        }
        self.routes.insert(route.idurl.clone(), route);
        self.save()
    }

    /// Note activity from a client. Returns false for unknown clients.
    pub fn touch(&mut self, idurl: &IdUrl, seen_at: Option<Contact>) -> bool {
        let Some(route) = self.routes.get_mut(idurl) else {
            return false;
        };
        let moved = route.touch(seen_at);
        self.changed(moved);
        true
    }

    pub fn count_outgoing(&mut self, idurl: &IdUrl, bytes: u64) {
        if let Some(route) = self.routes.get_mut(idurl) {
            route.traffic.packets_out += 1;
            route.traffic.bytes_out += bytes;
            self.changed(false);
        }
    }

    pub fn count_incoming(&mut self, idurl: &IdUrl, bytes: u64) {
        if let Some(route) = self.routes.get_mut(idurl) {
            route.traffic.packets_in += 1;
            route.traffic.bytes_in += bytes;
            self.changed(false);
        }
    }

    /// Changes not written to settings yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn remove(&mut self, idurl: &IdUrl) -> Result<Option<Route>, ProxyError> {
        let removed = self.routes.remove(idurl);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn save(&mut self) -> Result<(), ProxyError> {
        if let Some(settings) = &self.settings {
            settings.set_json(KEY_CURRENT_ROUTES, &self.routes)?;
        }
        self.last_saved = Some(Instant::now());
        self.dirty = false;
        Ok(())
    }

    fn changed(&mut self, urgent: bool) {
        self.dirty = true;
        let due = urgent
            || self
                .last_saved
                .map_or(true, |at| at.elapsed() >= SAVE_INTERVAL);
        if due {
            if let Err(e) = self.save() {
                error!("Failed to save routes: {}", e);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
