use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::{abortable, AbortHandle};
use futures::StreamExt;
use log::{debug, trace};

use super::{AttributeId, AttributeMap, Client};
use crate::communication::Uuid;
use crate::Address;

pub type SearchId = u32;

/// Called with each attribute list a search finds on a peer.
pub type ResultCallback = Arc<dyn Fn(Address, &AttributeMap) + Send + Sync>;

/// Runs a fixed set of searches against peers as they are handed over.
///
/// Each peer gets one session holding its [`Client`]. The session, and with
/// it the client, is dropped once every search started on it has finished.
#[derive(Clone, Default)]
pub struct ServiceDiscoverer {
    state: Arc<Mutex<State>>,
}

struct Search {
    uuid: Uuid,
    attributes: Vec<AttributeId>,
    callback: ResultCallback,
}

struct Session {
    generation: u64,
    client: Client,
    outstanding: HashMap<SearchId, AbortHandle>,
}

#[derive(Default)]
struct State {
    next_id: SearchId,
    next_generation: u64,
    searches: BTreeMap<SearchId, Search>,
    sessions: HashMap<Address, Session>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn callback_for(state: &Weak<Mutex<State>>, id: SearchId) -> Option<ResultCallback> {
    let state = state.upgrade()?;
    let callback = lock(&state).callback(id);
    callback
}

impl State {
    fn allocate_id(&mut self) -> Option<SearchId> {
        for _ in 0..=self.searches.len() {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.searches.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        None
    }

    fn callback(&self, id: SearchId) -> Option<ResultCallback> {
        self.searches.get(&id).map(|search| search.callback.clone())
    }

    fn finish_peer_search(&mut self, peer: Address, generation: u64, id: SearchId) {
        let session = match self.sessions.get_mut(&peer) {
            Some(session) if session.generation == generation => session,
            _ => return,
        };

        session.outstanding.remove(&id);
        if session.outstanding.is_empty() {
            debug!("discovery on {} finished", peer);
            self.sessions.remove(&peer);
        }
    }
}

impl ServiceDiscoverer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a search for records of class `uuid`, reporting `attributes` of
    /// each (all of them if empty). Applies to sessions started afterwards.
    pub fn add_search<I>(&self, uuid: Uuid, attributes: I, callback: ResultCallback) -> SearchId
    where
        I: IntoIterator<Item = AttributeId>,
    {
        let mut state = lock(&self.state);
        // there are fewer searches than ids, so this always finds one
        let id = state.allocate_id().unwrap_or_default();
        state.searches.insert(
            id,
            Search {
                uuid,
                attributes: attributes.into_iter().collect(),
                callback,
            },
        );
        trace!("added search {} for {}", id, uuid);
        id
    }

    /// Removes a search, stopping it on every peer it is running on.
    pub fn remove_search(&self, id: SearchId) -> bool {
        let mut state = lock(&self.state);
        let removed = state.searches.remove(&id).is_some();
        state.sessions.retain(|_, session| {
            if let Some(handle) = session.outstanding.remove(&id) {
                handle.abort();
            }
            !session.outstanding.is_empty()
        });
        removed
    }

    /// Runs every search on `peer` through `client`. Returns `false`, dropping
    /// the client, if there is nothing to search for or `peer` already has a
    /// session.
    pub fn start_service_discovery(&self, peer: Address, client: Client) -> bool {
        let mut state = lock(&self.state);
        if state.searches.is_empty() {
            debug!("no searches to run on {}", peer);
            return false;
        }
        if state.sessions.contains_key(&peer) {
            debug!("already discovering services on {}", peer);
            return false;
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let mut session = Session {
            generation,
            client,
            outstanding: HashMap::new(),
        };
        for (id, search) in &state.searches {
            let handle = self.spawn_search(peer, generation, *id, search, &session.client);
            session.outstanding.insert(*id, handle);
        }
        state.sessions.insert(peer, session);
        true
    }

    /// Runs one search on `peer`, reusing its session if there is one, in
    /// which case `client` is dropped.
    pub fn single_search(&self, id: SearchId, peer: Address, client: Client) -> bool {
        let mut state = lock(&self.state);
        let State {
            searches,
            sessions,
            next_generation,
            ..
        } = &mut *state;

        let search = match searches.get(&id) {
            Some(search) => search,
            None => return false,
        };

        let session = sessions.entry(peer).or_insert_with(|| {
            let generation = *next_generation;
            *next_generation += 1;
            Session {
                generation,
                client,
                outstanding: HashMap::new(),
            }
        });
        if session.outstanding.contains_key(&id) {
            return false;
        }

        let handle = self.spawn_search(peer, session.generation, id, search, &session.client);
        session.outstanding.insert(id, handle);
        true
    }

    pub fn search_count(&self) -> usize {
        lock(&self.state).searches.len()
    }

    pub fn has_session(&self, peer: Address) -> bool {
        lock(&self.state).sessions.contains_key(&peer)
    }

    fn spawn_search(
        &self,
        peer: Address,
        generation: u64,
        id: SearchId,
        search: &Search,
        client: &Client,
    ) -> AbortHandle {
        let results =
            client.service_search_attributes([search.uuid], search.attributes.iter().copied());
        let (mut results, handle) = abortable(results);
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);

        tokio::spawn(async move {
            while let Some(result) = results.next().await {
                let attributes = match result {
                    Ok(attributes) => attributes,
                    Err(e) => {
                        debug!("search {} on {} failed: {}", id, peer, e);
                        break;
                    }
                };

                match callback_for(&state, id) {
                    Some(callback) => callback(peer, &attributes),
                    None => break,
                }
            }

            if let Some(state) = state.upgrade() {
                lock(&state).finish_peer_search(peer, generation, id);
            }
        });

        handle
    }
}
