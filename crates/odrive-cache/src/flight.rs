//! Single-flight map: at most one materialization or ingest per id.
//!
//! The map holds weak handles to shared futures and never does I/O. Whoever
//! polls the shared future drives it; when the last waiter drops it, the
//! future (and its [`FlightTicket`]) is dropped, which clears the entry and
//! any temp file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use odrive_core::ObjectId;
use tracing::debug;

use crate::error::CacheError;

pub type FlightResult = Result<(), Arc<CacheError>>;
pub type FlightFuture = Shared<BoxFuture<'static, FlightResult>>;

#[derive(Default)]
pub struct Flights {
    map: Mutex<HashMap<ObjectId, (u64, WeakShared<BoxFuture<'static, FlightResult>>)>>,
    next_gen: AtomicU64,
}

/// What a caller should do after consulting the map.
pub enum Joined {
    /// Someone is already working on this id; await the future.
    Wait(FlightFuture),
    /// We inserted a new flight; await it to drive it.
    Lead(FlightFuture),
    /// The starter declined (the file is already settled on disk).
    Settled,
}

impl Flights {
    /// Join the flight for `id`, or start one with `make`.
    ///
    /// `needed` and `make` run under the map lock; they must not block on
    /// I/O beyond a stat. `needed` returning false means the file settled
    /// since the caller last looked.
    pub fn join_or_start<N, M>(self: &Arc<Self>, id: ObjectId, needed: N, make: M) -> Joined
    where
        N: FnOnce() -> bool,
        M: FnOnce(FlightTicket) -> BoxFuture<'static, FlightResult>,
    {
        let mut map = self.map.lock().expect("flight map poisoned");
        if let Some((_, weak)) = map.get(&id) {
            if let Some(fut) = weak.upgrade() {
                return Joined::Wait(fut);
            }
        }
        if !needed() {
            return Joined::Settled;
        }
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let ticket = FlightTicket {
            flights: Arc::clone(self),
            id,
            gen,
            temp: None,
        };
        let shared = make(ticket).shared();
        if let Some(weak) = shared.downgrade() {
            map.insert(id, (gen, weak));
        }
        debug!(id = %id, gen, "flight started");
        Joined::Lead(shared)
    }

    pub fn in_flight(&self, id: &ObjectId) -> bool {
        let map = self.map.lock().expect("flight map poisoned");
        map.get(id).is_some_and(|(_, w)| w.upgrade().is_some())
    }

    fn finish(&self, id: &ObjectId, gen: u64) {
        let mut map = self.map.lock().expect("flight map poisoned");
        if map.get(id).is_some_and(|(g, _)| *g == gen) {
            map.remove(id);
        }
    }
}

/// Owned by the flight's future. Dropping it releases the map entry and,
/// unless disarmed, deletes the temp file.
pub struct FlightTicket {
    flights: Arc<Flights>,
    id: ObjectId,
    gen: u64,
    temp: Option<PathBuf>,
}

impl FlightTicket {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Delete `path` on drop unless [`disarm`](Self::disarm) is called.
    pub fn guard_temp(&mut self, path: PathBuf) {
        self.temp = Some(path);
    }

    /// The temp file was renamed into place; leave it alone.
    pub fn disarm(&mut self) {
        self.temp = None;
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        if let Some(path) = self.temp.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "removing temp file: {e}");
                }
            }
        }
        self.flights.finish(&self.id, self.gen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn concurrent_joiners_share_one_flight() {
        let flights = Arc::new(Flights::default());
        let started = Arc::new(AtomicUsize::new(0));
        let id = ObjectId::random();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        let mut futs = Vec::new();
        for _ in 0..8 {
            let started = Arc::clone(&started);
            let rx = Arc::clone(&rx);
            let joined = flights.join_or_start(
                id,
                || true,
                move |ticket| {
                    started.fetch_add(1, Ordering::SeqCst);
                    let rx = rx.lock().unwrap().take().unwrap();
                    async move {
                        let _ticket = ticket;
                        let _ = rx.await;
                        Ok(())
                    }
                    .boxed()
                },
            );
            match joined {
                Joined::Wait(f) | Joined::Lead(f) => futs.push(f),
                Joined::Settled => unreachable!(),
            }
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(flights.in_flight(&id));
        tx.send(()).unwrap();
        for f in futs {
            f.await.unwrap();
        }
        assert!(!flights.in_flight(&id));
    }

    #[test]
    fn settled_files_need_no_flight() {
        let flights = Arc::new(Flights::default());
        let joined = flights.join_or_start(
            ObjectId::random(),
            || false,
            |_ticket| async { Ok(()) }.boxed(),
        );
        assert!(matches!(joined, Joined::Settled));
    }

    #[tokio::test]
    async fn dropping_every_waiter_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let temp = tmp.path().join("x.caching");
        std::fs::write(&temp, b"partial").unwrap();

        let flights = Arc::new(Flights::default());
        let id = ObjectId::random();
        let path = temp.clone();
        let joined = flights.join_or_start(
            id,
            || true,
            move |mut ticket| {
                ticket.guard_temp(path);
                async move {
                    let _ticket = ticket;
                    futures::future::pending::<()>().await;
                    Ok(())
                }
                .boxed()
            },
        );
        let Joined::Lead(fut) = joined else {
            panic!("expected to lead")
        };
        // Poll once so the future owns its ticket, then abandon it.
        assert!(futures::poll!(fut.clone()).is_pending());
        drop(fut);
        assert!(!flights.in_flight(&id));
        assert!(!temp.exists());
    }
}
