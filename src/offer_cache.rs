//! Bounded holding area for resource offers awaiting use.
//!
//! The cache is advisory: an admitted offer may still be rescinded by the
//! master or expired by the scheduler before it is consumed.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::driver::{Offer, OfferId};

pub struct OfferCache {
    offers: Mutex<VecDeque<Offer>>,
    available: Notify,
    capacity: usize,
    single_instance_per_worker: bool,
}

impl OfferCache {
    pub fn new(capacity: usize, single_instance_per_worker: bool) -> Self {
        Self {
            offers: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
            capacity,
            single_instance_per_worker,
        }
    }

    /// Admit an offer. Returns false when the cache is full or, in
    /// single-instance-per-worker mode, when an offer from the same worker
    /// is already cached.
    pub fn push(&self, offer: Offer) -> bool {
        let mut offers = self.offers.lock().unwrap();
        if offers.len() >= self.capacity {
            debug!(offer_id = offer.id.get(), "offer cache full, rejecting");
            return false;
        }
        if self.single_instance_per_worker
            && offers.iter().any(|o| o.worker_id == offer.worker_id)
        {
            debug!(
                offer_id = offer.id.get(),
                worker_id = offer.worker_id.get(),
                "offer from this worker already cached, rejecting"
            );
            return false;
        }
        offers.push_back(offer);
        drop(offers);
        self.available.notify_one();
        true
    }

    /// Remove a specific offer; returns whether it was present.
    pub fn rescind(&self, offer_id: &OfferId) -> bool {
        let mut offers = self.offers.lock().unwrap();
        let before = offers.len();
        offers.retain(|o| &o.id != offer_id);
        before != offers.len()
    }

    /// Pop the oldest offer, waiting until one is available.
    pub async fn blocking_pop(&self) -> Offer {
        loop {
            if let Some(offer) = self.offers.lock().unwrap().pop_front() {
                return offer;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.offers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
