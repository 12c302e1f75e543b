mod availability;
mod error;
mod mutations;
mod pricing;
mod queries;

pub use availability::{free_spans, is_disjoint};
pub use error::EngineError;
pub use pricing::{quote, rental_days, MS_PER_DAY};
pub use queries::RentalFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedVehicle = Arc<RwLock<VehicleState>>;
pub type SharedRental = Arc<RwLock<RentalRequest>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    RecordsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch before handling the non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::RecordsSinceCompact { response } => {
            let _ = response.send(wal.records_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's rental engine: the fleet, the open and retained rental
/// requests, and the committed bookings, all backed by a single WAL.
///
/// Lock discipline: every calendar mutation happens under that vehicle's
/// write lock, held across conflict check, WAL append and apply — which is
/// what serializes concurrent approvals per vehicle while leaving distinct
/// vehicles fully independent. The approval transaction additionally takes
/// the rental's write lock *after* the vehicle's; reject/delete take only
/// the rental lock, so no cycle exists.
pub struct Engine {
    vehicles: DashMap<Ulid, SharedVehicle>,
    rentals: DashMap<Ulid, SharedRental>,
    bookings: DashMap<Ulid, Booking>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("vehicles", &self.vehicles.len())
            .field("rentals", &self.rentals.len())
            .field("bookings", &self.bookings.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            rentals: DashMap::new(),
            bookings: DashMap::new(),
            wal_tx,
            notify,
        };

        for event in events {
            engine.apply_replayed(event);
        }

        Ok(engine)
    }

    /// Apply one replayed event. We are the sole owner of every Arc during
    /// replay, so try_write always succeeds instantly. Never use
    /// blocking_write here — replay may run inside an async context
    /// (lazy tenant creation).
    fn apply_replayed(&self, event: Event) {
        match event {
            Event::VehicleAdded { id, org_id, rates, attrs } => {
                let v = VehicleState::new(id, org_id, rates, attrs);
                self.vehicles.insert(id, Arc::new(RwLock::new(v)));
            }
            Event::VehicleUpdated { id, rates, attrs } => {
                if let Some(v) = self.get_vehicle(&id) {
                    let mut guard = v.try_write().expect("replay: uncontended write");
                    guard.rates = rates;
                    guard.attrs = attrs;
                }
            }
            Event::VehicleRemoved { id } => {
                self.vehicles.remove(&id);
            }
            Event::RentalSubmitted {
                id,
                vehicle_id,
                renter_id,
                span,
                total_price_cents,
                submitted_at,
            } => {
                let rental = RentalRequest {
                    id,
                    vehicle_id,
                    renter_id,
                    span,
                    status: RentalStatus::Pending,
                    total_price_cents,
                    reason: None,
                    submitted_at,
                    decided_at: None,
                };
                self.rentals.insert(id, Arc::new(RwLock::new(rental)));
            }
            Event::RentalRejected { id, reason, decided_at } => {
                if let Some(r) = self.get_rental_arc(&id) {
                    let mut guard = r.try_write().expect("replay: uncontended write");
                    guard.status = RentalStatus::Rejected;
                    guard.reason = reason;
                    guard.decided_at = Some(decided_at);
                }
            }
            Event::RentalDeleted { id, decided_at } => {
                if let Some(r) = self.get_rental_arc(&id) {
                    let mut guard = r.try_write().expect("replay: uncontended write");
                    guard.status = RentalStatus::Deleted;
                    guard.decided_at = Some(decided_at);
                }
            }
            Event::RentalApproved {
                booking_id,
                rental_id,
                vehicle_id,
                renter_id,
                span,
                total_price_cents,
                pickup_address,
                dropoff_address,
                approved_at,
            } => {
                if let Some(v) = self.get_vehicle(&vehicle_id) {
                    let mut guard = v.try_write().expect("replay: uncontended write");
                    guard.insert_blocked(Blocked { booking_id, span });
                }
                self.bookings.insert(
                    booking_id,
                    Booking {
                        id: booking_id,
                        rental_id,
                        vehicle_id,
                        renter_id,
                        span,
                        total_price_cents,
                        pickup_address,
                        dropoff_address,
                        created_at: approved_at,
                    },
                );
                self.rentals.remove(&rental_id);
            }
        }
    }

    /// Write an event to the WAL via the background group-commit writer.
    /// Returns only after the record is durably on disk.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicle> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_rental_arc(&self, id: &Ulid) -> Option<SharedRental> {
        self.rentals.get(id).map(|e| e.value().clone())
    }

    pub(super) fn vehicles(&self) -> &DashMap<Ulid, SharedVehicle> {
        &self.vehicles
    }

    pub(super) fn rentals(&self) -> &DashMap<Ulid, SharedRental> {
        &self.rentals
    }

    pub(super) fn bookings(&self) -> &DashMap<Ulid, Booking> {
        &self.bookings
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state: one add per vehicle, submit(+decision) per retained request,
    /// one self-contained approval per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let vehicle_arcs: Vec<SharedVehicle> =
            self.vehicles.iter().map(|e| e.value().clone()).collect();
        for v in vehicle_arcs {
            let guard = v.read().await;
            events.push(Event::VehicleAdded {
                id: guard.id,
                org_id: guard.org_id.clone(),
                rates: guard.rates,
                attrs: guard.attrs.clone(),
            });
        }

        let rental_arcs: Vec<SharedRental> =
            self.rentals.iter().map(|e| e.value().clone()).collect();
        for r in rental_arcs {
            let guard = r.read().await;
            events.push(Event::RentalSubmitted {
                id: guard.id,
                vehicle_id: guard.vehicle_id,
                renter_id: guard.renter_id,
                span: guard.span,
                total_price_cents: guard.total_price_cents,
                submitted_at: guard.submitted_at,
            });
            match guard.status {
                RentalStatus::Pending => {}
                RentalStatus::Rejected => events.push(Event::RentalRejected {
                    id: guard.id,
                    reason: guard.reason.clone(),
                    decided_at: guard.decided_at.unwrap_or(guard.submitted_at),
                }),
                RentalStatus::Deleted => events.push(Event::RentalDeleted {
                    id: guard.id,
                    decided_at: guard.decided_at.unwrap_or(guard.submitted_at),
                }),
            }
        }

        for b in self.bookings.iter() {
            events.push(Event::RentalApproved {
                booking_id: b.id,
                rental_id: b.rental_id,
                vehicle_id: b.vehicle_id,
                renter_id: b.renter_id,
                span: b.span,
                total_price_cents: b.total_price_cents,
                pickup_address: b.pickup_address.clone(),
                dropoff_address: b.dropoff_address.clone(),
                approved_at: b.created_at,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_records_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::RecordsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as Ms
}
