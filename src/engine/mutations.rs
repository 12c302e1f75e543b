use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::pricing::quote;
use super::{now_ms, Engine, EngineError};

/// Applied when an approval supplies no explicit addresses.
pub const DEFAULT_PICKUP_ADDRESS: &str = "Default Pickup Address";
pub const DEFAULT_DROPOFF_ADDRESS: &str = "Default Dropoff Address";

fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end < span.start {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RENTAL_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

fn validate_text(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_rates(rates: &RateCard) -> Result<(), EngineError> {
    if rates.daily_cents <= 0 {
        return Err(EngineError::InvalidInput("daily rate must be positive"));
    }
    for rate in [rates.weekly_cents, rates.monthly_cents].into_iter().flatten() {
        if rate <= 0 {
            return Err(EngineError::InvalidInput("rates must be positive"));
        }
    }
    Ok(())
}

fn validate_attrs(attrs: &VehicleAttrs) -> Result<(), EngineError> {
    validate_text(&attrs.model, "model too long")?;
    validate_text(&attrs.location, "location too long")?;
    if let Some(c) = &attrs.category {
        validate_text(c, "category too long")?;
    }
    if let Some(u) = &attrs.image_url {
        validate_text(u, "image url too long")?;
    }
    Ok(())
}

impl Engine {
    // ── Fleet management ─────────────────────────────────────

    pub async fn create_vehicle(
        &self,
        id: Ulid,
        org_id: String,
        rates: RateCard,
        attrs: VehicleAttrs,
    ) -> Result<(), EngineError> {
        if self.vehicles().len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        validate_text(&org_id, "organization id too long")?;
        validate_rates(&rates)?;
        validate_attrs(&attrs)?;
        if self.vehicles().contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleAdded {
            id,
            org_id: org_id.clone(),
            rates,
            attrs: attrs.clone(),
        };
        self.wal_append(&event).await?;
        let state = VehicleState::new(id, org_id, rates, attrs);
        self.vehicles()
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(state)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_vehicle(&self, id: Ulid, patch: VehiclePatch) -> Result<(), EngineError> {
        if patch.is_empty() {
            return Err(EngineError::InvalidInput("empty update"));
        }
        let vehicle = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = vehicle.write().await;
        if !self.vehicles().contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let mut rates = guard.rates;
        let mut attrs = guard.attrs.clone();
        if let Some(daily) = patch.daily_cents {
            rates.daily_cents = daily;
        }
        if let Some(weekly) = patch.weekly_cents {
            rates.weekly_cents = weekly;
        }
        if let Some(monthly) = patch.monthly_cents {
            rates.monthly_cents = monthly;
        }
        if let Some(model) = patch.model {
            attrs.model = model;
        }
        if let Some(location) = patch.location {
            attrs.location = location;
        }
        if let Some(category) = patch.category {
            attrs.category = category;
        }
        if let Some(image_url) = patch.image_url {
            attrs.image_url = image_url;
        }
        validate_rates(&rates)?;
        validate_attrs(&attrs)?;

        let event = Event::VehicleUpdated {
            id,
            rates,
            attrs: attrs.clone(),
        };
        self.wal_append(&event).await?;
        guard.rates = rates;
        guard.attrs = attrs;
        self.notify.send(id, &event);
        Ok(())
    }

    /// Remove a vehicle from the fleet. Refused while committed bookings
    /// still block its calendar.
    pub async fn delete_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let vehicle = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = vehicle.write().await;
        if !self.vehicles().contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !guard.blocked.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::VehicleRemoved { id };
        self.wal_append(&event).await?;
        self.vehicles().remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Rental state machine ─────────────────────────────────

    /// Create a pending rental request. The price is quoted from the
    /// vehicle's current rate card here and never recomputed. Availability
    /// is NOT checked — that happens at approval time.
    pub async fn submit_rental(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        renter_id: Ulid,
        span: Span,
    ) -> Result<RentalRequest, EngineError> {
        if self.rentals().len() >= MAX_RENTALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rental requests"));
        }
        validate_span(&span)?;
        if self.rentals().contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let vehicle = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;

        let total_price_cents = {
            let guard = vehicle.read().await;
            quote(&guard.rates, &span)?
        };

        let submitted_at = now_ms();
        let event = Event::RentalSubmitted {
            id,
            vehicle_id,
            renter_id,
            span,
            total_price_cents,
            submitted_at,
        };
        self.wal_append(&event).await?;

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
        self.rentals().insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(rental.clone())),
        );
        self.notify.send(vehicle_id, &event);
        Ok(rental)
    }

    /// Reject a pending request, retaining it with the reason. Only legal
    /// from pending: a decided request cannot be re-decided.
    pub async fn reject_rental(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<RentalRequest, EngineError> {
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let rental = self.get_rental_arc(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rental.write().await;
        // An approval may have consumed the request while we waited.
        if !self.rentals().contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.status != RentalStatus::Pending {
            return Err(EngineError::InvalidState {
                id,
                status: guard.status,
            });
        }

        let decided_at = now_ms();
        let event = Event::RentalRejected {
            id,
            reason: reason.clone(),
            decided_at,
        };
        self.wal_append(&event).await?;
        guard.status = RentalStatus::Rejected;
        guard.reason = reason;
        guard.decided_at = Some(decided_at);
        Ok(guard.clone())
    }

    /// Administrative removal: legal from any state, retained as a
    /// `deleted` row. Deleting an already-deleted request is a no-op.
    pub async fn delete_rental(&self, id: Ulid) -> Result<RentalRequest, EngineError> {
        let rental = self.get_rental_arc(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rental.write().await;
        if !self.rentals().contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.status == RentalStatus::Deleted {
            return Ok(guard.clone());
        }

        let decided_at = now_ms();
        let event = Event::RentalDeleted { id, decided_at };
        self.wal_append(&event).await?;
        guard.status = RentalStatus::Deleted;
        guard.decided_at = Some(decided_at);
        Ok(guard.clone())
    }

    // ── Approval transaction ─────────────────────────────────

    /// Convert a pending request into an immutable booking, atomically
    /// blocking the vehicle's calendar for the interval.
    ///
    /// The vehicle write lock is held from the conflict check through WAL
    /// commit and apply, so two approvals for the same vehicle can never
    /// both observe "free" for overlapping intervals. A conflict aborts the
    /// whole operation and leaves the request pending for the admin to
    /// re-decide; it is not auto-rejected. The WAL record is appended
    /// before any in-memory change, and carries the entire transition, so
    /// a crash either replays all of it or none of it.
    pub async fn approve_rental(
        &self,
        booking_id: Ulid,
        rental_id: Ulid,
        pickup_address: Option<String>,
        dropoff_address: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(a) = &pickup_address {
            validate_text(a, "pickup address too long")?;
        }
        if let Some(a) = &dropoff_address {
            validate_text(a, "dropoff address too long")?;
        }
        if self.bookings().contains_key(&booking_id) {
            return Err(EngineError::AlreadyExists(booking_id));
        }

        let rental = self
            .get_rental_arc(&rental_id)
            .ok_or(EngineError::NotFound(rental_id))?;
        // vehicle_id never changes after submission, so reading it outside
        // the lock ordering is safe.
        let vehicle_id = rental.read().await.vehicle_id;
        let vehicle = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;

        // Lock order: vehicle first, then rental. Reject/delete take only
        // the rental lock.
        let mut v = vehicle.write_owned().await;
        let r = rental.write_owned().await;

        if !self.vehicles().contains_key(&vehicle_id) {
            return Err(EngineError::NotFound(vehicle_id));
        }
        if !self.rentals().contains_key(&rental_id) {
            return Err(EngineError::NotFound(rental_id));
        }
        if r.status != RentalStatus::Pending {
            return Err(EngineError::InvalidState {
                id: rental_id,
                status: r.status,
            });
        }
        if v.blocked.len() >= MAX_BLOCKED_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
        }

        // Commit-time availability check, under the vehicle write lock.
        if let Some(blocking) = v.first_conflict(&r.span) {
            return Err(EngineError::Conflict(blocking.booking_id));
        }

        let approved_at = now_ms();
        let booking = Booking {
            id: booking_id,
            rental_id,
            vehicle_id,
            renter_id: r.renter_id,
            span: r.span,
            total_price_cents: r.total_price_cents,
            pickup_address: pickup_address.unwrap_or_else(|| DEFAULT_PICKUP_ADDRESS.into()),
            dropoff_address: dropoff_address.unwrap_or_else(|| DEFAULT_DROPOFF_ADDRESS.into()),
            created_at: approved_at,
        };
        let event = Event::RentalApproved {
            booking_id,
            rental_id,
            vehicle_id,
            renter_id: booking.renter_id,
            span: booking.span,
            total_price_cents: booking.total_price_cents,
            pickup_address: booking.pickup_address.clone(),
            dropoff_address: booking.dropoff_address.clone(),
            approved_at,
        };
        // Durability point. On failure nothing has been applied and the
        // request is still pending.
        self.wal_append(&event).await?;

        v.insert_blocked(Blocked {
            booking_id,
            span: booking.span,
        });
        self.bookings().insert(booking_id, booking.clone());
        self.rentals().remove(&rental_id);
        self.notify.send(vehicle_id, &event);
        Ok(booking)
    }
}
